use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    config::ChainConfig,
    proposal::ProposalStatus,
    types::{BlockNumber, ChainId, DataHash, ProposalKey, RelayerId, ResourceId, TxHash},
    Error,
};

/// 链上原生事件，`data` 的结构由事件名决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub block_number: BlockNumber,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, block_number: BlockNumber, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            block_number,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub bridge_address: String,
    pub from_block: BlockNumber,
    /// 事件所在区块之上至少还要有这么多区块才会被交付
    pub confirmations: u64,
    pub event_names: Vec<String>,
}

/// 无限、不可重启的事件序列，按链上区块顺序交付
pub type EventStream = BoxStream<'static, RawEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallArg {
    ChainId(ChainId),
    Nonce(u64),
    Resource(ResourceId),
    Hash(DataHash),
    Bytes(Vec<u8>),
}

/// 合约方法或 pallet 调用，具体的二进制编码由连接器负责
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCall {
    pub method: String,
    pub args: Vec<CallArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub gas_limit: u64,
    pub gas_price: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCall {
    pub call: ChainCall,
    pub fee: Fee,
    pub signer: RelayerId,
    pub signature: Vec<u8>,
}

impl SignedCall {
    /// 交给密钥库签名的规范字节
    pub fn signing_payload(call: &ChainCall, fee: &Fee, signer: &RelayerId) -> Result<Vec<u8>, Error> {
        bcs::to_bytes(&(call, fee, signer)).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
    pub success: bool,
}

/// 目标链桥合约/pallet 中某个提案的权威状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainProposal {
    pub status: ProposalStatus,
    pub data_hash: DataHash,
    #[serde(default)]
    pub votes: Vec<RelayerId>,
    pub created_at_block: BlockNumber,
    pub expires_at_block: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("transaction underpriced: {0}")]
    Underpriced(String),

    #[error("transaction already known: {0}")]
    AlreadyKnown(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("timed out waiting for inclusion of {0}")]
    Timeout(TxHash),
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_) | SubmitError::Timeout(_))
    }

    /// 按节点返回的错误文本归类
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("underpriced")
            || lower.contains("gas price too low")
            || lower.contains("max fee per gas less than")
            || lower.contains("priority is too low")
        {
            return SubmitError::Underpriced(message.to_string());
        }

        if lower.contains("already known")
            || lower.contains("already imported")
            || lower.contains("known transaction")
            || lower.contains("nonce too low")
            || lower.contains("already voted")
        {
            return SubmitError::AlreadyKnown(message.to_string());
        }

        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("temporarily unavailable")
            || lower.contains("502")
            || lower.contains("503")
        {
            return SubmitError::Transient(message.to_string());
        }

        SubmitError::Rejected(message.to_string())
    }
}

/// 核心对某条链的全部依赖：订阅事件、提交调用、等待上链、读取桥状态
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainConnector: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, Error>;

    async fn submit(&self, call: SignedCall) -> Result<TxHash, SubmitError>;

    async fn wait_for_inclusion(&self, tx: TxHash, confirmations: u64) -> Result<Receipt, SubmitError>;

    async fn latest_block(&self) -> Result<BlockNumber, Error>;

    async fn proposal_state(&self, key: ProposalKey) -> Result<Option<OnChainProposal>, Error>;
}

/// 签名后端，核心永远接触不到私钥
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn sign(&self, identity: RelayerId, payload: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// 每条链建立连接时得到的一组能力
#[derive(Clone)]
pub struct ChainHandle {
    pub connector: Arc<dyn ChainConnector>,
    pub keystore: Arc<dyn Keystore>,
}

/// 连接器工厂，根据链配置创建对应的连接
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, config: &ChainConfig) -> Result<ChainHandle, Error>;
}

pub struct DefaultConnectorFactory;

#[async_trait]
impl ConnectorFactory for DefaultConnectorFactory {
    async fn connect(&self, config: &ChainConfig) -> Result<ChainHandle, Error> {
        let connector = Arc::new(JsonRpcConnector::connect(config).await?);
        let keystore = Arc::new(NodeKeystore::new(connector.rpc().clone()));
        Ok(ChainHandle { connector, keystore })
    }
}

pub mod jsonrpc;

pub use jsonrpc::{JsonRpcConnector, NodeKeystore};
