use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    ChainConnector, EventFilter, EventStream, Keystore, OnChainProposal, RawEvent, Receipt, SignedCall,
    SubmitError,
};
use crate::{
    config::ChainConfig,
    types::{BlockNumber, ChainId, ProposalKey, RelayerId, TxHash},
    Error,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// 节点返回的 JSON-RPC 错误或传输错误
#[derive(Debug)]
pub enum RpcError {
    Transport(String),
    Node(String),
}

impl RpcError {
    fn into_error(self) -> Error {
        match self {
            RpcError::Transport(e) => Error::Network(e),
            RpcError::Node(e) => Error::Chain(e),
        }
    }

    fn into_submit_error(self) -> SubmitError {
        match self {
            RpcError::Transport(e) => SubmitError::Transient(e),
            RpcError::Node(e) => SubmitError::classify(&e),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    error: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct RpcClient {
    client: reqwest::Client,
    endpoint: String,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id
            }))
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Transport(format!("{} returned HTTP {}", method, status)));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(format!("invalid {} response: {}", method, e)))?;

        if let Some(error) = body.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RpcError::Node(message));
        }

        // `result: null` 对可选结果是合法的
        serde_json::from_value(body.result)
            .map_err(|e| RpcError::Transport(format!("invalid {} result: {}", method, e)))
    }
}

#[derive(Debug, Deserialize)]
struct ReceiptDto {
    block_number: BlockNumber,
    success: bool,
}

/// 通过链网关的 JSON-RPC 接口访问桥合约/pallet
pub struct JsonRpcConnector {
    chain_id: ChainId,
    rpc: RpcClient,
    poll_interval: Duration,
}

impl JsonRpcConnector {
    pub fn new(chain_id: ChainId, endpoint: &str) -> Self {
        Self {
            chain_id,
            rpc: RpcClient::new(endpoint),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// 建立连接并确认端点可用
    pub async fn connect(config: &ChainConfig) -> Result<Self, Error> {
        let connector = Self::new(config.id, &config.endpoint);
        let head = connector.latest_block().await?;
        debug!(chain = config.id, endpoint = %config.endpoint, head, "Connected to chain");
        Ok(connector)
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }
}

struct PollState {
    rpc: RpcClient,
    filter: EventFilter,
    next_block: BlockNumber,
    pending: VecDeque<RawEvent>,
    poll_interval: Duration,
}

impl PollState {
    async fn fill(&mut self) {
        loop {
            let head: BlockNumber = match self.rpc.call("bridge_blockNumber", serde_json::json!([])).await {
                Ok(head) => head,
                Err(e) => {
                    warn!(error = ?e, "Failed to fetch latest block, retrying");
                    sleep(self.poll_interval).await;
                    continue;
                }
            };
            let safe = head.saturating_sub(self.filter.confirmations);
            if self.next_block > safe {
                sleep(self.poll_interval).await;
                continue;
            }

            let params = serde_json::json!([{
                "address": self.filter.bridge_address,
                "from": self.next_block,
                "to": safe,
                "names": self.filter.event_names,
            }]);
            match self.rpc.call::<Vec<RawEvent>>("bridge_getEvents", params).await {
                Ok(mut events) => {
                    events.sort_by_key(|e| e.block_number);
                    self.pending.extend(events);
                    self.next_block = safe + 1;
                    if !self.pending.is_empty() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = ?e, from = self.next_block, to = safe, "Failed to fetch events, retrying");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChainConnector for JsonRpcConnector {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, Error> {
        let state = PollState {
            rpc: self.rpc.clone(),
            next_block: filter.from_block,
            filter,
            pending: VecDeque::new(),
            poll_interval: self.poll_interval,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.pending.is_empty() {
                state.fill().await;
            }
            let event = state.pending.pop_front()?;
            Some((event, state))
        });
        Ok(stream.boxed())
    }

    async fn submit(&self, call: SignedCall) -> Result<TxHash, SubmitError> {
        self.rpc
            .call("bridge_submitCall", serde_json::json!([call]))
            .await
            .map_err(RpcError::into_submit_error)
    }

    async fn wait_for_inclusion(&self, tx: TxHash, confirmations: u64) -> Result<Receipt, SubmitError> {
        loop {
            let receipt: Option<ReceiptDto> = self
                .rpc
                .call("bridge_getReceipt", serde_json::json!([tx]))
                .await
                .map_err(RpcError::into_submit_error)?;

            if let Some(receipt) = receipt {
                let head: BlockNumber = self
                    .rpc
                    .call("bridge_blockNumber", serde_json::json!([]))
                    .await
                    .map_err(RpcError::into_submit_error)?;
                if head >= receipt.block_number.saturating_add(confirmations) {
                    return Ok(Receipt {
                        tx_hash: tx,
                        block_number: receipt.block_number,
                        success: receipt.success,
                    });
                }
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn latest_block(&self) -> Result<BlockNumber, Error> {
        self.rpc
            .call("bridge_blockNumber", serde_json::json!([]))
            .await
            .map_err(RpcError::into_error)
    }

    async fn proposal_state(&self, key: ProposalKey) -> Result<Option<OnChainProposal>, Error> {
        self.rpc
            .call("bridge_getProposal", serde_json::json!([key]))
            .await
            .map_err(RpcError::into_error)
    }
}

/// 由节点托管密钥并完成签名
pub struct NodeKeystore {
    rpc: RpcClient,
}

impl NodeKeystore {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Keystore for NodeKeystore {
    async fn sign(&self, identity: RelayerId, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        let signature: String = self
            .rpc
            .call(
                "bridge_sign",
                serde_json::json!([{ "identity": identity, "payload": format!("0x{}", hex::encode(&payload)) }]),
            )
            .await
            .map_err(|e| Error::Keystore(format!("{:?}", e)))?;
        hex::decode(signature.trim_start_matches("0x")).map_err(|e| Error::Keystore(e.to_string()))
    }
}
