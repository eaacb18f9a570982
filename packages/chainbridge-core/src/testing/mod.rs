//! 内存中的桥链，实现 [`ChainConnector`]，按桥合约的投票规则处理提案。
//!
//! 用于多中继者场景的测试与本地演示：多个中继者共享同一个 [`InMemoryChain`]，
//! 各自用不同的身份提交调用。

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{
    chain_adapter::{
        CallArg, ChainConnector, ChainHandle, ConnectorFactory, EventFilter, EventStream, Keystore,
        OnChainProposal, RawEvent, Receipt, SignedCall, SubmitError,
    },
    config::ChainConfig,
    proposal::ProposalStatus,
    types::{keccak256, BlockNumber, ChainId, DataHash, ProposalKey, RelayerId, ResourceId, TxHash},
    Error,
};

/// 签名为 `keccak256(identity ++ payload)`，链端可以据此校验
pub struct TestKeystore;

impl TestKeystore {
    pub fn signature_for(identity: &RelayerId, payload: &[u8]) -> Vec<u8> {
        let mut preimage = identity.as_bytes().to_vec();
        preimage.extend_from_slice(payload);
        keccak256(&preimage).as_bytes().to_vec()
    }
}

#[async_trait]
impl Keystore for TestKeystore {
    async fn sign(&self, identity: RelayerId, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(Self::signature_for(&identity, &payload))
    }
}

#[derive(Default)]
struct ChainState {
    block: BlockNumber,
    proposals: HashMap<ProposalKey, OnChainProposal>,
    executions: HashMap<ProposalKey, usize>,
    receipts: HashMap<TxHash, Receipt>,
    failures: VecDeque<SubmitError>,
    submitted: Vec<SignedCall>,
    tx_count: u64,
    subscribers: Vec<mpsc::UnboundedSender<RawEvent>>,
}

pub struct InMemoryChain {
    chain: ChainId,
    threshold: usize,
    expiry: BlockNumber,
    state: Mutex<ChainState>,
}

enum Action {
    Vote(ProposalKey, DataHash),
    Execute(ProposalKey, Vec<u8>),
}

impl InMemoryChain {
    pub fn new(chain: ChainId, threshold: usize, expiry: BlockNumber) -> Self {
        Self {
            chain,
            threshold: threshold.max(1),
            expiry,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        // 锁内不会 panic，中毒的锁仍然可用
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 向所有订阅者推送一个事件，并把链高推进到事件所在区块
    pub fn emit(&self, name: &str, data: serde_json::Value) {
        let mut state = self.state();
        state.block += 1;
        let event = RawEvent::new(name, state.block, data);
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn advance(&self, blocks: BlockNumber) {
        self.state().block += blocks;
    }

    /// 让接下来的提交依次以这些错误失败
    pub fn fail_next(&self, errors: impl IntoIterator<Item = SubmitError>) {
        self.state().failures.extend(errors);
    }

    pub fn proposal(&self, key: &ProposalKey) -> Option<OnChainProposal> {
        self.state().proposals.get(key).cloned()
    }

    pub fn executions(&self, key: &ProposalKey) -> usize {
        self.state().executions.get(key).copied().unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn submitted(&self) -> Vec<SignedCall> {
        self.state().submitted.clone()
    }

    fn parse(call: &SignedCall) -> Result<Action, SubmitError> {
        let mut source = None;
        let mut nonce = None;
        let mut resource: Option<ResourceId> = None;
        let mut hash = None;
        let mut data = None;
        for arg in &call.call.args {
            match arg {
                CallArg::ChainId(c) => source = Some(*c),
                CallArg::Nonce(n) => nonce = Some(*n),
                CallArg::Resource(r) => resource = Some(*r),
                CallArg::Hash(h) => hash = Some(*h),
                CallArg::Bytes(b) => data = Some(b.clone()),
            }
        }
        let key = match (source, nonce, resource) {
            (Some(source), Some(deposit_nonce), Some(resource_id)) => ProposalKey {
                source,
                deposit_nonce,
                resource_id,
            },
            _ => return Err(SubmitError::Rejected("missing proposal key arguments".to_string())),
        };

        match call.call.method.as_str() {
            "createDepositProposal" | "voteDepositProposal" | "ChainBridge.acknowledge_proposal" => hash
                .map(|h| Action::Vote(key, h))
                .ok_or_else(|| SubmitError::Rejected("missing data hash".to_string())),
            "executeDeposit" | "ChainBridge.eval_vote_state" => data
                .map(|d| Action::Execute(key, d))
                .ok_or_else(|| SubmitError::Rejected("missing deposit data".to_string())),
            other => Err(SubmitError::Rejected(format!("unknown method {}", other))),
        }
    }

    fn expire(proposal: &mut OnChainProposal, block: BlockNumber) {
        if proposal.status == ProposalStatus::Active && block > proposal.expires_at_block {
            proposal.status = ProposalStatus::Cancelled;
        }
    }

    fn apply(&self, state: &mut ChainState, call: &SignedCall) -> Result<Option<RawEvent>, SubmitError> {
        let block = state.block;
        match Self::parse(call)? {
            Action::Vote(key, data_hash) => {
                let threshold = self.threshold;
                let proposal = state.proposals.entry(key).or_insert_with(|| OnChainProposal {
                    status: ProposalStatus::Active,
                    data_hash,
                    votes: Vec::new(),
                    created_at_block: block,
                    expires_at_block: block + self.expiry,
                });
                Self::expire(proposal, block);
                if proposal.status != ProposalStatus::Active && proposal.status != ProposalStatus::Passed {
                    return Err(SubmitError::Rejected(format!("proposal already {}", proposal.status)));
                }
                if proposal.data_hash != data_hash {
                    return Err(SubmitError::Rejected("data hash mismatch".to_string()));
                }
                if proposal.votes.contains(&call.signer) {
                    return Err(SubmitError::AlreadyKnown("relayer already voted".to_string()));
                }
                proposal.votes.push(call.signer.clone());
                if proposal.status == ProposalStatus::Active && proposal.votes.len() >= threshold {
                    proposal.status = ProposalStatus::Passed;
                }
                Ok(Some(RawEvent::new(
                    "ProposalVote",
                    block,
                    serde_json::json!({
                        "originChainId": key.source,
                        "depositNonce": key.deposit_nonce,
                        "resourceId": key.resource_id,
                        "dataHash": data_hash,
                        "voter": call.signer,
                    }),
                )))
            }
            Action::Execute(key, data) => {
                let proposal = state
                    .proposals
                    .get_mut(&key)
                    .ok_or_else(|| SubmitError::Rejected("proposal not found".to_string()))?;
                Self::expire(proposal, block);
                if proposal.status != ProposalStatus::Passed {
                    return Err(SubmitError::Rejected(format!("proposal is {}", proposal.status)));
                }
                if keccak256(&data) != proposal.data_hash {
                    return Err(SubmitError::Rejected("deposit data does not match data hash".to_string()));
                }
                proposal.status = ProposalStatus::Executed;
                *state.executions.entry(key).or_default() += 1;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ChainConnector for InMemoryChain {
    fn chain_id(&self) -> ChainId {
        self.chain
    }

    async fn subscribe(&self, _filter: EventFilter) -> Result<EventStream, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
    }

    async fn submit(&self, call: SignedCall) -> Result<TxHash, SubmitError> {
        let mut state = self.state();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let payload = SignedCall::signing_payload(&call.call, &call.fee, &call.signer)
            .map_err(|e| SubmitError::Rejected(e.to_string()))?;
        if call.signature != TestKeystore::signature_for(&call.signer, &payload) {
            return Err(SubmitError::Rejected("invalid signature".to_string()));
        }

        let event = self.apply(&mut state, &call)?;
        state.submitted.push(call);
        state.tx_count += 1;
        state.block += 1;
        let tx_hash = TxHash(state.tx_count.to_be_bytes().to_vec());
        let receipt = Receipt {
            tx_hash: tx_hash.clone(),
            block_number: state.block,
            success: true,
        };
        state.receipts.insert(tx_hash.clone(), receipt);
        if let Some(event) = event {
            state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(tx_hash)
    }

    async fn wait_for_inclusion(&self, tx: TxHash, _confirmations: u64) -> Result<Receipt, SubmitError> {
        self.state().receipts.get(&tx).cloned().ok_or(SubmitError::Timeout(tx))
    }

    async fn latest_block(&self) -> Result<BlockNumber, Error> {
        Ok(self.state().block)
    }

    async fn proposal_state(&self, key: ProposalKey) -> Result<Option<OnChainProposal>, Error> {
        let mut state = self.state();
        let block = state.block;
        Ok(state.proposals.get_mut(&key).map(|p| {
            Self::expire(p, block);
            p.clone()
        }))
    }
}

/// 按链 id 提供共享的内存链，多个中继者可以连接到同一组链
#[derive(Default, Clone)]
pub struct InMemoryFactory {
    chains: HashMap<ChainId, Arc<InMemoryChain>>,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain: Arc<InMemoryChain>) -> Self {
        self.chains.insert(chain.chain_id(), chain);
        self
    }
}

#[async_trait]
impl ConnectorFactory for InMemoryFactory {
    async fn connect(&self, config: &ChainConfig) -> Result<ChainHandle, Error> {
        let chain = self
            .chains
            .get(&config.id)
            .cloned()
            .ok_or_else(|| Error::Chain(format!("No in-memory chain {}", config.id)))?;
        Ok(ChainHandle {
            connector: chain,
            keystore: Arc::new(TestKeystore),
        })
    }
}
