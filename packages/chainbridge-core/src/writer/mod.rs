//! 目标链写入：把路由来的消息变成投票和执行交易，并维护本地提案记录。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::{
    chain_adapter::{ChainCall, ChainConnector, ChainHandle, Keystore, OnChainProposal, Receipt, SignedCall, SubmitError},
    config::{ChainConfig, ChainKind, RelayerConfig},
    proposal::{ProposalEntry, ProposalStatus, ProposalStore, VoteOutcome},
    types::{BlockNumber, ChainId, DataHash, ProposalKey, RelayerId},
    Error, Message, MessageType,
};

pub mod evm;
pub mod retry;
pub mod substrate;

pub use retry::{RetryAction, RetryPolicy, RetryState};

/// 把提案操作编码成某类链上的具体调用
pub trait CallBuilder: Send + Sync {
    fn create_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall;

    fn vote_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall;

    fn execute_proposal(&self, key: &ProposalKey, deposit_data: &[u8]) -> ChainCall;
}

pub fn call_builder(kind: ChainKind) -> Box<dyn CallBuilder> {
    match kind {
        ChainKind::Evm => Box::new(evm::EvmCalls),
        ChainKind::Substrate => Box::new(substrate::SubstrateCalls),
    }
}

/// 一条消息处理完之后提案所处的情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 本中继者的发起或投票交易已上链
    Voted { status: ProposalStatus },
    /// 记录了其他中继者的投票
    Observed { status: ProposalStatus },
    /// 本中继者已经投过票，没有提交任何交易
    AlreadyVoted { status: ProposalStatus },
    Executed,
}

pub struct Writer {
    chain: ChainId,
    identity: RelayerId,
    connector: Arc<dyn ChainConnector>,
    keystore: Arc<dyn Keystore>,
    store: Arc<ProposalStore>,
    calls: Box<dyn CallBuilder>,
    policy: RetryPolicy,
    confirmations: u64,
    inclusion_timeout: Duration,
    // 同一签名身份的提交必须串行，tokio 的 Mutex 按到达顺序唤醒
    submit_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl Writer {
    pub fn new(
        config: &ChainConfig,
        relayer: &RelayerConfig,
        handle: ChainHandle,
        store: Arc<ProposalStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        Ok(Self {
            chain: config.id,
            identity: config.relayer_id()?,
            connector: handle.connector,
            keystore: handle.keystore,
            store,
            calls: call_builder(config.kind),
            policy: RetryPolicy::new(relayer, config),
            confirmations: config.block_confirmations,
            inclusion_timeout: relayer.inclusion_timeout(),
            submit_lock: Mutex::new(()),
            shutdown,
        })
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn store(&self) -> &Arc<ProposalStore> {
        &self.store
    }

    /// 唯一入口。返回 false 表示消息没有产生效果，原因已经记录在日志里。
    pub async fn resolve_message(&self, message: Message) -> bool {
        let key = message.proposal_key();
        let kind = message.message_type();
        match self.handle(message).await {
            Ok(resolution) => {
                debug!(chain = self.chain, proposal = %key, %kind, ?resolution, "Message resolved");
                true
            }
            Err(e @ (Error::ProposalFinalized { .. } | Error::ProposalNotPassed { .. })) => {
                debug!(chain = self.chain, proposal = %key, %kind, error = %e, "Message has no effect");
                false
            }
            Err(e @ (Error::ProposalDataMismatch { .. } | Error::InvalidMessage(_))) => {
                warn!(chain = self.chain, proposal = %key, %kind, error = %e, "Rejected message");
                false
            }
            Err(Error::Shutdown) => {
                info!(chain = self.chain, proposal = %key, %kind, "Abandoned message on shutdown");
                false
            }
            Err(e) => {
                error!(chain = self.chain, proposal = %key, %kind, error = %e, "Failed to resolve message");
                false
            }
        }
    }

    pub async fn handle(&self, message: Message) -> Result<Resolution, Error> {
        if message.destination() != self.chain {
            return Err(Error::InvalidMessage(format!(
                "message for chain {} delivered to writer for chain {}",
                message.destination(),
                self.chain
            )));
        }
        match message.message_type() {
            MessageType::FungibleTransfer | MessageType::NonFungibleTransfer | MessageType::GenericTransfer => {
                let proposal = Message::proposal_for(&message, self.identity.clone())?;
                self.handle_proposal(proposal).await
            }
            MessageType::CreateDepositProposal | MessageType::VoteDepositProposal => {
                self.handle_proposal(message).await
            }
            MessageType::ExecuteDeposit => self.handle_execute(message).await,
        }
    }

    /// 取得提案的独占作用域，必要时先与链上状态核对
    async fn lock_verified(&self, key: ProposalKey) -> Result<ProposalEntry, Error> {
        let mut entry = self.store.lock(key).await;
        if entry.needs_reconcile() {
            let on_chain = self.read_proposal(key).await?;
            entry.reconcile(on_chain);
        }
        Ok(entry)
    }

    /// 到期求值。本地窗口已过时先读一次链上状态，链上仍然有效的提案不会被本地取消。
    async fn evaluate(&self, entry: &mut ProposalEntry, block: BlockNumber) -> Result<ProposalStatus, Error> {
        if entry.is_expired(block) {
            debug!(chain = self.chain, proposal = %entry.key(), block, "Local window closed, checking chain state");
            let on_chain = self.read_proposal(entry.key()).await?;
            entry.reconcile(on_chain);
        }
        Ok(entry.evaluate(block))
    }

    async fn handle_proposal(&self, message: Message) -> Result<Resolution, Error> {
        let key = message.proposal_key();
        let data_hash = message.data_hash()?;
        let relayer = message
            .relayer()
            .cloned()
            .ok_or_else(|| Error::InvalidMessage(format!("{} message names no relayer", message.message_type())))?;
        let deposit_data = message.deposit_data().map(|d| d.to_vec());

        let mut entry = self.lock_verified(key).await?;
        let block = self.latest_block().await?;
        self.evaluate(&mut entry, block).await?;
        let outcome = entry.check_vote(&data_hash, &relayer, block)?;

        let resolution = if relayer != self.identity {
            let transition = entry.vote(data_hash, &relayer, block)?;
            Resolution::Observed {
                status: transition.status,
            }
        } else {
            self.cast_vote(&mut entry, outcome, data_hash, block).await?
        };
        // 记录存在之后才能挂上充值数据
        if let Some(data) = deposit_data {
            entry.attach_deposit_data(data);
        }

        let can_execute = entry.status() == ProposalStatus::Passed
            && entry.proposal().map_or(false, |p| p.deposit_data().is_some());
        if can_execute {
            return self.execute(&mut entry).await;
        }
        Ok(resolution)
    }

    /// 提交本中继者的发起或投票交易，上链之后才更新本地记录
    async fn cast_vote(
        &self,
        entry: &mut ProposalEntry,
        outcome: VoteOutcome,
        data_hash: DataHash,
        block: BlockNumber,
    ) -> Result<Resolution, Error> {
        let key = entry.key();
        let receipt = match outcome {
            VoteOutcome::AlreadyVoted => return Ok(Resolution::AlreadyVoted { status: entry.status() }),
            VoteOutcome::Recorded => self.submit_with_retry(&self.calls.vote_proposal(&key, data_hash)).await?,
            VoteOutcome::Created => match self.submit_with_retry(&self.calls.create_proposal(&key, data_hash)).await {
                Ok(receipt) => receipt,
                Err(Error::Submit(SubmitError::Rejected(reason))) => {
                    // 读取链上状态到提交之间，其他中继者可能已经发起了同一提案
                    warn!(chain = self.chain, proposal = %key, %reason, "Create rejected, checking chain state");
                    let on_chain = self.read_proposal(key).await?;
                    entry.reconcile(on_chain);
                    match entry.check_vote(&data_hash, &self.identity, block)? {
                        VoteOutcome::Created => return Err(SubmitError::Rejected(reason).into()),
                        VoteOutcome::AlreadyVoted => {
                            return Ok(Resolution::AlreadyVoted { status: entry.status() })
                        }
                        VoteOutcome::Recorded => {
                            info!(chain = self.chain, proposal = %key, "Proposal already exists, voting instead");
                            self.submit_with_retry(&self.calls.vote_proposal(&key, data_hash)).await?
                        }
                    }
                }
                Err(e) => return Err(e),
            },
        };

        // 有效期从交易上链的区块算起
        let at = receipt.map_or(block, |r| r.block_number.max(block));
        let transition = entry.propose(data_hash, &self.identity, None, at)?;
        info!(
            chain = self.chain,
            proposal = %key,
            outcome = ?transition.outcome,
            status = %transition.status,
            block = at,
            "Submitted vote"
        );
        Ok(Resolution::Voted {
            status: transition.status,
        })
    }

    async fn handle_execute(&self, message: Message) -> Result<Resolution, Error> {
        let key = message.proposal_key();
        let mut entry = self.lock_verified(key).await?;
        if let Some(data) = message.deposit_data() {
            entry.attach_deposit_data(data.to_vec());
        }
        let block = self.latest_block().await?;
        match self.evaluate(&mut entry, block).await? {
            ProposalStatus::Passed => self.execute(&mut entry).await,
            status if status.is_terminal() => Err(Error::ProposalFinalized { key, status }),
            status => Err(Error::ProposalNotPassed { key, status }),
        }
    }

    /// 提交执行交易。执行被永久拒绝时读取链上状态，其他中继者可能已经执行过。
    async fn execute(&self, entry: &mut ProposalEntry) -> Result<Resolution, Error> {
        let key = entry.key();
        let data = entry
            .proposal()
            .and_then(|p| p.deposit_data())
            .map(|d| d.to_vec())
            .ok_or_else(|| Error::InvalidMessage(format!("no deposit data known for proposal {}", key)))?;
        let call = self.calls.execute_proposal(&key, &data);

        match self.submit_with_retry(&call).await {
            Ok(_) => {
                entry.mark_executed()?;
                Ok(Resolution::Executed)
            }
            Err(Error::Submit(e)) if !e.is_transient() => {
                warn!(chain = self.chain, proposal = %key, error = %e, "Execution rejected, checking chain state");
                let on_chain = self.read_proposal(key).await?;
                entry.reconcile(on_chain);
                if entry.status() == ProposalStatus::Executed {
                    info!(chain = self.chain, proposal = %key, "Proposal was executed by another relayer");
                    Ok(Resolution::Executed)
                } else {
                    Err(Error::Submit(e))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// 读取链上数据，网络错误按重试策略退避
    async fn read_chain<T, F, Fut>(&self, what: &'static str, mut read: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut state = RetryState::new(&self.policy);
        loop {
            let error = match read().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            match state.on_transient(&self.policy) {
                Some(after) => {
                    debug!(chain = self.chain, read = what, attempt = state.attempt(), ?after, error = %error, "Chain read failed, backing off");
                    self.wait_for_next_attempt(&state).await?;
                }
                None => {
                    warn!(chain = self.chain, read = what, attempts = state.attempt(), error = %error, "Chain read failed, giving up");
                    return Err(error);
                }
            }
        }
    }

    async fn latest_block(&self) -> Result<BlockNumber, Error> {
        self.read_chain("latest block", || self.connector.latest_block()).await
    }

    async fn read_proposal(&self, key: ProposalKey) -> Result<Option<OnChainProposal>, Error> {
        self.read_chain("proposal state", || self.connector.proposal_state(key)).await
    }

    /// 等到重试状态记下的下一次尝试时间，关闭信号会打断等待
    async fn wait_for_next_attempt(&self, state: &RetryState) -> Result<(), Error> {
        let deadline = match state.next_attempt_at() {
            Some(deadline) if deadline > Instant::now() => deadline,
            _ => return Ok(()),
        };
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = sleep_until(deadline) => Ok(()),
            _ = shutdown.changed() => Err(Error::Shutdown),
        }
    }

    /// 提交并等待上链。节点表示调用已被接受过时没有回执，返回 None。
    async fn submit_with_retry(&self, call: &ChainCall) -> Result<Option<Receipt>, Error> {
        let mut state = RetryState::new(&self.policy);
        loop {
            let error = match self.submit_once(call, &state).await {
                Ok(receipt) => {
                    debug!(
                        chain = self.chain,
                        method = %call.method,
                        tx = %receipt.tx_hash,
                        block = receipt.block_number,
                        "Transaction included"
                    );
                    return Ok(Some(receipt));
                }
                Err(Error::Submit(e)) => e,
                Err(e) => return Err(e),
            };

            match state.on_failure(&self.policy, error) {
                RetryAction::AlreadyDone => {
                    debug!(chain = self.chain, method = %call.method, "Call already accepted by the node");
                    return Ok(None);
                }
                RetryAction::GiveUp(e) => {
                    warn!(
                        chain = self.chain,
                        method = %call.method,
                        attempts = state.attempt(),
                        error = %e,
                        "Giving up on call"
                    );
                    return Err(Error::Submit(e));
                }
                RetryAction::Retry { .. } => self.wait_for_next_attempt(&state).await?,
            }
        }
    }

    async fn submit_once(&self, call: &ChainCall, state: &RetryState) -> Result<Receipt, Error> {
        let _guard = self.submit_lock.lock().await;
        let fee = state.fee();
        let payload = SignedCall::signing_payload(call, &fee, &self.identity)?;
        let signature = self.keystore.sign(self.identity.clone(), payload).await?;
        let signed = SignedCall {
            call: call.clone(),
            fee,
            signer: self.identity.clone(),
            signature,
        };

        let tx = self.connector.submit(signed).await?;
        debug!(chain = self.chain, method = %call.method, %tx, gas_price = fee.gas_price, "Transaction submitted");
        let receipt = match timeout(
            self.inclusion_timeout,
            self.connector.wait_for_inclusion(tx.clone(), self.confirmations),
        )
        .await
        {
            Ok(receipt) => receipt?,
            Err(_) => return Err(SubmitError::Timeout(tx).into()),
        };
        if !receipt.success {
            return Err(SubmitError::Rejected(format!("transaction {} reverted", receipt.tx_hash)).into());
        }
        Ok(receipt)
    }

    /// 消费收件箱直到关闭信号，然后等待在途消息处理完
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Message>, max_in_flight: usize) -> Result<(), Error> {
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        let mut shutdown = self.shutdown.clone();
        info!(chain = self.chain, identity = %self.identity, "Writer started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(chain = self.chain, error = %e, "Writer task panicked");
                    }
                }
                next = inbox.recv() => {
                    let message = match next {
                        Some(message) => message,
                        None => break,
                    };
                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Chain(e.to_string()))?;
                    let writer = self.clone();
                    tasks.spawn(async move {
                        writer.resolve_message(message).await;
                        drop(permit);
                    });
                }
            }
        }

        info!(chain = self.chain, in_flight = tasks.len(), "Writer draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(chain = self.chain, error = %e, "Writer task panicked");
            }
        }
        info!(chain = self.chain, "Writer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::{MockChainConnector, MockKeystore, OnChainProposal};
    use crate::testing::{InMemoryChain, TestKeystore};
    use crate::types::{ResourceId, TxHash};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const ME: u8 = 0xa1;
    const OTHER: u8 = 0xb2;

    fn chain_config(from: u8) -> ChainConfig {
        serde_json::from_value(serde_json::json!({
            "id": 2,
            "name": "dest",
            "kind": "evm",
            "endpoint": "http://localhost",
            "from": format!("0x{:02x}", from),
            "bridge_address": "0xbridge",
            "gas_price": 100,
            "max_gas_price": 1000,
            "block_confirmations": 0
        }))
        .unwrap()
    }

    fn relayer_config() -> RelayerConfig {
        RelayerConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            inclusion_timeout_secs: 1,
            ..RelayerConfig::default()
        }
    }

    fn transfer(nonce: u64) -> Message {
        Message::fungible_transfer(1, 2, nonce, 500, ResourceId([9; 32]), vec![0xcc; 20]).unwrap()
    }

    fn writer_with(
        connector: impl ChainConnector + 'static,
        threshold: usize,
        from: u8,
    ) -> (Writer, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut keystore = MockKeystore::new();
        keystore.expect_sign().returning(|_, payload| Ok(payload[..4].to_vec()));
        let handle = ChainHandle {
            connector: Arc::new(connector),
            keystore: Arc::new(keystore),
        };
        let store = Arc::new(ProposalStore::new(2, threshold, 100));
        let writer = Writer::new(&chain_config(from), &relayer_config(), handle, store, rx).unwrap();
        (writer, tx)
    }

    /// 链上没有提案、交易都能上链的连接器；`submit` 的行为由调用方提供
    fn mock_connector<F>(submit: F) -> MockChainConnector
    where
        F: FnMut(SignedCall) -> Result<TxHash, SubmitError> + Send + 'static,
    {
        let mut mock = MockChainConnector::new();
        mock.expect_chain_id().return_const(2u8);
        mock.expect_latest_block().returning(|| Ok(10));
        mock.expect_proposal_state().returning(|_| Ok(None));
        mock.expect_submit().returning(submit);
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: true,
            })
        });
        mock
    }

    #[tokio::test]
    async fn test_underpriced_bumps_fee_once() {
        let prices = Arc::new(StdMutex::new(Vec::new()));
        let seen = prices.clone();
        let connector = mock_connector(move |call| {
            let mut seen = seen.lock().unwrap();
            seen.push(call.fee.gas_price);
            if seen.len() == 1 {
                Err(SubmitError::Underpriced("replacement transaction underpriced".into()))
            } else {
                Ok(TxHash(vec![seen.len() as u8]))
            }
        });
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        let resolution = writer.handle(transfer(1)).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Voted {
                status: ProposalStatus::Active
            }
        );
        assert_eq!(*prices.lock().unwrap(), vec![100, 120]);
    }

    #[tokio::test]
    async fn test_already_known_counts_as_success() {
        let connector = mock_connector(|_| Err(SubmitError::AlreadyKnown("already known".into())));
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        assert!(writer.resolve_message(transfer(1)).await);
        let proposal = writer.store().get(&transfer(1).proposal_key()).await.unwrap();
        assert!(proposal.votes().contains(&RelayerId(vec![ME])));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let connector = mock_connector(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SubmitError::Transient("503 service unavailable".into()))
            } else {
                Ok(TxHash(vec![1]))
            }
        });
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        assert!(writer.resolve_message(transfer(1)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried_and_not_recorded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let connector = mock_connector(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(SubmitError::Rejected("execution reverted".into()))
        });
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        assert!(!writer.resolve_message(transfer(1)).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(writer.store().get(&transfer(1).proposal_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_rejected() {
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(|| Ok(10));
        mock.expect_proposal_state().returning(|_| Ok(None));
        mock.expect_submit().times(1).returning(|_| Ok(TxHash(vec![7])));
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: false,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 2, ME);

        let err = writer.handle(transfer(1)).await.unwrap_err();
        assert!(matches!(err, Error::Submit(SubmitError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_no_duplicate_vote() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let connector = mock_connector(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TxHash(vec![1]))
        });
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        writer.handle(transfer(1)).await.unwrap();
        // 同一笔充值再次到达，以及链上回放的本中继者投票事件
        let again = writer.handle(transfer(1)).await.unwrap();
        assert_eq!(
            again,
            Resolution::AlreadyVoted {
                status: ProposalStatus::Active
            }
        );
        let proposal = Message::proposal_for(&transfer(1), RelayerId(vec![ME])).unwrap();
        let echo = Message::vote_deposit_proposal(
            1,
            2,
            1,
            ResourceId([9; 32]),
            proposal.data_hash().unwrap(),
            RelayerId(vec![ME]),
        )
        .unwrap();
        writer.handle(echo).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreign_vote_passes_and_executes() {
        let methods = Arc::new(StdMutex::new(Vec::new()));
        let seen = methods.clone();
        let connector = mock_connector(move |call| {
            seen.lock().unwrap().push(call.call.method.clone());
            Ok(TxHash(vec![1]))
        });
        let (writer, _shutdown) = writer_with(connector, 2, ME);

        writer.handle(transfer(1)).await.unwrap();
        let hash = transfer(1).data_hash().unwrap();
        let vote = Message::vote_deposit_proposal(1, 2, 1, ResourceId([9; 32]), hash, RelayerId(vec![OTHER])).unwrap();
        assert_eq!(writer.handle(vote).await.unwrap(), Resolution::Executed);

        assert_eq!(
            *methods.lock().unwrap(),
            vec!["createDepositProposal".to_string(), "executeDeposit".to_string()]
        );
        let proposal = writer.store().get(&transfer(1).proposal_key()).await.unwrap();
        assert_eq!(proposal.status(), ProposalStatus::Executed);
    }

    #[tokio::test]
    async fn test_mismatched_vote_is_rejected_without_mutation() {
        let connector = mock_connector(|_| Ok(TxHash(vec![1])));
        let (writer, _shutdown) = writer_with(connector, 3, ME);

        writer.handle(transfer(1)).await.unwrap();
        let vote = Message::vote_deposit_proposal(1, 2, 1, ResourceId([9; 32]), DataHash([0xee; 32]), RelayerId(vec![OTHER]))
            .unwrap();
        assert!(matches!(
            writer.handle(vote).await,
            Err(Error::ProposalDataMismatch { .. })
        ));
        let proposal = writer.store().get(&transfer(1).proposal_key()).await.unwrap();
        assert_eq!(proposal.votes().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_execution_reconciles_with_chain() {
        let mut mock = MockChainConnector::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let transfer = transfer(1);
        let hash = transfer.data_hash().unwrap();
        mock.expect_latest_block().returning(|| Ok(10));
        mock.expect_proposal_state().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(OnChainProposal {
                    status: ProposalStatus::Executed,
                    data_hash: hash,
                    votes: vec![RelayerId(vec![ME]), RelayerId(vec![OTHER])],
                    created_at_block: 10,
                    expires_at_block: 110,
                }))
            }
        });
        mock.expect_submit().returning(|call| {
            if call.call.method == "executeDeposit" {
                Err(SubmitError::Rejected("proposal already executed".into()))
            } else {
                Ok(TxHash(vec![1]))
            }
        });
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: true,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 1, ME);

        assert_eq!(writer.handle(transfer.clone()).await.unwrap(), Resolution::Executed);
        let proposal = writer.store().get(&transfer.proposal_key()).await.unwrap();
        assert_eq!(proposal.status(), ProposalStatus::Executed);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_chain_reads_are_retried() {
        let reads = Arc::new(AtomicUsize::new(0));
        let submits = Arc::new(AtomicUsize::new(0));
        let (read_counter, submit_counter) = (reads.clone(), submits.clone());
        let blocks = Arc::new(AtomicUsize::new(0));
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(move || {
            if blocks.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Network("operation timed out".into()))
            } else {
                Ok(10)
            }
        });
        mock.expect_proposal_state().returning(move |_| {
            if read_counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Network("connection reset by peer".into()))
            } else {
                Ok(None)
            }
        });
        mock.expect_submit().returning(move |_| {
            submit_counter.fetch_add(1, Ordering::SeqCst);
            Ok(TxHash(vec![1]))
        });
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: true,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 2, ME);

        assert!(writer.resolve_message(transfer(1)).await);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(submits.load(Ordering::SeqCst), 1);
        assert!(writer.store().get(&transfer(1).proposal_key()).await.is_some());
    }

    #[tokio::test]
    async fn test_chain_reads_give_up_after_max_retries() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(|| Ok(10));
        mock.expect_proposal_state().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("connection refused".into()))
        });
        mock.expect_submit().never();
        let (writer, _shutdown) = writer_with(mock, 2, ME);

        assert!(matches!(writer.handle(transfer(1)).await, Err(Error::Network(_))));
        // 首次读取加上 max_retries 次重试
        assert_eq!(reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_create_race_falls_back_to_vote() {
        let transfer = transfer(1);
        let hash = transfer.data_hash().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let methods = Arc::new(StdMutex::new(Vec::new()));
        let seen = methods.clone();
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(|| Ok(10));
        mock.expect_proposal_state().returning(move |_| {
            // 第一次读取时还没有提案，提交前被其他中继者抢先发起
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(OnChainProposal {
                    status: ProposalStatus::Active,
                    data_hash: hash,
                    votes: vec![RelayerId(vec![OTHER])],
                    created_at_block: 10,
                    expires_at_block: 110,
                }))
            }
        });
        mock.expect_submit().returning(move |call| {
            seen.lock().unwrap().push(call.call.method.clone());
            if call.call.method == "createDepositProposal" {
                Err(SubmitError::Rejected("proposal already exists".into()))
            } else {
                Ok(TxHash(vec![2]))
            }
        });
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: true,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 3, ME);

        assert_eq!(
            writer.handle(transfer.clone()).await.unwrap(),
            Resolution::Voted {
                status: ProposalStatus::Active
            }
        );
        assert_eq!(
            *methods.lock().unwrap(),
            vec!["createDepositProposal".to_string(), "voteDepositProposal".to_string()]
        );
        let proposal = writer.store().get(&transfer.proposal_key()).await.unwrap();
        assert!(proposal.votes().contains(&RelayerId(vec![ME])));
        assert!(proposal.votes().contains(&RelayerId(vec![OTHER])));
        assert!(proposal.deposit_data().is_some());
    }

    #[tokio::test]
    async fn test_expiry_window_starts_at_inclusion_block() {
        let blocks = Arc::new(AtomicUsize::new(0));
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(move || {
            if blocks.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(10)
            } else {
                Ok(112)
            }
        });
        mock.expect_proposal_state().returning(|_| Ok(None));
        mock.expect_submit().returning(|_| Ok(TxHash(vec![1])));
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 15,
                success: true,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 3, ME);

        writer.handle(transfer(1)).await.unwrap();
        let proposal = writer.store().get(&transfer(1).proposal_key()).await.unwrap();
        assert_eq!(proposal.created_at_block(), 15);
        assert_eq!(proposal.expires_at_block(), 115);

        let hash = transfer(1).data_hash().unwrap();
        let vote = Message::vote_deposit_proposal(1, 2, 1, ResourceId([9; 32]), hash, RelayerId(vec![OTHER])).unwrap();
        assert_eq!(
            writer.handle(vote).await.unwrap(),
            Resolution::Observed {
                status: ProposalStatus::Active
            }
        );
    }

    #[tokio::test]
    async fn test_local_expiry_defers_to_chain() {
        let transfer = transfer(1);
        let hash = transfer.data_hash().unwrap();
        let blocks = Arc::new(AtomicUsize::new(0));
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let mut mock = MockChainConnector::new();
        mock.expect_latest_block().returning(move || {
            if blocks.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(10)
            } else {
                Ok(150)
            }
        });
        mock.expect_proposal_state().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(OnChainProposal {
                    status: ProposalStatus::Active,
                    data_hash: hash,
                    votes: vec![RelayerId(vec![ME])],
                    created_at_block: 100,
                    expires_at_block: 200,
                }))
            }
        });
        mock.expect_submit().returning(|_| Ok(TxHash(vec![1])));
        mock.expect_wait_for_inclusion().returning(|tx, _| {
            Ok(Receipt {
                tx_hash: tx,
                block_number: 11,
                success: true,
            })
        });
        let (writer, _shutdown) = writer_with(mock, 3, ME);

        writer.handle(transfer.clone()).await.unwrap();
        // 本地窗口在 111 关闭，链上仍然有效到 200
        let vote = Message::vote_deposit_proposal(1, 2, 1, ResourceId([9; 32]), hash, RelayerId(vec![OTHER])).unwrap();
        assert_eq!(
            writer.handle(vote).await.unwrap(),
            Resolution::Observed {
                status: ProposalStatus::Active
            }
        );
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        let proposal = writer.store().get(&transfer.proposal_key()).await.unwrap();
        assert_eq!(proposal.expires_at_block(), 200);
        assert_eq!(proposal.votes().len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_create_keeps_deposit_data() {
        let methods = Arc::new(StdMutex::new(Vec::new()));
        let seen = methods.clone();
        let connector = mock_connector(move |call| {
            seen.lock().unwrap().push(call.call.method.clone());
            Ok(TxHash(vec![1]))
        });
        let (writer, _shutdown) = writer_with(connector, 1, ME);

        let create = Message::proposal_for(&transfer(1), RelayerId(vec![OTHER])).unwrap();
        assert_eq!(writer.handle(create).await.unwrap(), Resolution::Executed);
        assert_eq!(*methods.lock().unwrap(), vec!["executeDeposit".to_string()]);
        let proposal = writer.store().get(&transfer(1).proposal_key()).await.unwrap();
        assert_eq!(proposal.status(), ProposalStatus::Executed);
        assert!(proposal.deposit_data().is_some());
    }

    #[tokio::test]
    async fn test_execute_message_requires_passed() {
        let connector = mock_connector(|_| Ok(TxHash(vec![1])));
        let (writer, _shutdown) = writer_with(connector, 2, ME);
        let transfer = transfer(1);
        let data = transfer.transfer_data().unwrap();
        let execute = Message::execute_deposit(1, 2, 1, ResourceId([9; 32]), transfer.data_hash().unwrap(), data).unwrap();

        assert!(matches!(
            writer.handle(execute.clone()).await,
            Err(Error::ProposalNotPassed { .. })
        ));
        writer.handle(transfer).await.unwrap();
        assert!(matches!(
            writer.handle(execute).await,
            Err(Error::ProposalNotPassed { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_destination_is_invalid() {
        let connector = mock_connector(|_| Ok(TxHash(vec![1])));
        let (writer, _shutdown) = writer_with(connector, 2, ME);
        let msg = Message::fungible_transfer(2, 3, 1, 5, ResourceId([9; 32]), vec![1]).unwrap();
        assert!(matches!(writer.handle(msg).await, Err(Error::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let connector = mock_connector(|_| Err(SubmitError::Transient("connection refused".into())));
        let (tx, rx) = watch::channel(false);
        let mut keystore = MockKeystore::new();
        keystore.expect_sign().returning(|_, _| Ok(vec![1]));
        let handle = ChainHandle {
            connector: Arc::new(connector),
            keystore: Arc::new(keystore),
        };
        let relayer = RelayerConfig {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..relayer_config()
        };
        let store = Arc::new(ProposalStore::new(2, 2, 100));
        let writer = Writer::new(&chain_config(ME), &relayer, handle, store, rx).unwrap();

        let task = tokio::spawn(async move { writer.handle(transfer(1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Shutdown)));
    }

    fn chain_writer(chain: Arc<InMemoryChain>, from: u8, threshold: usize) -> (Arc<Writer>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let handle = ChainHandle {
            connector: chain,
            keystore: Arc::new(TestKeystore),
        };
        let store = Arc::new(ProposalStore::new(2, threshold, 100));
        let writer = Writer::new(&chain_config(from), &relayer_config(), handle, store, rx).unwrap();
        (Arc::new(writer), tx)
    }

    #[tokio::test]
    async fn test_two_relayers_threshold_two_execute_exactly_once() {
        let chain = Arc::new(InMemoryChain::new(2, 2, 100));
        let (a, _sa) = chain_writer(chain.clone(), ME, 2);
        let (b, _sb) = chain_writer(chain.clone(), OTHER, 2);
        let transfer = transfer(1);
        let key = transfer.proposal_key();

        // A 先发起，B 核对链上状态后投票
        assert_eq!(
            a.handle(transfer.clone()).await.unwrap(),
            Resolution::Voted {
                status: ProposalStatus::Active
            }
        );
        assert_eq!(b.handle(transfer.clone()).await.unwrap(), Resolution::Executed);
        assert_eq!(chain.executions(&key), 1);

        // A 之后观察到 B 的投票，尝试执行被拒绝后跟随链上状态
        let vote = Message::vote_deposit_proposal(
            1,
            2,
            1,
            key.resource_id,
            transfer.data_hash().unwrap(),
            RelayerId(vec![OTHER]),
        )
        .unwrap();
        assert_eq!(a.handle(vote).await.unwrap(), Resolution::Executed);
        assert_eq!(chain.executions(&key), 1);
        assert_eq!(a.store().get(&key).await.unwrap().status(), ProposalStatus::Executed);
        assert_eq!(chain.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_through_inbox() {
        let chain = Arc::new(InMemoryChain::new(2, 1, 100));
        let (writer, shutdown) = chain_writer(chain.clone(), ME, 1);
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(writer.clone().run(rx, 4));

        for nonce in 1..=5 {
            tx.send(transfer(nonce)).await.unwrap();
            // 重复投递不会产生第二次执行
            tx.send(transfer(nonce)).await.unwrap();
        }
        drop(tx);
        run.await.unwrap().unwrap();
        drop(shutdown);

        for nonce in 1..=5 {
            assert_eq!(chain.executions(&transfer(nonce).proposal_key()), 1);
        }
    }
}
