//! 目标链本地的充值提案记录与投票状态机。
//!
//! 每个提案身份 `(source, deposit_nonce, resource_id)` 拥有独立的异步锁，
//! 读取、状态迁移、写回都在 [`ProposalEntry`] 的独占作用域内完成；
//! 不同提案之间互不阻塞。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::chain_adapter::OnChainProposal;
use crate::types::{BlockNumber, ChainId, DataHash, ProposalKey, RelayerId};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStatus {
    Inactive,
    Active,
    Passed,
    Executed,
    Cancelled,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Inactive => "inactive",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }

    /// Executed 与 Cancelled 之后不再允许任何迁移
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    key: ProposalKey,
    data_hash: DataHash,
    votes: BTreeSet<RelayerId>,
    status: ProposalStatus,
    created_at_block: BlockNumber,
    expires_at_block: BlockNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deposit_data: Option<Vec<u8>>,
    /// 从快照加载的记录在与链上状态核对之前不可信
    #[serde(default)]
    verified: bool,
}

impl Proposal {
    pub fn key(&self) -> ProposalKey {
        self.key
    }

    pub fn data_hash(&self) -> DataHash {
        self.data_hash
    }

    pub fn votes(&self) -> &BTreeSet<RelayerId> {
        &self.votes
    }

    pub fn status(&self) -> ProposalStatus {
        self.status
    }

    pub fn created_at_block(&self) -> BlockNumber {
        self.created_at_block
    }

    pub fn expires_at_block(&self) -> BlockNumber {
        self.expires_at_block
    }

    pub fn deposit_data(&self) -> Option<&[u8]> {
        self.deposit_data.as_deref()
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }
}

/// 一次投票（或发起提案）对记录产生的效果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// 首次观察到该充值，记录由 Inactive 变为 Active
    Created,
    /// 新的投票者被加入
    Recorded,
    /// 该中继者已经投过票，无操作
    AlreadyVoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub outcome: VoteOutcome,
    pub previous: ProposalStatus,
    pub status: ProposalStatus,
}

type Slot = Arc<Mutex<Option<Proposal>>>;

/// 某条目标链上全部提案记录的唯一所有者
pub struct ProposalStore {
    chain: ChainId,
    threshold: usize,
    expiry_blocks: BlockNumber,
    slots: Mutex<HashMap<ProposalKey, Slot>>,
}

impl ProposalStore {
    pub fn new(chain: ChainId, threshold: usize, expiry_blocks: BlockNumber) -> Self {
        Self {
            chain,
            threshold: threshold.max(1),
            expiry_blocks,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 获取某个提案的独占更新作用域。
    ///
    /// 持有 entry 期间不要对同一个 key 调用 [`ProposalStore::get`]，否则会自锁。
    pub async fn lock(&self, key: ProposalKey) -> ProposalEntry {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key).or_default().clone()
        };
        ProposalEntry {
            key,
            threshold: self.threshold,
            expiry_blocks: self.expiry_blocks,
            record: slot.lock_owned().await,
        }
    }

    pub async fn get(&self, key: &ProposalKey) -> Option<Proposal> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let record = slot.lock().await;
        record.clone()
    }

    pub async fn snapshot(&self) -> Vec<Proposal> {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut proposals = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(p) = slot.lock().await.clone() {
                proposals.push(p);
            }
        }
        proposals.sort_by_key(|p| p.key);
        proposals
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let proposals = self.snapshot().await;
        let json = serde_json::to_vec_pretty(&proposals)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(|e| Error::Config(format!("Failed to write proposal snapshot: {}", e)))?;
        info!(chain = self.chain, proposals = proposals.len(), path = ?path.as_ref(), "Saved proposal snapshot");
        Ok(())
    }

    /// 从快照恢复。恢复出的记录都标记为未核对，写入方在据此行动之前必须重新查询链上状态。
    pub async fn load<P: AsRef<Path>>(
        path: P,
        chain: ChainId,
        threshold: usize,
        expiry_blocks: BlockNumber,
    ) -> Result<Self, Error> {
        let store = Self::new(chain, threshold, expiry_blocks);
        let raw = match tokio::fs::read(path.as_ref()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(chain, path = ?path.as_ref(), "No proposal snapshot, starting empty");
                return Ok(store);
            }
            Err(e) => return Err(Error::Config(format!("Failed to read proposal snapshot: {}", e))),
        };
        let proposals: Vec<Proposal> =
            serde_json::from_slice(&raw).map_err(|e| Error::Serialization(e.to_string()))?;
        {
            let mut slots = store.slots.lock().await;
            for mut p in proposals {
                p.verified = false;
                slots.insert(p.key, Arc::new(Mutex::new(Some(p))));
            }
            info!(chain, proposals = slots.len(), "Loaded proposal snapshot");
        }
        Ok(store)
    }
}

/// 单个提案的独占更新作用域，所有状态迁移都经由这里
pub struct ProposalEntry {
    key: ProposalKey,
    threshold: usize,
    expiry_blocks: BlockNumber,
    record: OwnedMutexGuard<Option<Proposal>>,
}

impl ProposalEntry {
    pub fn key(&self) -> ProposalKey {
        self.key
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.record.as_ref()
    }

    pub fn status(&self) -> ProposalStatus {
        self.record.as_ref().map_or(ProposalStatus::Inactive, |p| p.status)
    }

    pub fn has_voted(&self, relayer: &RelayerId) -> bool {
        self.record.as_ref().map_or(false, |p| p.votes.contains(relayer))
    }

    pub fn needs_reconcile(&self) -> bool {
        self.record.as_ref().map_or(true, |p| !p.verified)
    }

    /// 在 `current_block` 时本地记录是否已经过了有效期，不修改状态
    pub fn is_expired(&self, current_block: BlockNumber) -> bool {
        self.record
            .as_ref()
            .map_or(false, |p| p.status == ProposalStatus::Active && current_block > p.expires_at_block)
    }

    /// 到期检查：仍处于 Active 且当前高度超过 `expires_at_block` 时取消
    pub fn evaluate(&mut self, current_block: BlockNumber) -> ProposalStatus {
        let key = self.key;
        if let Some(p) = self.record.as_mut() {
            if p.status == ProposalStatus::Active && current_block > p.expires_at_block {
                warn!(
                    proposal = %key,
                    votes = p.votes.len(),
                    expires_at = p.expires_at_block,
                    current_block,
                    "Proposal expired before reaching threshold"
                );
                p.status = ProposalStatus::Cancelled;
            }
        }
        self.status()
    }

    /// 不修改状态地判断一次投票会产生什么效果
    pub fn check_vote(
        &self,
        data_hash: &DataHash,
        relayer: &RelayerId,
        current_block: BlockNumber,
    ) -> Result<VoteOutcome, Error> {
        let p = match self.record.as_ref() {
            None => return Ok(VoteOutcome::Created),
            Some(p) => p,
        };
        let expired = p.status == ProposalStatus::Active && current_block > p.expires_at_block;
        if p.status.is_terminal() || expired {
            let status = if expired { ProposalStatus::Cancelled } else { p.status };
            return Err(Error::ProposalFinalized { key: self.key, status });
        }
        if &p.data_hash != data_hash {
            return Err(Error::ProposalDataMismatch {
                key: self.key,
                stored: p.data_hash,
                got: *data_hash,
            });
        }
        if p.votes.contains(relayer) {
            return Ok(VoteOutcome::AlreadyVoted);
        }
        Ok(VoteOutcome::Recorded)
    }

    /// 发起提案。若记录已存在则等同于一次投票，先到者创建记录。
    pub fn propose(
        &mut self,
        data_hash: DataHash,
        proposer: &RelayerId,
        deposit_data: Option<Vec<u8>>,
        current_block: BlockNumber,
    ) -> Result<Transition, Error> {
        let transition = self.vote(data_hash, proposer, current_block)?;
        if let Some(data) = deposit_data {
            self.attach_deposit_data(data);
        }
        Ok(transition)
    }

    pub fn vote(
        &mut self,
        data_hash: DataHash,
        voter: &RelayerId,
        current_block: BlockNumber,
    ) -> Result<Transition, Error> {
        let previous = self.evaluate(current_block);
        let outcome = self.check_vote(&data_hash, voter, current_block)?;
        let key = self.key;
        let threshold = self.threshold;

        match outcome {
            VoteOutcome::Created => {
                let mut votes = BTreeSet::new();
                votes.insert(voter.clone());
                *self.record = Some(Proposal {
                    key,
                    data_hash,
                    votes,
                    status: ProposalStatus::Active,
                    created_at_block: current_block,
                    expires_at_block: current_block.saturating_add(self.expiry_blocks),
                    deposit_data: None,
                    verified: true,
                });
                info!(proposal = %key, proposer = %voter, %data_hash, "Deposit proposal created");
            }
            VoteOutcome::Recorded => {
                if let Some(p) = self.record.as_mut() {
                    p.votes.insert(voter.clone());
                    debug!(proposal = %key, voter = %voter, votes = p.votes.len(), "Vote recorded");
                }
            }
            VoteOutcome::AlreadyVoted => {
                debug!(proposal = %key, voter = %voter, "Duplicate vote ignored");
            }
        }

        if let Some(p) = self.record.as_mut() {
            if p.status == ProposalStatus::Active && p.votes.len() >= threshold {
                p.status = ProposalStatus::Passed;
                info!(proposal = %key, votes = p.votes.len(), threshold, "Proposal passed");
            }
        }

        Ok(Transition {
            outcome,
            previous,
            status: self.status(),
        })
    }

    /// 记住原始充值数据以便之后执行；与已存摘要不符的数据被忽略
    pub fn attach_deposit_data(&mut self, data: Vec<u8>) {
        let key = self.key;
        if let Some(p) = self.record.as_mut() {
            if p.deposit_data.is_some() {
                return;
            }
            if crate::types::keccak256(&data) == p.data_hash {
                p.deposit_data = Some(data);
            } else {
                warn!(proposal = %key, "Ignoring deposit data that does not match the proposal hash");
            }
        }
    }

    pub fn mark_executed(&mut self) -> Result<(), Error> {
        let key = self.key;
        let status = self.status();
        match self.record.as_mut() {
            Some(p) if p.status == ProposalStatus::Passed => {
                p.status = ProposalStatus::Executed;
                info!(proposal = %key, "Proposal executed");
                Ok(())
            }
            Some(_) if status.is_terminal() => Err(Error::ProposalFinalized { key, status }),
            _ => Err(Error::ProposalNotPassed { key, status }),
        }
    }

    /// 以链上状态为准修正本地记录。终态记录保持不变，投票取并集。
    pub fn reconcile(&mut self, on_chain: Option<OnChainProposal>) {
        let key = self.key;
        let next = match (self.record.take(), on_chain) {
            (None, None) => None,
            (Some(mut p), None) => {
                if p.status.is_terminal() {
                    p.verified = true;
                    Some(p)
                } else {
                    warn!(proposal = %key, status = %p.status, "Discarding cached proposal unknown to the chain");
                    None
                }
            }
            (None, Some(chain)) => {
                debug!(proposal = %key, status = %chain.status, "Adopting on-chain proposal");
                Some(Proposal {
                    key,
                    data_hash: chain.data_hash,
                    votes: chain.votes.into_iter().collect(),
                    status: chain.status,
                    created_at_block: chain.created_at_block,
                    expires_at_block: chain.expires_at_block,
                    deposit_data: None,
                    verified: true,
                })
            }
            (Some(mut p), Some(chain)) => {
                if p.data_hash != chain.data_hash {
                    warn!(
                        proposal = %key,
                        local = %p.data_hash,
                        chain = %chain.data_hash,
                        "Cached proposal disagrees with chain, replacing"
                    );
                    p.data_hash = chain.data_hash;
                    p.votes.clear();
                    p.deposit_data = None;
                }
                p.votes.extend(chain.votes);
                if !p.status.is_terminal() {
                    p.status = chain.status;
                }
                p.created_at_block = chain.created_at_block;
                p.expires_at_block = chain.expires_at_block;
                p.verified = true;
                Some(p)
            }
        };
        *self.record = next.map(|mut p| {
            if p.status == ProposalStatus::Active && p.votes.len() >= self.threshold {
                p.status = ProposalStatus::Passed;
            }
            p
        });
    }
}
