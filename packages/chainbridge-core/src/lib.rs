pub mod config;
pub mod types;
pub mod chain_adapter;
pub mod listener;
pub mod router;
pub mod proposal;
pub mod writer;
pub mod relayer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use types::{ChainId, DataHash, DepositNonce, Message, MessageType, ProposalKey, RelayerId, ResourceId};

use chain_adapter::SubmitError;
use proposal::ProposalStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to decode event {event}: {reason}")]
    EventDecode { event: String, reason: String },

    #[error("Proposal {key} data hash mismatch: stored {stored}, got {got}")]
    ProposalDataMismatch {
        key: ProposalKey,
        stored: DataHash,
        got: DataHash,
    },

    #[error("Proposal {key} is already {status}")]
    ProposalFinalized { key: ProposalKey, status: ProposalStatus },

    #[error("Proposal {key} has not passed (status: {status})")]
    ProposalNotPassed { key: ProposalKey, status: ProposalStatus },

    #[error("No writer registered for destination chain {0}")]
    UnknownDestination(ChainId),

    #[error("Router unavailable: {0}")]
    RouterUnavailable(String),

    #[error("Failed to forward message from chain {chain} after {attempts} attempts: {reason}")]
    ForwardFailed {
        chain: ChainId,
        attempts: u32,
        reason: String,
    },

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Shutting down")]
    Shutdown,
}

impl Error {
    /// 瞬时的提交错误和网络错误值得重试，协议层面的拒绝永远不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Submit(e) => e.is_transient(),
            Error::Network(_) => true,
            _ => false,
        }
    }
}
