use super::CallBuilder;
use crate::{
    chain_adapter::{CallArg, ChainCall},
    types::{DataHash, ProposalKey},
};

/// Bridge 合约的三个入口
pub struct EvmCalls;

impl CallBuilder for EvmCalls {
    fn create_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall {
        ChainCall {
            method: "createDepositProposal".to_string(),
            args: vec![
                CallArg::ChainId(key.source),
                CallArg::Nonce(key.deposit_nonce),
                CallArg::Resource(key.resource_id),
                CallArg::Hash(data_hash),
            ],
        }
    }

    fn vote_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall {
        ChainCall {
            method: "voteDepositProposal".to_string(),
            args: vec![
                CallArg::ChainId(key.source),
                CallArg::Nonce(key.deposit_nonce),
                CallArg::Resource(key.resource_id),
                CallArg::Hash(data_hash),
            ],
        }
    }

    fn execute_proposal(&self, key: &ProposalKey, deposit_data: &[u8]) -> ChainCall {
        ChainCall {
            method: "executeDeposit".to_string(),
            args: vec![
                CallArg::ChainId(key.source),
                CallArg::Nonce(key.deposit_nonce),
                CallArg::Bytes(deposit_data.to_vec()),
                CallArg::Resource(key.resource_id),
            ],
        }
    }
}
