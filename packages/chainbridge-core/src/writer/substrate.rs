use super::CallBuilder;
use crate::{
    chain_adapter::{CallArg, ChainCall},
    types::{DataHash, ProposalKey},
};

/// ChainBridge pallet 的调用。发起和投票是同一个 extrinsic，先到者创建提案。
pub struct SubstrateCalls;

impl SubstrateCalls {
    fn acknowledge(key: &ProposalKey, data_hash: DataHash) -> ChainCall {
        ChainCall {
            method: "ChainBridge.acknowledge_proposal".to_string(),
            args: vec![
                CallArg::Nonce(key.deposit_nonce),
                CallArg::ChainId(key.source),
                CallArg::Resource(key.resource_id),
                CallArg::Hash(data_hash),
            ],
        }
    }
}

impl CallBuilder for SubstrateCalls {
    fn create_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall {
        Self::acknowledge(key, data_hash)
    }

    fn vote_proposal(&self, key: &ProposalKey, data_hash: DataHash) -> ChainCall {
        Self::acknowledge(key, data_hash)
    }

    fn execute_proposal(&self, key: &ProposalKey, deposit_data: &[u8]) -> ChainCall {
        ChainCall {
            method: "ChainBridge.eval_vote_state".to_string(),
            args: vec![
                CallArg::Nonce(key.deposit_nonce),
                CallArg::ChainId(key.source),
                CallArg::Resource(key.resource_id),
                CallArg::Bytes(deposit_data.to_vec()),
            ],
        }
    }
}
