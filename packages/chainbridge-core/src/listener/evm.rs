use serde::Deserialize;

use super::{decode, parse_amount, HandlerContext, HandlerRegistry};
use crate::{
    chain_adapter::RawEvent,
    types::{ChainId, DataHash, DepositNonce, HexBytes, RelayerId, ResourceId},
    Error, Message,
};

/// 充值记录由哪个 handler 合约处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DepositHandler {
    Erc20,
    Erc721,
    Generic,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositEvent {
    destination_chain_id: ChainId,
    resource_id: ResourceId,
    deposit_nonce: DepositNonce,
    handler: DepositHandler,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    token_id: HexBytes,
    #[serde(default)]
    recipient: HexBytes,
    #[serde(default)]
    metadata: HexBytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposalVoteEvent {
    origin_chain_id: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    data_hash: DataHash,
    voter: RelayerId,
}

fn on_deposit(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let deposit: DepositEvent = decode(event)?;
    match deposit.handler {
        DepositHandler::Erc20 => {
            let amount = deposit.amount.as_deref().ok_or_else(|| Error::EventDecode {
                event: event.name.clone(),
                reason: "erc20 deposit without amount".to_string(),
            })?;
            Message::fungible_transfer(
                ctx.chain,
                deposit.destination_chain_id,
                deposit.deposit_nonce,
                parse_amount(event, amount)?,
                deposit.resource_id,
                deposit.recipient.0,
            )
        }
        DepositHandler::Erc721 => Message::non_fungible_transfer(
            ctx.chain,
            deposit.destination_chain_id,
            deposit.deposit_nonce,
            deposit.resource_id,
            deposit.token_id.0,
            deposit.recipient.0,
            deposit.metadata.0,
        ),
        DepositHandler::Generic => Message::generic_transfer(
            ctx.chain,
            deposit.destination_chain_id,
            deposit.deposit_nonce,
            deposit.resource_id,
            deposit.metadata.0,
        ),
    }
}

// 投票发生在目标链上，发出事件的链就是消息的目标
fn on_proposal_vote(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let vote: ProposalVoteEvent = decode(event)?;
    Message::vote_deposit_proposal(
        vote.origin_chain_id,
        ctx.chain,
        vote.deposit_nonce,
        vote.resource_id,
        vote.data_hash,
        vote.voter,
    )
}

pub fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("Deposit", on_deposit)
        .with("ProposalVote", on_proposal_vote)
}
