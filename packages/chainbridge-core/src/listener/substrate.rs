use serde::Deserialize;

use super::{decode, parse_amount, HandlerContext, HandlerRegistry};
use crate::{
    chain_adapter::RawEvent,
    types::{ChainId, DataHash, DepositNonce, HexBytes, RelayerId, ResourceId},
    Error, Message,
};

#[derive(Debug, Deserialize)]
struct FungibleTransferEvent {
    destination: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    /// U256 以十进制字符串给出
    amount: String,
    recipient: HexBytes,
}

#[derive(Debug, Deserialize)]
struct NonFungibleTransferEvent {
    destination: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    token_id: HexBytes,
    recipient: HexBytes,
    #[serde(default)]
    metadata: HexBytes,
}

#[derive(Debug, Deserialize)]
struct GenericTransferEvent {
    destination: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    metadata: HexBytes,
}

#[derive(Debug, Deserialize)]
struct VoteForEvent {
    source: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    data_hash: DataHash,
    voter: RelayerId,
}

fn on_fungible(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let ev: FungibleTransferEvent = decode(event)?;
    Message::fungible_transfer(
        ctx.chain,
        ev.destination,
        ev.deposit_nonce,
        parse_amount(event, &ev.amount)?,
        ev.resource_id,
        ev.recipient.0,
    )
}

fn on_non_fungible(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let ev: NonFungibleTransferEvent = decode(event)?;
    Message::non_fungible_transfer(
        ctx.chain,
        ev.destination,
        ev.deposit_nonce,
        ev.resource_id,
        ev.token_id.0,
        ev.recipient.0,
        ev.metadata.0,
    )
}

fn on_generic(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let ev: GenericTransferEvent = decode(event)?;
    Message::generic_transfer(ctx.chain, ev.destination, ev.deposit_nonce, ev.resource_id, ev.metadata.0)
}

fn on_vote_for(event: &RawEvent, ctx: &HandlerContext) -> Result<Message, Error> {
    let ev: VoteForEvent = decode(event)?;
    Message::vote_deposit_proposal(ev.source, ctx.chain, ev.deposit_nonce, ev.resource_id, ev.data_hash, ev.voter)
}

pub fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("FungibleTransfer", on_fungible)
        .with("NonFungibleTransfer", on_non_fungible)
        .with("GenericTransfer", on_generic)
        .with("VoteFor", on_vote_for)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use serde_json::json;

    fn run(name: &str, data: serde_json::Value) -> Result<Message, Error> {
        let registry = handlers();
        registry.get(name).unwrap()(&RawEvent::new(name, 1, data), &HandlerContext { chain: 5 })
    }

    fn resource() -> String {
        format!("0x{}", "0a".repeat(32))
    }

    #[test]
    fn test_transfers() {
        let msg = run(
            "FungibleTransfer",
            json!({
                "destination": 1,
                "deposit_nonce": 3,
                "resource_id": resource(),
                "amount": "1000000000000000000000",
                "recipient": "0x0102"
            }),
        )
        .unwrap();
        assert_eq!(msg.message_type(), MessageType::FungibleTransfer);
        assert_eq!(msg.source(), 5);
        assert_eq!(msg.amount(), Some(1_000_000_000_000_000_000_000));

        let msg = run(
            "NonFungibleTransfer",
            json!({
                "destination": 1,
                "deposit_nonce": 4,
                "resource_id": resource(),
                "token_id": "0x07",
                "recipient": "0x0102"
            }),
        )
        .unwrap();
        assert_eq!(msg.message_type(), MessageType::NonFungibleTransfer);
        assert_eq!(msg.metadata(), Some(&[][..]));

        let msg = run(
            "GenericTransfer",
            json!({
                "destination": 1,
                "deposit_nonce": 5,
                "resource_id": resource(),
                "metadata": "0xaa"
            }),
        )
        .unwrap();
        assert_eq!(msg.message_type(), MessageType::GenericTransfer);
    }

    #[test]
    fn test_bad_amount() {
        let err = run(
            "FungibleTransfer",
            json!({
                "destination": 1,
                "deposit_nonce": 3,
                "resource_id": resource(),
                "amount": "-1",
                "recipient": "0x0102"
            }),
        )
        .unwrap_err();
        assert!(matches!(err, Error::EventDecode { .. }));
    }

    #[test]
    fn test_vote_for() {
        let msg = run(
            "VoteFor",
            json!({
                "source": 1,
                "deposit_nonce": 3,
                "resource_id": resource(),
                "data_hash": format!("0x{}", "01".repeat(32)),
                "voter": "0x0a0b"
            }),
        )
        .unwrap();
        assert_eq!(msg.message_type(), MessageType::VoteDepositProposal);
        assert_eq!(msg.source(), 1);
        assert_eq!(msg.destination(), 5);
        assert_eq!(msg.relayer(), Some(&RelayerId(vec![0x0a, 0x0b])));
    }
}
