use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

use crate::Error;

/// 联盟内链的标识
pub type ChainId = u8;
/// 源链在充值时分配的单调递增序号
pub type DepositNonce = u64;
pub type BlockNumber = u64;

fn decode_hex(name: &str, s: &str) -> Result<Vec<u8>, Error> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(raw).map_err(|e| Error::Serialization(format!("Invalid hex for {}: {}", name, e)))
}

/// 定长字节标识，人类可读格式下序列化为 0x 前缀的十六进制字符串
macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, Error> {
                let bytes = decode_hex(stringify!($name), s)?;
                let len = bytes.len();
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    Error::Serialization(format!(
                        "{} must be {} bytes, got {}",
                        stringify!($name),
                        $len,
                        len
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_hex(&s).map_err(serde::de::Error::custom)
                } else {
                    <[u8; $len]>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

/// 变长字节标识（地址、账户、交易哈希）
macro_rules! var_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, Error> {
                decode_hex(stringify!($name), s).map(Self)
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(&self.0))
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_hex(&s).map_err(serde::de::Error::custom)
                } else {
                    Vec::<u8>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

fixed_bytes!(
    /// 跨链资产类别标识，在所有链上含义一致
    ResourceId,
    32
);
fixed_bytes!(
    /// 提案负载摘要，绑定投票与具体的充值数据
    DataHash,
    32
);
var_bytes!(
    /// 中继者的签名身份
    RelayerId
);
var_bytes!(TxHash);
var_bytes!(
    /// 事件与调用中出现的任意十六进制字节
    HexBytes
);

pub fn keccak256(data: &[u8]) -> DataHash {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut out);
    DataHash(out)
}

/// 某条目标链上一笔充值提案的身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalKey {
    pub source: ChainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
}

impl fmt::Display for ProposalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.deposit_nonce, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    FungibleTransfer,
    NonFungibleTransfer,
    GenericTransfer,
    CreateDepositProposal,
    VoteDepositProposal,
    ExecuteDeposit,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::FungibleTransfer => "FungibleTransfer",
            MessageType::NonFungibleTransfer => "NonFungibleTransfer",
            MessageType::GenericTransfer => "GenericTransfer",
            MessageType::CreateDepositProposal => "CreateDepositProposal",
            MessageType::VoteDepositProposal => "VoteDepositProposal",
            MessageType::ExecuteDeposit => "ExecuteDeposit",
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            MessageType::FungibleTransfer | MessageType::NonFungibleTransfer | MessageType::GenericTransfer
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息负载中的一个字段，解释方式取决于消息类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadField {
    Amount(u128),
    Recipient(Vec<u8>),
    TokenId(Vec<u8>),
    Metadata(Vec<u8>),
    DataHash(DataHash),
    Relayer(RelayerId),
    DepositData(Vec<u8>),
}

/// 规范化的跨链消息。只能通过带校验的构造函数创建，创建后不可修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    message_type: MessageType,
    source: ChainId,
    destination: ChainId,
    deposit_nonce: DepositNonce,
    resource_id: ResourceId,
    payload: Vec<PayloadField>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidMessage(msg.into())
}

impl Message {
    fn build(
        message_type: MessageType,
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        payload: Vec<PayloadField>,
    ) -> Result<Self, Error> {
        if source == destination {
            return Err(invalid(format!(
                "{} source and destination are both chain {}",
                message_type, source
            )));
        }
        Ok(Self {
            message_type,
            source,
            destination,
            deposit_nonce,
            resource_id,
            payload,
        })
    }

    pub fn fungible_transfer(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        amount: u128,
        resource_id: ResourceId,
        recipient: Vec<u8>,
    ) -> Result<Self, Error> {
        if amount == 0 {
            return Err(invalid("fungible transfer amount must be non-zero"));
        }
        if recipient.is_empty() {
            return Err(invalid("fungible transfer recipient is empty"));
        }
        Self::build(
            MessageType::FungibleTransfer,
            source,
            destination,
            deposit_nonce,
            resource_id,
            vec![PayloadField::Amount(amount), PayloadField::Recipient(recipient)],
        )
    }

    pub fn non_fungible_transfer(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        token_id: Vec<u8>,
        recipient: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Result<Self, Error> {
        if token_id.is_empty() {
            return Err(invalid("non-fungible transfer token id is empty"));
        }
        if recipient.is_empty() {
            return Err(invalid("non-fungible transfer recipient is empty"));
        }
        Self::build(
            MessageType::NonFungibleTransfer,
            source,
            destination,
            deposit_nonce,
            resource_id,
            vec![
                PayloadField::TokenId(token_id),
                PayloadField::Recipient(recipient),
                PayloadField::Metadata(metadata),
            ],
        )
    }

    pub fn generic_transfer(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        metadata: Vec<u8>,
    ) -> Result<Self, Error> {
        if metadata.is_empty() {
            return Err(invalid("generic transfer metadata is empty"));
        }
        Self::build(
            MessageType::GenericTransfer,
            source,
            destination,
            deposit_nonce,
            resource_id,
            vec![PayloadField::Metadata(metadata)],
        )
    }

    /// `deposit_data` 为空表示只观察到了链上的提案事件，本地不掌握原始充值数据
    pub fn create_deposit_proposal(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: DataHash,
        proposer: RelayerId,
        deposit_data: Option<Vec<u8>>,
    ) -> Result<Self, Error> {
        if proposer.is_empty() {
            return Err(invalid("deposit proposal has no proposer"));
        }
        let mut payload = vec![PayloadField::DataHash(data_hash), PayloadField::Relayer(proposer)];
        if let Some(data) = deposit_data {
            check_data_hash(&data, &data_hash)?;
            payload.push(PayloadField::DepositData(data));
        }
        Self::build(
            MessageType::CreateDepositProposal,
            source,
            destination,
            deposit_nonce,
            resource_id,
            payload,
        )
    }

    pub fn vote_deposit_proposal(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: DataHash,
        voter: RelayerId,
    ) -> Result<Self, Error> {
        if voter.is_empty() {
            return Err(invalid("deposit vote has no voter"));
        }
        Self::build(
            MessageType::VoteDepositProposal,
            source,
            destination,
            deposit_nonce,
            resource_id,
            vec![PayloadField::DataHash(data_hash), PayloadField::Relayer(voter)],
        )
    }

    pub fn execute_deposit(
        source: ChainId,
        destination: ChainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        data_hash: DataHash,
        deposit_data: Vec<u8>,
    ) -> Result<Self, Error> {
        if deposit_data.is_empty() {
            return Err(invalid("execute deposit requires deposit data"));
        }
        check_data_hash(&deposit_data, &data_hash)?;
        Self::build(
            MessageType::ExecuteDeposit,
            source,
            destination,
            deposit_nonce,
            resource_id,
            vec![PayloadField::DataHash(data_hash), PayloadField::DepositData(deposit_data)],
        )
    }

    /// 由一笔转账派生出以 `proposer` 名义发起的充值提案
    pub fn proposal_for(transfer: &Message, proposer: RelayerId) -> Result<Self, Error> {
        if !transfer.message_type.is_transfer() {
            return Err(invalid(format!(
                "cannot derive a proposal from a {} message",
                transfer.message_type
            )));
        }
        let data = transfer.transfer_data()?;
        let data_hash = keccak256(&data);
        Self::create_deposit_proposal(
            transfer.source,
            transfer.destination,
            transfer.deposit_nonce,
            transfer.resource_id,
            data_hash,
            proposer,
            Some(data),
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn source(&self) -> ChainId {
        self.source
    }

    pub fn destination(&self) -> ChainId {
        self.destination
    }

    pub fn deposit_nonce(&self) -> DepositNonce {
        self.deposit_nonce
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn payload(&self) -> &[PayloadField] {
        &self.payload
    }

    pub fn proposal_key(&self) -> ProposalKey {
        ProposalKey {
            source: self.source,
            deposit_nonce: self.deposit_nonce,
            resource_id: self.resource_id,
        }
    }

    pub fn amount(&self) -> Option<u128> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::Amount(a) => Some(*a),
            _ => None,
        })
    }

    pub fn recipient(&self) -> Option<&[u8]> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::Recipient(r) => Some(r.as_slice()),
            _ => None,
        })
    }

    pub fn token_id(&self) -> Option<&[u8]> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::TokenId(t) => Some(t.as_slice()),
            _ => None,
        })
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::Metadata(m) => Some(m.as_slice()),
            _ => None,
        })
    }

    pub fn relayer(&self) -> Option<&RelayerId> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::Relayer(r) => Some(r),
            _ => None,
        })
    }

    pub fn deposit_data(&self) -> Option<&[u8]> {
        self.payload.iter().find_map(|f| match f {
            PayloadField::DepositData(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    /// 提案类消息直接携带摘要；转账消息由充值数据计算得出
    pub fn data_hash(&self) -> Result<DataHash, Error> {
        if self.message_type.is_transfer() {
            return Ok(keccak256(&self.transfer_data()?));
        }
        self.payload
            .iter()
            .find_map(|f| match f {
                PayloadField::DataHash(h) => Some(*h),
                _ => None,
            })
            .ok_or_else(|| invalid(format!("{} message carries no data hash", self.message_type)))
    }

    /// 转账的规范充值数据：`(resource_id, payload)` 的 BCS 编码，所有中继者据此得到相同的摘要
    pub fn transfer_data(&self) -> Result<Vec<u8>, Error> {
        if !self.message_type.is_transfer() {
            return Err(invalid(format!("{} message has no transfer data", self.message_type)));
        }
        bcs::to_bytes(&(&self.resource_id, &self.payload))
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn check_data_hash(data: &[u8], expected: &DataHash) -> Result<(), Error> {
    let actual = keccak256(data);
    if &actual != expected {
        return Err(invalid(format!(
            "deposit data hashes to {}, expected {}",
            actual, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> ResourceId {
        ResourceId([7u8; 32])
    }

    #[test]
    fn test_fungible_transfer_validation() {
        let msg = Message::fungible_transfer(1, 2, 7, 100, resource(), vec![0xab; 20]).unwrap();
        assert_eq!(msg.message_type(), MessageType::FungibleTransfer);
        assert_eq!(msg.amount(), Some(100));
        assert_eq!(msg.recipient(), Some(&[0xab; 20][..]));

        assert!(matches!(
            Message::fungible_transfer(1, 2, 7, 0, resource(), vec![1]),
            Err(Error::InvalidMessage(_))
        ));
        assert!(matches!(
            Message::fungible_transfer(1, 2, 7, 5, resource(), vec![]),
            Err(Error::InvalidMessage(_))
        ));
        assert!(matches!(
            Message::fungible_transfer(1, 1, 7, 5, resource(), vec![1]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_non_fungible_and_generic_validation() {
        assert!(Message::non_fungible_transfer(1, 2, 1, resource(), vec![9], vec![1], vec![]).is_ok());
        assert!(Message::non_fungible_transfer(1, 2, 1, resource(), vec![], vec![1], vec![]).is_err());
        assert!(Message::generic_transfer(1, 2, 1, resource(), vec![1, 2]).is_ok());
        assert!(Message::generic_transfer(1, 2, 1, resource(), vec![]).is_err());
    }

    #[test]
    fn test_proposal_derivation_binds_data_hash() {
        let transfer = Message::fungible_transfer(1, 2, 7, 100, resource(), vec![0xab; 20]).unwrap();
        let proposal = Message::proposal_for(&transfer, RelayerId(vec![0xa1])).unwrap();

        assert_eq!(proposal.message_type(), MessageType::CreateDepositProposal);
        assert_eq!(proposal.proposal_key(), transfer.proposal_key());
        assert_eq!(proposal.data_hash().unwrap(), transfer.data_hash().unwrap());
        assert_eq!(proposal.deposit_data().unwrap(), transfer.transfer_data().unwrap().as_slice());

        // 不同金额必然得到不同摘要
        let other = Message::fungible_transfer(1, 2, 7, 101, resource(), vec![0xab; 20]).unwrap();
        assert_ne!(other.data_hash().unwrap(), transfer.data_hash().unwrap());
    }

    #[test]
    fn test_proposal_rejects_data_not_matching_hash() {
        let err = Message::create_deposit_proposal(
            1,
            2,
            7,
            resource(),
            DataHash([1u8; 32]),
            RelayerId(vec![1]),
            Some(vec![1, 2, 3]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));

        let data = vec![1, 2, 3];
        assert!(Message::execute_deposit(1, 2, 7, resource(), keccak256(&data), data).is_ok());
        assert!(Message::execute_deposit(1, 2, 7, resource(), DataHash::default(), vec![]).is_err());
        assert!(Message::vote_deposit_proposal(1, 2, 7, resource(), DataHash::default(), RelayerId(vec![])).is_err());
    }

    #[test]
    fn test_hex_identifiers() {
        let id = ResourceId::from_hex(&format!("0x{}", "11".repeat(32))).unwrap();
        assert_eq!(id, ResourceId([0x11; 32]));
        assert!(ResourceId::from_hex("0x1234").is_err());

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "11".repeat(32)));
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let relayer = RelayerId::from_hex("0xdeadbeef").unwrap();
        assert_eq!(relayer.to_string(), "0xdeadbeef");
    }

    #[test]
    fn test_keccak256_known_vector() {
        // keccak256("")
        assert_eq!(
            keccak256(b"").to_hex(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
