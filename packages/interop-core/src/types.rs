use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ConfigurationError, Error};

pub type ChainId = String;
pub type ChannelId = String;
pub type MessageId = String;

/// 远端链所属的协议族，决定使用哪个包构建器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    Ibc,
    Xcm,
}

impl ProtocolFamily {
    /// IBC 同时使用高度和时间戳超时；XCM 只看时间戳
    pub fn is_height_aware(&self) -> bool {
        matches!(self, ProtocolFamily::Ibc)
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Ibc => write!(f, "ibc"),
            ProtocolFamily::Xcm => write!(f, "xcm"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelOrdering {
    Ordered,
    #[default]
    Unordered,
}

impl ChannelOrdering {
    /// 兼容 "ORDER_ORDERED" 这种远端写法
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim_start_matches("ORDER_") {
            "ORDERED" => ChannelOrdering::Ordered,
            _ => ChannelOrdering::Unordered,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Init,
    #[serde(rename = "TRYOPEN")]
    TryOpen,
    #[default]
    Open,
    Closed,
}

impl ChannelState {
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim_start_matches("STATE_") {
            "OPEN" => ChannelState::Open,
            "TRYOPEN" => ChannelState::TryOpen,
            "INIT" => ChannelState::Init,
            _ => ChannelState::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Init => "INIT",
            ChannelState::TryOpen => "TRYOPEN",
            ChannelState::Open => "OPEN",
            ChannelState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Height {
    pub revision_number: u64,
    pub revision_height: u64,
}

impl Height {
    pub fn new(revision_number: u64, revision_height: u64) -> Self {
        Self {
            revision_number,
            revision_height,
        }
    }

    pub fn add(&self, blocks: u64) -> Self {
        Self {
            revision_number: self.revision_number,
            revision_height: self.revision_height.saturating_add(blocks),
        }
    }
}

/// 指向某条对端链的有序/无序通道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub port_id: String,
    pub counterparty_channel_id: ChannelId,
    pub counterparty_port_id: String,
    pub counterparty_chain: ChainId,
    #[serde(default)]
    pub state: ChannelState,
    #[serde(default)]
    pub ordering: ChannelOrdering,
    #[serde(default = "default_channel_version")]
    pub version: String,
    #[serde(default)]
    pub connection_hops: Vec<String>,
    #[serde(default = "default_next_sequence")]
    pub next_sequence: u64,
    #[serde(default)]
    pub last_ack_sequence: u64,
    #[serde(default)]
    pub timeout_height: Option<Height>,
    #[serde(default)]
    pub timeout_timestamp: Option<u64>,
    #[serde(default)]
    pub extended_state: BTreeMap<String, String>,
}

fn default_channel_version() -> String {
    "ics20-1".to_string()
}

fn default_next_sequence() -> u64 {
    1
}

impl Channel {
    /// 新通道默认为 OPEN/UNORDERED，序号从 1 开始
    pub fn new(
        channel_id: impl Into<String>,
        port_id: impl Into<String>,
        counterparty_channel_id: impl Into<String>,
        counterparty_port_id: impl Into<String>,
        counterparty_chain: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            port_id: port_id.into(),
            counterparty_channel_id: counterparty_channel_id.into(),
            counterparty_port_id: counterparty_port_id.into(),
            counterparty_chain: counterparty_chain.into(),
            state: ChannelState::Open,
            ordering: ChannelOrdering::Unordered,
            version: default_channel_version(),
            connection_hops: Vec::new(),
            next_sequence: default_next_sequence(),
            last_ack_sequence: 0,
            timeout_height: None,
            timeout_timestamp: None,
            extended_state: BTreeMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    pub chain_id: ChainId,
    #[serde(default)]
    pub para_id: Option<u32>,
    #[serde(default)]
    pub bridge_contract: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    #[default]
    Active,
    Degraded,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteType {
    #[default]
    Direct,
    ViaRelay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    #[serde(default)]
    pub hops: Vec<RouteHop>,
    #[serde(default)]
    pub status: RouteStatus,
    #[serde(default)]
    pub route_type: RouteType,
    #[serde(default)]
    pub fee_asset: Option<String>,
    #[serde(default, with = "amount::option")]
    pub fee_amount: Option<u128>,
}

impl Route {
    pub fn direct(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_chain: source.into(),
            destination_chain: destination.into(),
            hops: Vec::new(),
            status: RouteStatus::Active,
            route_type: RouteType::Direct,
            fee_asset: None,
            fee_amount: None,
        }
    }

    pub fn key(&self) -> (ChainId, ChainId) {
        (self.source_chain.clone(), self.destination_chain.clone())
    }

    /// 沿着跳列表找到服务于给定链的那一段
    pub fn hop_for(&self, chain: &str) -> Option<&RouteHop> {
        self.hops.iter().find(|hop| hop.chain_id == chain)
    }

    pub fn is_multi_hop(&self) -> bool {
        !self.hops.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub origin_chain: ChainId,
    /// 原生链上的位置描述，原样透传（例如 MultiLocation 对象或 IBC denom 字符串）
    pub location: serde_json::Value,
    #[serde(default)]
    pub metadata_uri: Option<String>,
}

impl Asset {
    /// ICS-20 面额：location 为字符串时使用它，否则退回资产 ID
    pub fn denom(&self) -> &str {
        self.location.as_str().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedChainProfile {
    pub chain_id: ChainId,
    /// 秒
    pub trusting_period: u64,
    /// 秒
    pub max_clock_drift: u64,
    pub client_type: String,
    #[serde(default)]
    pub last_verified_height: u64,
    pub trust_level: f64,
    /// 最近一次验证的 unix 秒
    #[serde(default)]
    pub last_verified_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Transfer,
    Call,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Transfer => write!(f, "transfer"),
            MessageKind::Call => write!(f, "call"),
        }
    }
}

/// 每种消息类型一个具体形状，构造时即校验
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Transfer {
        asset: String,
        #[serde(with = "amount")]
        amount: u128,
        recipient: String,
    },
    Call {
        /// hex 编码的调用数据
        encoded_call: String,
        weight: u64,
    },
}

impl Payload {
    pub fn transfer(
        asset: impl Into<String>,
        amount: u128,
        recipient: impl Into<String>,
    ) -> Result<Self, Error> {
        let payload = Payload::Transfer {
            asset: asset.into(),
            amount,
            recipient: recipient.into(),
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn call(encoded_call: impl Into<String>, weight: u64) -> Result<Self, Error> {
        let payload = Payload::Call {
            encoded_call: encoded_call.into(),
            weight,
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Transfer { .. } => MessageKind::Transfer,
            Payload::Call { .. } => MessageKind::Call,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| Err(ConfigurationError::InvalidPayload(msg.to_string()));
        match self {
            Payload::Transfer {
                asset,
                amount,
                recipient,
            } => {
                if asset.trim().is_empty() {
                    return invalid("transfer asset is empty");
                }
                if *amount == 0 {
                    return invalid("transfer amount must be greater than 0");
                }
                if recipient.trim().is_empty() {
                    return invalid("transfer recipient is empty");
                }
            }
            Payload::Call {
                encoded_call,
                weight,
            } => {
                let raw = encoded_call.trim_start_matches("0x");
                if raw.is_empty() {
                    return invalid("encoded call is empty");
                }
                if hex::decode(raw).is_err() {
                    return invalid("encoded call is not valid hex");
                }
                if *weight == 0 {
                    return invalid("call weight budget must be greater than 0");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Submitted,
    Acknowledged,
    Rejected,
    TimedOut,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Acknowledged | MessageStatus::Rejected | MessageStatus::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Rejected)
                | (Pending, TimedOut)
                | (Submitted, Acknowledged)
                | (Submitted, Rejected)
                | (Submitted, TimedOut)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Submitted => "submitted",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Rejected => "rejected",
            MessageStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    #[serde(default)]
    pub height: Option<Height>,
    /// unix 纳秒
    pub timestamp: u64,
}

impl Timeout {
    pub fn is_expired(&self, now_nanos: u64, remote_height: Option<u64>) -> bool {
        if self.timestamp != 0 && now_nanos >= self.timestamp {
            return true;
        }
        match (self.height, remote_height) {
            (Some(h), Some(current)) => h.revision_height != 0 && current >= h.revision_height,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeMetadata {
    pub asset: String,
    #[serde(with = "amount")]
    pub amount: u128,
}

/// 一次跨链工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    #[serde(default)]
    pub source_channel: Option<ChannelId>,
    #[serde(default)]
    pub destination_channel: Option<ChannelId>,
    #[serde(default)]
    pub source_port: Option<String>,
    #[serde(default)]
    pub destination_port: Option<String>,
    pub payload: Payload,
    pub created_at: u64,
    pub timeout: Timeout,
    pub status: MessageStatus,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub weight: Option<u64>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub relayer_address: Option<String>,
    #[serde(default)]
    pub fee: Option<FeeMetadata>,
    /// 中继返回的交易句柄，用于状态轮询
    #[serde(default)]
    pub tx_handle: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// 本地计算的包承诺（仅 IBC）
    #[serde(default)]
    pub commitment: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn transition(&mut self, next: MessageStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_submitted(&mut self, handle: impl Into<String>) -> Result<(), Error> {
        self.transition(MessageStatus::Submitted)?;
        self.tx_handle = Some(handle.into());
        Ok(())
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        self.transition(MessageStatus::Rejected)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_timed_out(&mut self) -> Result<(), Error> {
        self.transition(MessageStatus::TimedOut)?;
        self.failure_reason
            .get_or_insert_with(|| "timeout elapsed without acknowledgement".to_string());
        Ok(())
    }

    /// 返回 false 表示确认到达太晚（消息已是终态），被丢弃
    pub fn acknowledge(&mut self) -> Result<bool, Error> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.transition(MessageStatus::Acknowledged)?;
        Ok(true)
    }

    pub fn is_expired(&self, remote_height: Option<u64>) -> bool {
        self.timeout.is_expired(now_nanos(), remote_height)
    }
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 金额在线上以十进制字符串传输，读取时兼容数字
pub(crate) mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    fn parse<E: de::Error>(raw: Raw) -> Result<u128, E> {
        match raw {
            Raw::Number(n) => Ok(n as u128),
            Raw::Text(s) => s.parse::<u128>().map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<u128>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u128>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(parse)
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_machine() {
        assert!(MessageStatus::Pending.can_transition_to(MessageStatus::Submitted));
        assert!(MessageStatus::Submitted.can_transition_to(MessageStatus::TimedOut));
        assert!(!MessageStatus::TimedOut.can_transition_to(MessageStatus::Acknowledged));
        assert!(!MessageStatus::Acknowledged.can_transition_to(MessageStatus::Rejected));
        assert!(!MessageStatus::Pending.can_transition_to(MessageStatus::Acknowledged));
    }

    #[test]
    fn test_payload_validation() {
        assert!(Payload::transfer("usdc", 100, "alice").is_ok());
        assert!(matches!(
            Payload::transfer("usdc", 0, "alice"),
            Err(Error::Configuration(ConfigurationError::InvalidPayload(_)))
        ));
        assert!(Payload::transfer("usdc", 1, " ").is_err());
        assert!(Payload::call("0xdeadbeef", 1_000).is_ok());
        assert!(Payload::call("0xzz", 1_000).is_err());
        assert!(Payload::call("0x", 1_000).is_err());
        assert!(Payload::call("00", 0).is_err());
    }

    #[test]
    fn test_payload_serializes_amount_as_string() {
        let payload = Payload::transfer("usdc", 340_282_366_920_938_463_463, "bob").unwrap();
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "transfer");
        assert_eq!(value["amount"], "340282366920938463463");

        let parsed: Payload =
            serde_json::from_str(r#"{"kind":"transfer","asset":"usdc","amount":100,"recipient":"bob"}"#)
                .unwrap();
        assert_eq!(parsed, Payload::transfer("usdc", 100, "bob").unwrap());
    }

    #[test]
    fn test_timeout_expiry() {
        let timeout = Timeout {
            height: Some(Height::new(0, 1_100)),
            timestamp: u64::MAX,
        };
        assert!(!timeout.is_expired(now_nanos(), Some(1_099)));
        assert!(timeout.is_expired(now_nanos(), Some(1_100)));
        assert!(!timeout.is_expired(now_nanos(), None));

        let elapsed = Timeout {
            height: None,
            timestamp: 1,
        };
        assert!(elapsed.is_expired(now_nanos(), None));
    }

    #[test]
    fn test_route_hop_lookup() {
        let mut route = Route::direct("tracepost", "moonbeam");
        route.route_type = RouteType::ViaRelay;
        route.hops = vec![
            RouteHop {
                chain_id: "polkadot".into(),
                para_id: None,
                bridge_contract: None,
            },
            RouteHop {
                chain_id: "moonbeam".into(),
                para_id: Some(2004),
                bridge_contract: None,
            },
        ];
        assert_eq!(route.hop_for("moonbeam").and_then(|h| h.para_id), Some(2004));
        assert!(route.hop_for("acala").is_none());
        assert!(route.is_multi_hop());
    }

    #[test]
    fn test_remote_channel_enums() {
        assert_eq!(ChannelState::from_remote("STATE_OPEN"), ChannelState::Open);
        assert_eq!(ChannelState::from_remote("TRYOPEN"), ChannelState::TryOpen);
        assert_eq!(ChannelOrdering::from_remote("ORDER_ORDERED"), ChannelOrdering::Ordered);
        assert_eq!(ChannelOrdering::from_remote("UNORDERED"), ChannelOrdering::Unordered);
    }
}
