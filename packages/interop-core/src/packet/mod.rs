use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    config::LocalChainConfig,
    registry::{AssetRegistry, ChainDirectory, ChannelRegistry, RouteRegistry},
    types::{amount, Height, Message, MessageKind, Payload, ProtocolFamily},
    Error,
};

/// 包构建器特征：每个协议族一个实现，把已校验的消息转换成该协议的线上请求
pub trait PacketBuilder: Send + Sync {
    /// 构建器服务的协议族
    fn family(&self) -> ProtocolFamily;

    /// 构建前必须解析到的路径类型
    fn requirement(&self) -> Requirement;

    /// 不分配序号、不发网络请求的前置检查；失败即构建期拒绝
    fn preflight(
        &self,
        source: &str,
        destination: &str,
        payload: &Payload,
        channel: Option<&str>,
    ) -> Result<(), Error>;

    /// 构建线上请求。失败时不产生任何部分请求。
    fn build(&self, message: &Message) -> Result<Outbound, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Channel,
    Route,
}

/// 构建完成的消息及其线上请求，二者一起进入消息台账
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub message: Message,
    pub request: WireRequest,
}

/// 构建器所需的共享注册表
#[derive(Clone)]
pub struct BuilderContext {
    pub local: LocalChainConfig,
    pub chains: Arc<ChainDirectory>,
    pub channels: Arc<ChannelRegistry>,
    pub routes: Arc<RouteRegistry>,
    pub assets: Arc<AssetRegistry>,
}

/// 构建器工厂，按目标链登记的协议族创建构建器
pub trait PacketBuilderFactory {
    fn create_builder(&self, family: ProtocolFamily) -> Box<dyn PacketBuilder>;
}

pub struct DefaultPacketBuilderFactory {
    context: BuilderContext,
}

impl DefaultPacketBuilderFactory {
    pub fn new(context: BuilderContext) -> Self {
        Self { context }
    }
}

impl PacketBuilderFactory for DefaultPacketBuilderFactory {
    fn create_builder(&self, family: ProtocolFamily) -> Box<dyn PacketBuilder> {
        let ctx = self.context.clone();
        match family {
            ProtocolFamily::Ibc => Box::new(IbcPacketBuilder::new(ctx.local, ctx.channels, ctx.assets)),
            ProtocolFamily::Xcm => Box::new(XcmPacketBuilder::new(
                ctx.local,
                ctx.chains,
                ctx.routes,
                ctx.assets,
            )),
        }
    }
}

/// 发往中继的请求体。存入快照时带协议标签；发送时只序列化内层结构。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "body", rename_all = "lowercase")]
pub enum WireRequest {
    Ibc(IbcPacketRequest),
    Xcm(XcmRequest),
}

impl WireRequest {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            WireRequest::Ibc(_) => ProtocolFamily::Ibc,
            WireRequest::Xcm(_) => ProtocolFamily::Xcm,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            WireRequest::Ibc(r) => &r.message_id,
            WireRequest::Xcm(r) => &r.message_id,
        }
    }

    pub fn destination_chain(&self) -> &str {
        match self {
            WireRequest::Ibc(r) => &r.destination_chain_id,
            WireRequest::Xcm(r) => &r.destination_chain_id,
        }
    }

    /// 转账金额（调用类消息为 None）
    pub fn amount(&self) -> Option<u128> {
        match self {
            WireRequest::Ibc(r) => match &r.data {
                IbcPacketData::Transfer { token, .. } => Some(token.amount),
                IbcPacketData::Call { .. } => None,
            },
            WireRequest::Xcm(r) => r.instructions.iter().find_map(|i| match i {
                XcmInstruction::ReserveAssetDeposited(assets) => {
                    assets.first().map(|a| a.fun.amount())
                }
                _ => None,
            }),
        }
    }

    pub fn body(&self) -> Result<serde_json::Value, Error> {
        let value = match self {
            WireRequest::Ibc(r) => serde_json::to_value(r),
            WireRequest::Xcm(r) => serde_json::to_value(r),
        };
        value.map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    #[serde(with = "amount")]
    pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packet_type", rename_all = "snake_case")]
pub enum IbcPacketData {
    /// ICS-20 代币转账：面额和数量原样携带
    Transfer { token: Coin, receiver: String },
    Call { call_data: String, max_gas: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbcPacketRequest {
    pub message_id: String,
    pub destination_chain_id: String,
    pub source_port: String,
    pub source_channel: String,
    pub destination_port: String,
    pub destination_channel: String,
    pub sender: String,
    #[serde(flatten)]
    pub data: IbcPacketData,
    pub timeout_height: Height,
    /// unix 纳秒
    pub timeout_timestamp: u64,
    pub packet_sequence: u64,
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetId {
    Concrete(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fungibility {
    Fungible(#[serde(with = "amount")] u128),
}

impl Fungibility {
    pub fn amount(&self) -> u128 {
        match self {
            Fungibility::Fungible(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiAsset {
    pub id: AssetId,
    pub fun: Fungibility,
}

impl MultiAsset {
    pub fn fungible(location: serde_json::Value, amount: u128) -> Self {
        Self {
            id: AssetId::Concrete(location),
            fun: Fungibility::Fungible(amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightLimit {
    Unlimited,
    Limited(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginKind {
    Native,
    SovereignAccount,
    Xcm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WildAsset {
    AllCounted(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetFilter {
    Wild(WildAsset),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedCall {
    pub encoded: String,
}

/// XCM v3 指令（仅本中继会生成的子集）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum XcmInstruction {
    ReserveAssetDeposited(Vec<MultiAsset>),
    ClearOrigin,
    BuyExecution {
        fees: MultiAsset,
        weight_limit: WeightLimit,
    },
    DepositAsset {
        assets: AssetFilter,
        beneficiary: serde_json::Value,
    },
    Transact {
        origin_kind: OriginKind,
        require_weight_at_most: u64,
        call: EncodedCall,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XcmRequest {
    pub message_id: String,
    pub source_chain_id: String,
    pub destination_chain_id: String,
    pub message_type: MessageKind,
    pub xcm_version: String,
    pub call: String,
    /// 目标 MultiLocation
    pub destination: serde_json::Value,
    pub instructions: Vec<XcmInstruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_para_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_para_id: Option<u32>,
    /// unix 纳秒
    pub timeout_timestamp: u64,
}

pub mod ibc;
pub mod xcm;

pub use ibc::IbcPacketBuilder;
pub use xcm::XcmPacketBuilder;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::{ChainConfig, LocalChainConfig};
    use crate::types::{Asset, Channel, Route, Timeout};
    use serde_json::json;

    pub fn local() -> LocalChainConfig {
        LocalChainConfig {
            id: "tracepost".into(),
            parachain_id: Some(2025),
            account_address: "tp1sender".into(),
        }
    }

    pub fn chains() -> Arc<ChainDirectory> {
        Arc::new(ChainDirectory::new(vec![
            ChainConfig {
                id: "cosmoshub".into(),
                protocol: ProtocolFamily::Ibc,
                relayer_url: "http://127.0.0.1:1".into(),
                api_key: None,
                parachain_id: None,
                relay_chain_url: None,
            },
            ChainConfig {
                id: "moonbeam".into(),
                protocol: ProtocolFamily::Xcm,
                relayer_url: "http://127.0.0.1:2".into(),
                api_key: None,
                parachain_id: Some(2004),
                relay_chain_url: None,
            },
        ]))
    }

    pub fn usdc() -> Asset {
        Asset {
            id: "usdc".into(),
            name: "USD Coin".into(),
            symbol: "USDC".into(),
            decimals: 6,
            origin_chain: "tracepost".into(),
            location: json!({ "parents": 0, "interior": { "X1": { "GeneralIndex": 1337 } } }),
            metadata_uri: None,
        }
    }

    pub fn context() -> BuilderContext {
        let channels = Arc::new(ChannelRegistry::new());
        let mut ch = Channel::new("ch-1", "transfer", "channel-7", "transfer", "cosmoshub");
        ch.next_sequence = 5;
        channels.register_channel(ch);

        let routes = Arc::new(RouteRegistry::new());
        routes.register_route(Route::direct("tracepost", "moonbeam"));

        let assets = Arc::new(AssetRegistry::new());
        assets.register_asset(usdc());

        BuilderContext {
            local: local(),
            chains: chains(),
            channels,
            routes,
            assets,
        }
    }

    pub fn message(destination: &str, payload: Payload) -> Message {
        Message {
            id: format!("{}-{:?}", destination, payload),
            source_chain: "tracepost".into(),
            destination_chain: destination.into(),
            source_channel: None,
            destination_channel: None,
            source_port: None,
            destination_port: None,
            payload,
            created_at: 1,
            timeout: Timeout {
                height: Some(Height::new(0, 2_000)),
                timestamp: 9_000_000_000_000_000_000,
            },
            status: crate::types::MessageStatus::Pending,
            sequence: None,
            weight: None,
            memo: None,
            relayer_address: None,
            fee: None,
            tx_handle: None,
            failure_reason: None,
            commitment: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_factory_selects_by_family() {
        let factory = DefaultPacketBuilderFactory::new(context());
        let ibc = factory.create_builder(ProtocolFamily::Ibc);
        let xcm = factory.create_builder(ProtocolFamily::Xcm);
        assert_eq!(ibc.family(), ProtocolFamily::Ibc);
        assert_eq!(ibc.requirement(), Requirement::Channel);
        assert_eq!(xcm.family(), ProtocolFamily::Xcm);
        assert_eq!(xcm.requirement(), Requirement::Route);
    }

    #[test]
    fn test_wire_request_snapshot_form() {
        let builder = IbcPacketBuilder::new(local(), context().channels, context().assets);
        let outbound = builder
            .build(&message("cosmoshub", Payload::transfer("usdc", 100, "cosmos1bob").unwrap()))
            .unwrap();

        let tagged = serde_json::to_value(&outbound.request).unwrap();
        assert_eq!(tagged["protocol"], "ibc");
        let restored: WireRequest = serde_json::from_value(tagged).unwrap();
        assert_eq!(restored, outbound.request);

        let body = outbound.request.body().unwrap();
        assert_eq!(body["packet_type"], "transfer");
        assert_eq!(body["token"]["amount"], "100");
        assert!(body.get("protocol").is_none());
    }
}
