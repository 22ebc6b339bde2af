use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    packet::WireRequest,
    types::{Asset, Channel, Route},
    Error,
};

pub mod http;

pub use http::HttpTransport;

/// 中继接受提交后的回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// 交易句柄；中继没有返回时为本地消息 ID
    pub handle: String,
    pub from_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Success,
    Failed(String),
}

/// 按通道坐标查询包是否已被接收
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketQuery {
    pub source_chain_id: String,
    pub source_channel: String,
    pub destination_channel: String,
    pub packet_sequence: u64,
}

/// 中继传输适配器。
///
/// 每个方法都区分三种结果：`Error::Transport`（无响应或可重试的服务端错误）、
/// `Error::ProtocolRejection`（结构化的拒绝）与成功。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn submit(&self, request: &WireRequest) -> Result<SubmitReceipt, Error>;

    async fn query_status(&self, chain: &str, handle: &str) -> Result<RemoteStatus, Error>;

    /// 高度感知链的最新区块高度
    async fn latest_height(&self, chain: &str) -> Result<u64, Error>;

    /// 目标链报告的包承诺；尚无承诺时为 None
    async fn packet_commitment(
        &self,
        chain: &str,
        port: &str,
        channel: &str,
        sequence: u64,
    ) -> Result<Option<String>, Error>;

    async fn packet_received(&self, chain: &str, query: &PacketQuery) -> Result<bool, Error>;

    async fn message_verified(&self, chain: &str, message_id: &str) -> Result<bool, Error>;

    async fn query_channels(&self, chain: &str) -> Result<Vec<Channel>, Error>;

    async fn query_routes(&self, chain: &str) -> Result<Vec<Route>, Error>;

    async fn query_assets(&self, chain: &str) -> Result<Vec<Asset>, Error>;

    /// 在中继链上登记平行链（管理类操作，较长超时）
    async fn register_parachain(&self, chain: &str, parachain_id: u32, endpoint: &str) -> Result<(), Error>;

    /// 返回中继链确认的新同步高度
    async fn sync_relay_chain(&self, chain: &str, parachain_id: u32, last_sync_height: u64) -> Result<u64, Error>;
}
