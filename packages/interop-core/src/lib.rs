pub mod config;
pub mod types;
pub mod registry;
pub mod envelope;
pub mod packet;
pub mod transport;
pub mod verify;
pub mod relayer;

pub use config::Config;
pub use types::{
    Asset, Channel, ChannelOrdering, ChannelState, Height, Message, MessageKind, MessageStatus,
    Payload, ProtocolFamily, Route, RouteHop, RouteStatus, RouteType, TrustedChainProfile,
};
pub use relayer::Bridge;

/// 构建期拒绝：在任何网络调用之前返回给调用方
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Asset not registered: {0}")]
    UnregisteredAsset(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Channel {channel} is not OPEN (state: {state})")]
    ChannelNotOpen { channel: String, state: String },

    #[error("No route from {origin} to {destination}")]
    RouteNotFound { origin: String, destination: String },

    #[error("Route from {origin} to {destination} is disabled")]
    RouteDisabled { origin: String, destination: String },

    #[error("No hop on route {origin} -> {destination} serves chain {chain}")]
    UnroutableHop {
        origin: String,
        destination: String,
        chain: String,
    },

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Chain {chain} does not speak {expected}")]
    WrongProtocol { chain: String, expected: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Trust profile for {chain} is stale: {reason}")]
    StaleTrust { chain: String, reason: String },

    #[error("Trusted chain not registered: {0}")]
    UntrustedChain(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol rejection (HTTP {status}): {reason}")]
    ProtocolRejection { status: u16, reason: String },

    #[error("Timeout expired: {0}")]
    TimeoutExpired(String),

    #[error("Gave up after {attempts} attempts, retry later: {last_error}")]
    RetryLater { attempts: u32, last_error: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: MessageStatus, to: MessageStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// 传输层失败可以用同一个消息 ID 重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RetryLater { .. } | Error::DeadlineExceeded
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
