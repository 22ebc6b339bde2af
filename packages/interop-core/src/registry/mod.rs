//! 通道、路由、资产与信任参数的显式注册表。
//!
//! 每个注册表自带内部锁，由 `Bridge` 持有并以 `Arc` 共享给构建器和状态引擎。

pub mod asset;
pub mod chain;
pub mod channel;
pub mod route;
pub mod trust;

pub use asset::AssetRegistry;
pub use chain::ChainDirectory;
pub use channel::ChannelRegistry;
pub use route::RouteRegistry;
pub use trust::TrustRegistry;
