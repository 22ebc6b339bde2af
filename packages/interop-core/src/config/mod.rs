use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::types::{Asset, Channel, ProtocolFamily, Route, TrustedChainProfile};
use crate::Error;

/// 本地账本（消息的源链）
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalChainConfig {
    pub id: String,
    #[serde(default)]
    pub parachain_id: Option<u32>,
    pub account_address: String,
}

/// 一条远端链及其中继端点
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub id: String,
    pub protocol: ProtocolFamily,
    pub relayer_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub parachain_id: Option<u32>,
    /// 管理类操作（平行链注册、同步）使用的中继链端点
    #[serde(default)]
    pub relay_chain_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    /// 秒
    pub poll_interval: u64,
    pub max_retries: u32,
    /// 指数退避的基数，秒
    pub retry_delay: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_admin_timeout")]
    pub admin_timeout: u64,
    #[serde(default = "default_height_cache_ttl")]
    pub height_cache_ttl: u64,
    #[serde(default = "default_timeout_block_margin")]
    pub timeout_block_margin: u64,
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u64,
    #[serde(default = "default_verification_cache_ttl")]
    pub verification_cache_ttl: u64,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_admin_timeout() -> u64 {
    120
}

fn default_height_cache_ttl() -> u64 {
    60
}

fn default_timeout_block_margin() -> u64 {
    1000
}

fn default_timeout_minutes() -> u64 {
    10
}

fn default_verification_cache_ttl() -> u64 {
    300
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            max_retries: 3,
            retry_delay: 2,
            request_timeout: default_request_timeout(),
            admin_timeout: default_admin_timeout(),
            height_cache_ttl: default_height_cache_ttl(),
            timeout_block_margin: default_timeout_block_margin(),
            default_timeout_minutes: default_timeout_minutes(),
            verification_cache_ttl: default_verification_cache_ttl(),
        }
    }
}

impl RelayerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn height_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.height_cache_ttl)
    }

    pub fn verification_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.verification_cache_ttl)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub local_chain: LocalChainConfig,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub trusted_chains: Vec<TrustedChainProfile>,
    #[serde(default)]
    pub relayer: RelayerConfig,
}

impl Config {
    /// 按扩展名选择格式：`.toml` 用 TOML，其余按 JSON 解析
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            Self::from_toml_str(&config_str)?
        } else {
            Self::from_json_str(&config_str)?
        };

        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.local_chain.id.trim().is_empty() {
            return Err(Error::Config("Local chain id must not be empty".to_string()));
        }

        // 链配置
        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if chain.id == self.local_chain.id {
                return Err(Error::Config(format!(
                    "Remote chain {} has the same id as the local chain",
                    chain.id
                )));
            }
            if !chain_ids.insert(chain.id.as_str()) {
                return Err(Error::Config(format!("Duplicate chain id: {}", chain.id)));
            }
            if !chain.relayer_url.starts_with("http://") && !chain.relayer_url.starts_with("https://") {
                return Err(Error::Config(format!(
                    "Invalid relayer url for chain {}: {}",
                    chain.id, chain.relayer_url
                )));
            }
        }
        let known = |id: &str| id == self.local_chain.id || chain_ids.contains(id);

        // 通道只能指向 IBC 链
        for channel in &self.channels {
            match self.get_chain_config(&channel.counterparty_chain) {
                Some(chain) if chain.protocol == ProtocolFamily::Ibc => {}
                Some(chain) => {
                    return Err(Error::Config(format!(
                        "Channel {} points at non-IBC chain {}",
                        channel.channel_id, chain.id
                    )))
                }
                None => {
                    return Err(Error::Config(format!(
                        "Invalid chain ID in channel config: {}",
                        channel.counterparty_chain
                    )))
                }
            }
            if channel.next_sequence == 0 {
                return Err(Error::Config(format!(
                    "Channel {} next_sequence must start at 1 or above",
                    channel.channel_id
                )));
            }
        }

        for route in &self.routes {
            if !known(&route.source_chain) || !known(&route.destination_chain) {
                return Err(Error::Config(format!(
                    "Invalid chain ID in route config: {} -> {}",
                    route.source_chain, route.destination_chain
                )));
            }
        }

        for asset in &self.assets {
            if !known(&asset.origin_chain) {
                return Err(Error::Config(format!(
                    "Invalid chain ID in asset config: {}",
                    asset.origin_chain
                )));
            }
        }
        for route in &self.routes {
            if let Some(fee_asset) = &route.fee_asset {
                if !self.assets.iter().any(|a| &a.id == fee_asset) {
                    return Err(Error::Config(format!(
                        "Route fee asset is not configured: {}",
                        fee_asset
                    )));
                }
            }
        }

        for profile in &self.trusted_chains {
            if !(0.0..=1.0).contains(&profile.trust_level) || profile.trust_level == 0.0 {
                return Err(Error::Config(format!(
                    "Trust level for {} must be in (0, 1]",
                    profile.chain_id
                )));
            }
        }

        // 中继器配置
        if self.relayer.poll_interval == 0 {
            return Err(Error::Config("Relayer poll interval must be greater than 0".to_string()));
        }
        if self.relayer.max_retries == 0 {
            return Err(Error::Config("Relayer max retries must be greater than 0".to_string()));
        }
        if self.relayer.request_timeout == 0 || self.relayer.admin_timeout == 0 {
            return Err(Error::Config("Relayer timeouts must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain_id)
    }

    pub fn get_asset_config(&self, asset_id: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == asset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "local_chain": { "id": "tracepost", "parachain_id": 2025, "account_address": "tp1sender" },
        "chains": [
            { "id": "cosmoshub", "protocol": "ibc", "relayer_url": "http://localhost:1317", "api_key": "k" },
            { "id": "moonbeam", "protocol": "xcm", "relayer_url": "http://localhost:8080", "parachain_id": 2004 }
        ],
        "channels": [
            { "channel_id": "ch-1", "port_id": "transfer", "counterparty_channel_id": "channel-7",
              "counterparty_port_id": "transfer", "counterparty_chain": "cosmoshub", "next_sequence": 5 }
        ],
        "routes": [
            { "source_chain": "tracepost", "destination_chain": "moonbeam", "fee_asset": "usdc", "fee_amount": "10" }
        ],
        "assets": [
            { "id": "usdc", "name": "USD Coin", "symbol": "USDC", "decimals": 6, "origin_chain": "tracepost",
              "location": { "parents": 0, "interior": { "X1": { "GeneralIndex": 1337 } } } }
        ],
        "relayer": { "poll_interval": 5, "max_retries": 3, "retry_delay": 1 }
    }"#;

    #[test]
    fn test_parse_json_config() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.channels[0].next_sequence, 5);
        assert_eq!(config.routes[0].fee_amount, Some(10));
        assert_eq!(config.relayer.request_timeout, 30);
        assert_eq!(config.relayer.admin_timeout, 120);
        assert_eq!(config.relayer.timeout_block_margin, 1000);
        assert_eq!(config.relayer.height_cache_ttl, 60);
    }

    #[test]
    fn test_load_toml_from_file() {
        let raw = r#"
            [local_chain]
            id = "tracepost"
            account_address = "tp1sender"

            [[chains]]
            id = "cosmoshub"
            protocol = "ibc"
            relayer_url = "https://relay.example.org"

            [relayer]
            poll_interval = 5
            max_retries = 2
            retry_delay = 1
            timeout_block_margin = 250
        "#;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.local_chain.id, "tracepost");
        assert_eq!(config.relayer.timeout_block_margin, 250);
        assert_eq!(config.get_chain_config("cosmoshub").unwrap().protocol, ProtocolFamily::Ibc);
    }

    #[test]
    fn test_rejects_channel_to_xcm_chain() {
        let raw = SAMPLE.replace(r#""counterparty_chain": "cosmoshub""#, r#""counterparty_chain": "moonbeam""#);
        assert!(matches!(Config::from_json_str(&raw), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_route_chain() {
        let raw = SAMPLE.replace(r#""destination_chain": "moonbeam""#, r#""destination_chain": "acala""#);
        assert!(Config::from_json_str(&raw).is_err());
    }

    #[test]
    fn test_rejects_zero_retries() {
        let raw = SAMPLE.replace(r#""max_retries": 3"#, r#""max_retries": 0"#);
        assert!(Config::from_json_str(&raw).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/definitely/not/here.json"),
            Err(Error::Config(_))
        ));
    }
}
