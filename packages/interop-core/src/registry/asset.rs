use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::types::Asset;
use crate::ConfigurationError;

#[derive(Default)]
pub struct AssetRegistry {
    assets: RwLock<HashMap<String, Asset>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asset(&self, asset: Asset) {
        info!(asset = %asset.id, origin = %asset.origin_chain, "Registered asset");
        self.assets.write().insert(asset.id.clone(), asset);
    }

    /// 未注册的资产是构建期错误，不做默认值
    pub fn get_asset(&self, id: &str) -> Result<Asset, ConfigurationError> {
        self.assets
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnregisteredAsset(id.to_string()))
    }

    pub fn list_assets(&self) -> Vec<Asset> {
        let mut assets: Vec<_> = self.assets.read().values().cloned().collect();
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        assets
    }

    /// 远端回读的资产覆盖本地同 ID 记录
    pub fn overwrite(&self, assets: Vec<Asset>) {
        let mut table = self.assets.write();
        for asset in assets {
            table.insert(asset.id.clone(), asset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usdc(location: serde_json::Value) -> Asset {
        Asset {
            id: "usdc".into(),
            name: "USD Coin".into(),
            symbol: "USDC".into(),
            decimals: 6,
            origin_chain: "tracepost".into(),
            location,
            metadata_uri: None,
        }
    }

    #[test]
    fn test_unregistered_asset_is_an_error() {
        let registry = AssetRegistry::new();
        assert_eq!(
            registry.get_asset("unknown"),
            Err(ConfigurationError::UnregisteredAsset("unknown".into()))
        );
    }

    #[test]
    fn test_overwrite_replaces_location() {
        let registry = AssetRegistry::new();
        registry.register_asset(usdc(json!({"parents": 0, "interior": "Here"})));
        registry.overwrite(vec![usdc(json!("uusdc"))]);

        let asset = registry.get_asset("usdc").unwrap();
        assert_eq!(asset.denom(), "uusdc");
        assert_eq!(registry.list_assets().len(), 1);
    }
}
