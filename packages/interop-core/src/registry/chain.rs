use parking_lot::RwLock;
use std::collections::HashMap;

use crate::config::ChainConfig;
use crate::types::{ChainId, ProtocolFamily};
use crate::ConfigurationError;

/// 远端链目录：链 ID -> 协议族与中继端点
#[derive(Default)]
pub struct ChainDirectory {
    chains: RwLock<HashMap<ChainId, ChainConfig>>,
}

impl ChainDirectory {
    pub fn new(chains: impl IntoIterator<Item = ChainConfig>) -> Self {
        let directory = Self::default();
        for chain in chains {
            directory.register_chain(chain);
        }
        directory
    }

    pub fn register_chain(&self, chain: ChainConfig) {
        self.chains.write().insert(chain.id.clone(), chain);
    }

    pub fn get(&self, chain: &str) -> Result<ChainConfig, ConfigurationError> {
        self.chains
            .read()
            .get(chain)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownChain(chain.to_string()))
    }

    pub fn family(&self, chain: &str) -> Result<ProtocolFamily, ConfigurationError> {
        self.get(chain).map(|c| c.protocol)
    }

    pub fn list(&self) -> Vec<ChainConfig> {
        let mut chains: Vec<_> = self.chains.read().values().cloned().collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));
        chains
    }
}
