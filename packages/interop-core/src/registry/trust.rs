use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::types::{ChainId, TrustedChainProfile};
use crate::ConfigurationError;

#[derive(Default)]
pub struct TrustRegistry {
    profiles: RwLock<HashMap<ChainId, TrustedChainProfile>>,
}

impl TrustRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trusted_chain(&self, profile: TrustedChainProfile) {
        info!(
            chain = %profile.chain_id,
            client_type = %profile.client_type,
            trust_level = profile.trust_level,
            "Added trusted chain"
        );
        self.profiles.write().insert(profile.chain_id.clone(), profile);
    }

    pub fn get_profile(&self, chain: &str) -> Option<TrustedChainProfile> {
        self.profiles.read().get(chain).cloned()
    }

    pub fn get_trust_level(&self, chain: &str) -> Result<f64, ConfigurationError> {
        self.get_profile(chain)
            .map(|p| p.trust_level)
            .ok_or_else(|| ConfigurationError::UntrustedChain(chain.to_string()))
    }

    pub fn list_profiles(&self) -> Vec<TrustedChainProfile> {
        let mut profiles: Vec<_> = self.profiles.read().values().cloned().collect();
        profiles.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        profiles
    }

    /// 在为目标链构建新超时之前检查其信任参数。
    ///
    /// 没有登记信任参数的链不受约束。`observed_height` 为本次查询到的远端高度
    /// （只对高度感知的协议有值）。
    pub fn check_fresh(
        &self,
        chain: &str,
        now_secs: u64,
        timeout_secs: u64,
        observed_height: Option<u64>,
    ) -> Result<(), ConfigurationError> {
        let Some(profile) = self.get_profile(chain) else {
            return Ok(());
        };
        let stale = |reason: String| ConfigurationError::StaleTrust {
            chain: chain.to_string(),
            reason,
        };

        if let Some(verified_at) = profile.last_verified_at {
            let age = now_secs.saturating_sub(verified_at);
            if age > profile.trusting_period {
                warn!(chain, age, trusting_period = profile.trusting_period, "Trust profile expired");
                return Err(stale(format!(
                    "last verified {}s ago, trusting period is {}s",
                    age, profile.trusting_period
                )));
            }
        }
        if let Some(height) = observed_height {
            if height < profile.last_verified_height {
                return Err(stale(format!(
                    "reported height {} is below last verified height {}",
                    height, profile.last_verified_height
                )));
            }
        }
        if timeout_secs <= profile.max_clock_drift {
            return Err(stale(format!(
                "timeout window {}s does not exceed allowed clock drift {}s",
                timeout_secs, profile.max_clock_drift
            )));
        }
        Ok(())
    }

    /// 记录一次成功的高度观测
    pub fn record_verified(&self, chain: &str, height: u64, now_secs: u64) {
        if let Some(profile) = self.profiles.write().get_mut(chain) {
            profile.last_verified_height = profile.last_verified_height.max(height);
            profile.last_verified_at = Some(now_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> TrustedChainProfile {
        TrustedChainProfile {
            chain_id: "cosmoshub".into(),
            trusting_period: 14 * 24 * 3600,
            max_clock_drift: 10,
            client_type: "07-tendermint".into(),
            last_verified_height: 1_000,
            trust_level: 1.0 / 3.0,
            last_verified_at: Some(1_000_000),
        }
    }

    #[test]
    fn test_untracked_chain_is_unconstrained() {
        let registry = TrustRegistry::new();
        assert!(registry.check_fresh("osmosis", 0, 1, None).is_ok());
        assert!(registry.get_trust_level("osmosis").is_err());
    }

    #[test]
    fn test_trusting_period_elapsed() {
        let registry = TrustRegistry::new();
        registry.add_trusted_chain(profile());
        let too_late = 1_000_000 + 14 * 24 * 3600 + 1;
        assert!(matches!(
            registry.check_fresh("cosmoshub", too_late, 600, Some(2_000)),
            Err(ConfigurationError::StaleTrust { .. })
        ));
        assert!(registry.check_fresh("cosmoshub", 1_000_100, 600, Some(2_000)).is_ok());
    }

    #[test]
    fn test_height_regression_and_drift() {
        let registry = TrustRegistry::new();
        registry.add_trusted_chain(profile());
        assert!(registry.check_fresh("cosmoshub", 1_000_100, 600, Some(999)).is_err());
        assert!(registry.check_fresh("cosmoshub", 1_000_100, 10, Some(1_001)).is_err());
    }

    #[test]
    fn test_record_verified_advances() {
        let registry = TrustRegistry::new();
        registry.add_trusted_chain(profile());
        registry.record_verified("cosmoshub", 1_500, 2_000_000);
        registry.record_verified("cosmoshub", 1_200, 2_000_001);

        let p = registry.get_profile("cosmoshub").unwrap();
        assert_eq!(p.last_verified_height, 1_500);
        assert_eq!(p.last_verified_at, Some(2_000_001));
        assert!((registry.get_trust_level("cosmoshub").unwrap() - 1.0 / 3.0).abs() < f64::EPSILON);
    }
}
