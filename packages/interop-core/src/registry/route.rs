use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::types::{ChainId, Route};
use crate::ConfigurationError;

#[derive(Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<(ChainId, ChainId), Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一 (源, 目标) 的路由直接覆盖
    pub fn register_route(&self, route: Route) {
        info!(
            source = %route.source_chain,
            destination = %route.destination_chain,
            hops = route.hops.len(),
            status = ?route.status,
            "Registered route"
        );
        self.routes.write().insert(route.key(), route);
    }

    pub fn get_route(&self, source: &str, destination: &str) -> Option<Route> {
        self.routes
            .read()
            .get(&(source.to_string(), destination.to_string()))
            .cloned()
    }

    /// 精确匹配 (源, 目标)；多跳遍历由调用者通过 `Route::hop_for` 完成
    pub fn resolve_route(&self, source: &str, destination: &str) -> Result<Route, ConfigurationError> {
        self.get_route(source, destination)
            .ok_or_else(|| ConfigurationError::RouteNotFound {
                origin: source.to_string(),
                destination: destination.to_string(),
            })
    }

    pub fn list_routes(&self) -> Vec<Route> {
        let mut routes: Vec<_> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.key().cmp(&b.key()));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RouteStatus;

    #[test]
    fn test_resolve_is_exact_match() {
        let registry = RouteRegistry::new();
        registry.register_route(Route::direct("tracepost", "moonbeam"));

        assert!(registry.resolve_route("tracepost", "moonbeam").is_ok());
        assert!(matches!(
            registry.resolve_route("moonbeam", "tracepost"),
            Err(ConfigurationError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn test_register_overwrites_same_pair() {
        let registry = RouteRegistry::new();
        registry.register_route(Route::direct("tracepost", "moonbeam"));
        registry.register_route(Route::direct("tracepost", "acala"));

        let mut degraded = Route::direct("tracepost", "moonbeam");
        degraded.status = RouteStatus::Degraded;
        registry.register_route(degraded);

        assert_eq!(registry.list_routes().len(), 2);
        assert_eq!(
            registry.get_route("tracepost", "moonbeam").unwrap().status,
            RouteStatus::Degraded
        );
    }
}
