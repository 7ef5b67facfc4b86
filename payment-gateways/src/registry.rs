use shared::Gateway;
use std::collections::HashMap;
use std::sync::Arc;

use crate::gateway::PaymentGateway;

/// Explicitly constructed set of adapters, injected wherever gateways are needed.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<Gateway, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.kind(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, kind: Gateway) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&kind).cloned()
    }

    /// Looks a gateway up by its path segment (`wallet`, `card`, ...).
    pub fn resolve(&self, slug: &str) -> Option<Arc<dyn PaymentGateway>> {
        slug.parse::<Gateway>().ok().and_then(|kind| self.get(kind))
    }

    pub fn kinds(&self) -> Vec<Gateway> {
        let mut kinds: Vec<Gateway> = self.gateways.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;

    #[test]
    fn resolves_by_path_segment() {
        let registry = GatewayRegistry::new()
            .with(Arc::new(MockGateway::new(Gateway::HostedCard, "s1")))
            .with(Arc::new(MockGateway::new(Gateway::CashVoucher, "s2")));

        assert_eq!(registry.resolve("card").map(|g| g.kind()), Some(Gateway::HostedCard));
        assert!(registry.resolve("wallet").is_none());
        assert!(registry.resolve("nonsense").is_none());
        assert_eq!(registry.kinds(), vec![Gateway::HostedCard, Gateway::CashVoucher]);
    }
}
