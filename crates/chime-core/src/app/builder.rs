//! ServiceBuilder - wiring and fail-fast validation of the processing service.

use std::sync::Arc;

use crate::app::config::ServiceConfig;
use crate::app::dead_loop::DeadSignalProcessor;
use crate::app::distributor::SignalDistributor;
use crate::app::service::SignalProcessingService;
use crate::app::zombie_loop::ZombieSignalProcessor;
use crate::domain::ConfigError;
use crate::ports::{
    Clock, DistributionGateway, DistributionPolicyProvider, NotificationSubscriber, SignalStore,
    SystemClock,
};

/// Builds a [`SignalProcessingService`].
///
/// ```ignore
/// let service = ServiceBuilder::new()
///     .store(store)
///     .gateway(gateway)
///     .policies(policies)
///     .subscriber(subscriber)
///     .config(config)
///     .build()?;
/// ```
///
/// `build()` rejects a missing store or gateway, an invalid [`ServiceConfig`]
/// and a policy provider holding an invalid policy before anything starts.
#[derive(Default)]
pub struct ServiceBuilder {
    store: Option<Arc<dyn SignalStore>>,
    gateway: Option<Arc<dyn DistributionGateway>>,
    policies: Option<Arc<dyn DistributionPolicyProvider>>,
    clock: Option<Arc<dyn Clock>>,
    subscriber: Option<Arc<dyn NotificationSubscriber>>,
    config: ServiceConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn DistributionGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Defaults to the provider built from `config.policies`.
    pub fn policies(mut self, policies: Arc<dyn DistributionPolicyProvider>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Optional. Without one, distributors rely on their poll cadence alone.
    pub fn subscriber(mut self, subscriber: Arc<dyn NotificationSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SignalProcessingService, BuildError> {
        let store = self.store.ok_or(BuildError::MissingComponent("store"))?;
        let gateway = self.gateway.ok_or(BuildError::MissingComponent("gateway"))?;
        self.config.validate()?;
        let policies: Arc<dyn DistributionPolicyProvider> = match self.policies {
            Some(policies) => policies,
            None => Arc::new(self.config.policies.build_provider()?),
        };
        policies.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config;

        let distributors = (0..config.distributors)
            .map(|id| {
                Arc::new(SignalDistributor::new(
                    id,
                    Arc::clone(&store),
                    Arc::clone(&gateway),
                    Arc::clone(&policies),
                    Arc::clone(&clock),
                    config.distributor.clone(),
                ))
            })
            .collect();
        let zombie = ZombieSignalProcessor::new(
            Arc::clone(&store),
            Arc::clone(&policies),
            Arc::clone(&clock),
            config.zombie.clone(),
        );
        let dead = DeadSignalProcessor::new(store, clock, config.dead.clone());

        Ok(SignalProcessingService::new(
            distributors,
            zombie,
            dead,
            self.subscriber,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::PolicyConfig;
    use crate::domain::{DeliveryError, DistributionPolicy, SignalKey};
    use crate::impls::{InMemorySignalStore, StaticPolicyProvider};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullGateway;

    #[async_trait]
    impl DistributionGateway for NullGateway {
        async fn distribute(&self, _key: &SignalKey, _payload: &str) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn complete() -> ServiceBuilder {
        ServiceBuilder::new()
            .store(Arc::new(InMemorySignalStore::new()))
            .gateway(Arc::new(NullGateway))
            .policies(Arc::new(StaticPolicyProvider::new(
                DistributionPolicy::default(),
            )))
    }

    #[test]
    fn build_success() {
        let config = ServiceConfig {
            distributors: 3,
            ..ServiceConfig::default()
        };
        let service = complete().config(config).build().unwrap();
        assert_eq!(service.distributors().len(), 3);
    }

    #[test]
    fn build_missing_gateway() {
        let result = ServiceBuilder::new()
            .store(Arc::new(InMemorySignalStore::new()))
            .policies(Arc::new(StaticPolicyProvider::new(
                DistributionPolicy::default(),
            )))
            .build();
        assert!(matches!(result, Err(BuildError::MissingComponent("gateway"))));
    }

    #[test]
    fn build_missing_store() {
        let result = ServiceBuilder::new().gateway(Arc::new(NullGateway)).build();
        assert!(matches!(result, Err(BuildError::MissingComponent("store"))));
    }

    #[test]
    fn build_invalid_config() {
        let config = ServiceConfig {
            distributors: 0,
            ..ServiceConfig::default()
        };
        let result = complete().config(config).build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::Zero("distributors")))
        ));
    }

    #[test]
    fn build_rejects_provider_with_zero_processing_timeout() {
        let result = ServiceBuilder::new()
            .store(Arc::new(InMemorySignalStore::new()))
            .gateway(Arc::new(NullGateway))
            .policies(Arc::new(StaticPolicyProvider::new(DistributionPolicy::new(
                vec![],
                Duration::ZERO,
                Duration::ZERO,
            ))))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::Config(ConfigError::Zero("processing_timeout")))
        ));
    }

    #[test]
    fn build_falls_back_to_configured_policies() {
        let mut config = ServiceConfig::default();
        config.policies.groups.insert(
            "billing".to_string(),
            PolicyConfig {
                retry_delays_ms: vec![10],
                ..PolicyConfig::default()
            },
        );
        let service = ServiceBuilder::new()
            .store(Arc::new(InMemorySignalStore::new()))
            .gateway(Arc::new(NullGateway))
            .config(config.clone())
            .build()
            .unwrap();
        assert_eq!(service.distributors().len(), 1);

        config.policies.groups.insert(
            "billing".to_string(),
            PolicyConfig {
                processing_timeout_ms: 0,
                ..PolicyConfig::default()
            },
        );
        let result = ServiceBuilder::new()
            .store(Arc::new(InMemorySignalStore::new()))
            .gateway(Arc::new(NullGateway))
            .config(config)
            .build();
        assert!(matches!(result, Err(BuildError::Config(ConfigError::Zero(_)))));
    }
}
