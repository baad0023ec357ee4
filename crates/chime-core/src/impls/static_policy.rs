//! StaticPolicyProvider - fixed group -> policy table built at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{ConfigError, DistributionPolicy};
use crate::ports::DistributionPolicyProvider;

/// Immutable policy table; lookups need no locking.
#[derive(Debug, Clone)]
pub struct StaticPolicyProvider {
    policies: HashMap<String, Arc<DistributionPolicy>>,
    default_policy: Arc<DistributionPolicy>,
}

impl StaticPolicyProvider {
    /// Provider with only a default policy.
    pub fn new(default_policy: DistributionPolicy) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy: Arc::new(default_policy),
        }
    }

    pub fn builder() -> StaticPolicyProviderBuilder {
        StaticPolicyProviderBuilder::default()
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

impl DistributionPolicyProvider for StaticPolicyProvider {
    fn policy(&self, group: &str) -> Option<Arc<DistributionPolicy>> {
        self.policies.get(group).cloned()
    }

    fn default_policy(&self) -> Arc<DistributionPolicy> {
        Arc::clone(&self.default_policy)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.default_policy.validate()?;
        self.policies.values().try_for_each(|policy| policy.validate())
    }
}

/// Builder for [`StaticPolicyProvider`].
///
/// `build()` fails on a missing default policy, a group registered twice or
/// an invalid policy.
#[derive(Debug, Default)]
pub struct StaticPolicyProviderBuilder {
    policies: Vec<(String, DistributionPolicy)>,
    default_policy: Option<DistributionPolicy>,
}

impl StaticPolicyProviderBuilder {
    pub fn register(mut self, group: impl Into<String>, policy: DistributionPolicy) -> Self {
        self.policies.push((group.into(), policy));
        self
    }

    pub fn default_policy(mut self, policy: DistributionPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<StaticPolicyProvider, ConfigError> {
        let default_policy = self
            .default_policy
            .ok_or(ConfigError::MissingDefaultPolicy)?;
        default_policy.validate()?;

        let mut policies = HashMap::with_capacity(self.policies.len());
        for (group, policy) in self.policies {
            if policies.contains_key(&group) {
                return Err(ConfigError::DuplicatePolicy(group));
            }
            policy.validate()?;
            policies.insert(group, Arc::new(policy));
        }

        Ok(StaticPolicyProvider {
            policies,
            default_policy: Arc::new(default_policy),
        })
    }
}
