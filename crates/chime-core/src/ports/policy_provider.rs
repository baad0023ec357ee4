//! DistributionPolicyProvider port - group to policy lookup.

use std::sync::Arc;

use crate::domain::{ConfigError, DistributionPolicy};

pub trait DistributionPolicyProvider: Send + Sync {
    /// Group-specific policy, if one is configured.
    fn policy(&self, group: &str) -> Option<Arc<DistributionPolicy>>;

    fn default_policy(&self) -> Arc<DistributionPolicy>;

    /// Checked once by the service builder before any loop starts.
    fn validate(&self) -> Result<(), ConfigError> {
        self.default_policy().validate()
    }

    fn policy_or_default(&self, group: &str) -> Arc<DistributionPolicy> {
        self.policy(group).unwrap_or_else(|| self.default_policy())
    }
}
