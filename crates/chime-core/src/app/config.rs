//! Runtime configuration.
//!
//! Durations are carried as `*_ms` integers so the structs map one-to-one onto
//! a TOML file. Every field has a default; a file only needs the overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, DistributionPolicy};
use crate::impls::StaticPolicyProvider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Maximum signals claimed per poll.
    pub batch_size: usize,

    /// Sleep between checks while the next poll is not yet due.
    pub idle_tick_ms: u64,

    /// Floor on the spacing between two polls.
    pub min_poll_interval_ms: u64,

    /// Ceiling on the spacing between two polls.
    pub max_poll_interval_ms: u64,

    /// Cold-start delay is drawn uniformly from this window.
    pub startup_jitter_min_ms: u64,
    pub startup_jitter_max_ms: u64,
}

impl DistributorConfig {
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("distributor.batch_size"));
        }
        if self.idle_tick_ms == 0 {
            return Err(ConfigError::Zero("distributor.idle_tick_ms"));
        }
        if self.min_poll_interval_ms > self.max_poll_interval_ms {
            return Err(ConfigError::InvertedRange {
                min: "distributor.min_poll_interval_ms",
                max: "distributor.max_poll_interval_ms",
            });
        }
        if self.startup_jitter_min_ms > self.startup_jitter_max_ms {
            return Err(ConfigError::InvertedRange {
                min: "distributor.startup_jitter_min_ms",
                max: "distributor.startup_jitter_max_ms",
            });
        }
        Ok(())
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            idle_tick_ms: 100,
            min_poll_interval_ms: 1_000,
            max_poll_interval_ms: 60_000,
            startup_jitter_min_ms: 2_000,
            startup_jitter_max_ms: 5_000,
        }
    }
}

/// Zombie reclaim loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl ZombieConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 120_000,
        }
    }
}

/// Dead-signal reaper loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl DeadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DeadConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 300_000,
        }
    }
}

fn validate_sweep(
    batch_size: usize,
    poll_interval_ms: u64,
    batch_field: &'static str,
    interval_field: &'static str,
) -> Result<(), ConfigError> {
    if batch_size == 0 {
        return Err(ConfigError::Zero(batch_field));
    }
    if poll_interval_ms == 0 {
        return Err(ConfigError::Zero(interval_field));
    }
    Ok(())
}

/// File form of a [`DistributionPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub retry_delays_ms: Vec<u64>,
    pub processing_timeout_ms: u64,
    pub retention_timeout_ms: u64,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> DistributionPolicy {
        DistributionPolicy::new(
            self.retry_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            Duration::from_millis(self.processing_timeout_ms),
            Duration::from_millis(self.retention_timeout_ms),
        )
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: vec![1_000, 5_000, 30_000, 120_000, 600_000],
            processing_timeout_ms: 60_000,
            retention_timeout_ms: 86_400_000,
        }
    }
}

/// Default policy plus per-group overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    pub default: PolicyConfig,
    pub groups: BTreeMap<String, PolicyConfig>,
}

impl PoliciesConfig {
    pub fn build_provider(&self) -> Result<StaticPolicyProvider, ConfigError> {
        let mut builder = StaticPolicyProvider::builder().default_policy(self.default.to_policy());
        for (group, policy) in &self.groups {
            builder = builder.register(group.clone(), policy.to_policy());
        }
        builder.build()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = std::iter::once(&self.default).chain(self.groups.values());
        for policy in all {
            if policy.processing_timeout_ms == 0 {
                return Err(ConfigError::Zero("policy.processing_timeout_ms"));
            }
        }
        Ok(())
    }
}

/// Everything the processing service needs besides its adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Number of distributor loops run in this process.
    pub distributors: usize,
    pub distributor: DistributorConfig,
    pub zombie: ZombieConfig,
    pub dead: DeadConfig,
    pub policies: PoliciesConfig,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.distributors == 0 {
            return Err(ConfigError::Zero("distributors"));
        }
        self.distributor.validate()?;
        validate_sweep(
            self.zombie.batch_size,
            self.zombie.poll_interval_ms,
            "zombie.batch_size",
            "zombie.poll_interval_ms",
        )?;
        validate_sweep(
            self.dead.batch_size,
            self.dead.poll_interval_ms,
            "dead.batch_size",
            "dead.poll_interval_ms",
        )?;
        self.policies.validate()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            distributors: 1,
            distributor: DistributorConfig::default(),
            zombie: ZombieConfig::default(),
            dead: DeadConfig::default(),
            policies: PoliciesConfig::default(),
        }
    }
}
