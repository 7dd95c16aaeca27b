// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::time::Duration;
use thiserror::Error;

/// Default bounded queue size of a standard subscription.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 24_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Retry shape of the replicated client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    /// Sleep after failed attempt `n` (1-based) is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(5),
            backoff_step: Duration::from_millis(2 * 500),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub queue_capacity: usize,
    /// A subscription nobody has listened to this long after attach closes.
    pub idle_timeout: Duration,
    /// A subscription that was never started closes after this long.
    pub start_deadline: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: SUBSCRIPTION_QUEUE_CAPACITY,
            idle_timeout: Duration::from_millis(100),
            // Worst case of a start proposal: attempts * attempt_timeout.
            start_deadline: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub shard_id: u64,
    pub replica_id: u64,
    pub bootstrap: bool,
    /// Metadata row key; one row per application namespace.
    pub namespace: String,
    pub retry: RetryPolicy,
    pub subscription: SubscriptionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            shard_id: 1,
            replica_id: 1,
            bootstrap: true,
            namespace: "default".to_string(),
            retry: RetryPolicy::default(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn for_replica(shard_id: u64, replica_id: u64) -> Self {
        Self {
            shard_id,
            replica_id,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `CONCORD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("CONCORD_SHARD_ID") {
            cfg.shard_id = parse("CONCORD_SHARD_ID", v)?;
        }
        if let Some(v) = lookup("CONCORD_REPLICA_ID") {
            cfg.replica_id = parse("CONCORD_REPLICA_ID", v)?;
        }
        if let Some(v) = lookup("CONCORD_BOOTSTRAP") {
            cfg.bootstrap = parse("CONCORD_BOOTSTRAP", v)?;
        }
        if let Some(v) = lookup("CONCORD_NAMESPACE") {
            if v.is_empty() {
                return Err(ConfigError::Invalid { key: "CONCORD_NAMESPACE", value: v });
            }
            cfg.namespace = v;
        }
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}
