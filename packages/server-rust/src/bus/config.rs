//! Broker cluster configuration (the `queue` settings section).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default acknowledgment timeout for producer sends.
pub const DEFAULT_PRODUCER_TIMEOUT_MS: u64 = 30_000;

/// Clusters keyed by name. The name is the scope segment of broker addresses.
pub type QueueConfig = BTreeMap<String, ClusterConfig>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub producers: Vec<ProducerProfile>,
    #[serde(default)]
    pub consumers: Vec<ConsumerProfile>,
}

/// A topic this service publishes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerProfile {
    pub topic: String,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_ms: u64,
}

impl ProducerProfile {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_PRODUCER_TIMEOUT_MS
}

/// A topic this service consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerProfile {
    pub topic: String,
    #[serde(default)]
    pub from_beginning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusConfigError {
    #[error("queue: at least one cluster must be configured")]
    NoClusters,
    #[error("queue: cluster `{0}` has no brokers")]
    NoBrokers(String),
    #[error("queue: cluster `{cluster}` has a {role} profile with an empty topic")]
    EmptyTopic { cluster: String, role: &'static str },
    #[error("queue: cluster name `{0}` may not be `*` or contain ':'")]
    InvalidClusterName(String),
}

/// Checks the rules serde defaults cannot express.
///
/// # Errors
///
/// Returns the first rule violated.
pub fn validate(config: &QueueConfig) -> Result<(), BusConfigError> {
    if config.is_empty() {
        return Err(BusConfigError::NoClusters);
    }
    for (name, cluster) in config {
        if name.is_empty() || name == meshkit_core::address::WILDCARD || name.contains(':') {
            return Err(BusConfigError::InvalidClusterName(name.clone()));
        }
        if cluster.brokers.is_empty() {
            return Err(BusConfigError::NoBrokers(name.clone()));
        }
        let empty_topic = |role| BusConfigError::EmptyTopic {
            cluster: name.clone(),
            role,
        };
        if cluster.producers.iter().any(|p| p.topic.is_empty()) {
            return Err(empty_topic("producer"));
        }
        if cluster.consumers.iter().any(|c| c.topic.is_empty()) {
            return Err(empty_topic("consumer"));
        }
    }
    Ok(())
}
