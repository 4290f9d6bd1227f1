//! Cluster configuration.
//!
//! A single `ClusterConfiguration` value is built once (from CLI flags and
//! environment) and passed explicitly into every component constructor. There
//! is no process-wide configuration state.

pub mod error;
pub mod validation;

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub use error::ConfigError;
pub use validation::ValidationError;

use crate::constants::*;

/// Configuration shared by every bootstrap and unseal component.
///
/// `secret_shares` and `secret_threshold` are fixed for the lifetime of a
/// cluster. Changing them after initialization is unsupported: the persisted
/// record is validated against `secret_shares` on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// Number of key shares produced at initialization (`S`).
    pub secret_shares: u8,
    /// Number of shares required to unseal (`T`, `1 <= T <= S`).
    pub secret_threshold: u8,
    /// Namespace of the Vault pods and the initialization secret.
    pub namespace: String,
    /// Name of the Kubernetes secret holding the initialization record.
    pub secret_name: String,
    /// Raft leader node name.
    pub leader: String,
    /// Raft follower node names, processed strictly in this order.
    pub followers: Vec<String>,
    /// Label key used to select a node's pod by its name.
    pub pod_label_key: String,
    /// Scheme of the Vault API on each pod.
    pub vault_scheme: String,
    /// Port of the Vault API on each pod.
    pub vault_port: u16,
    /// Address followers join (`leader_api_addr`). Defaults to the leader's
    /// discovered address when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raft_leader_api_addr: Option<String>,
    /// Protocol timings.
    #[serde(default)]
    pub timings: UnsealTimings,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            secret_shares: DEFAULT_SECRET_SHARES,
            secret_threshold: DEFAULT_SECRET_THRESHOLD,
            namespace: DEFAULT_NAMESPACE.to_string(),
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            leader: DEFAULT_LEADER_NODE.to_string(),
            followers: DEFAULT_FOLLOWER_NODES.iter().map(|name| (*name).to_string()).collect(),
            pod_label_key: POD_NAME_LABEL.to_string(),
            vault_scheme: VAULT_API_SCHEME.to_string(),
            vault_port: VAULT_API_PORT,
            raft_leader_api_addr: None,
            timings: UnsealTimings::default(),
        }
    }
}

impl ClusterConfiguration {
    /// Builder: set the share count and threshold.
    pub fn with_shares(mut self, shares: u8, threshold: u8) -> Self {
        self.secret_shares = shares;
        self.secret_threshold = threshold;
        self
    }

    /// Builder: replace the follower list.
    pub fn with_followers<I, S>(mut self, followers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.followers = followers.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: replace the protocol timings.
    pub fn with_timings(mut self, timings: UnsealTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Validate every field, returning the first violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_shares(self.secret_shares, self.secret_threshold)?;
        validation::validate_non_empty("namespace", &self.namespace)?;
        validation::validate_non_empty("secret_name", &self.secret_name)?;
        validation::validate_non_empty("pod_label_key", &self.pod_label_key)?;
        validation::validate_non_empty("vault_scheme", &self.vault_scheme)?;
        validation::validate_topology(&self.leader, &self.followers)?;
        if let Some(addr) = &self.raft_leader_api_addr {
            validation::validate_leader_addr(addr)?;
        }
        self.timings.validate()
    }

    /// Label selector matching the pod of `node`.
    pub fn node_selector(&self, node: &str) -> String {
        format!("{}={}", self.pod_label_key, node)
    }

    /// Vault API base URL for a pod IP.
    pub fn vault_address(&self, pod_ip: &str) -> String {
        format!("{}://{}:{}", self.vault_scheme, pod_ip, self.vault_port)
    }

    /// Number of shares submitted to unseal a node.
    pub fn threshold(&self) -> usize {
        usize::from(self.secret_threshold)
    }
}

/// Fixed timings of the bootstrap and unseal protocol.
///
/// Defaults come from [`crate::constants`]; tests shrink or pause them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnsealTimings {
    pub discovery_poll_interval: Duration,
    pub discovery_timeout: Duration,
    pub share_submit_deadline: Duration,
    pub share_submit_max_attempts: u32,
    pub share_submit_initial_backoff: Duration,
    pub share_submit_max_backoff: Duration,
    pub seal_status_max_polls: u32,
    pub seal_status_poll_interval: Duration,
    pub init_settle_delay: Duration,
    pub join_settle_delay: Duration,
    pub record_persist_max_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for UnsealTimings {
    fn default() -> Self {
        Self {
            discovery_poll_interval: DISCOVERY_POLL_INTERVAL,
            discovery_timeout: DISCOVERY_TIMEOUT,
            share_submit_deadline: SHARE_SUBMIT_DEADLINE,
            share_submit_max_attempts: SHARE_SUBMIT_MAX_ATTEMPTS,
            share_submit_initial_backoff: SHARE_SUBMIT_INITIAL_BACKOFF,
            share_submit_max_backoff: SHARE_SUBMIT_MAX_BACKOFF,
            seal_status_max_polls: SEAL_STATUS_MAX_POLLS,
            seal_status_poll_interval: SEAL_STATUS_POLL_INTERVAL,
            init_settle_delay: INIT_SETTLE_DELAY,
            join_settle_delay: JOIN_SETTLE_DELAY,
            record_persist_max_attempts: RECORD_PERSIST_MAX_ATTEMPTS,
            request_timeout: VAULT_REQUEST_TIMEOUT,
        }
    }
}

impl UnsealTimings {
    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_duration("discovery_poll_interval", self.discovery_poll_interval)?;
        validation::validate_duration("discovery_timeout", self.discovery_timeout)?;
        validation::validate_duration("share_submit_deadline", self.share_submit_deadline)?;
        validation::validate_count("share_submit_max_attempts", self.share_submit_max_attempts)?;
        validation::validate_count("seal_status_max_polls", self.seal_status_max_polls)?;
        validation::validate_count("record_persist_max_attempts", self.record_persist_max_attempts)?;
        validation::validate_duration("request_timeout", self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = ClusterConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.secret_shares, 5);
        assert_eq!(config.secret_threshold, 3);
        assert_eq!(config.followers, vec!["vault-1".to_string(), "vault-2".to_string()]);
    }

    #[test]
    fn test_node_selector_and_address() {
        let config = ClusterConfiguration::default();
        assert_eq!(config.node_selector("vault-1"), "statefulset.kubernetes.io/pod-name=vault-1");
        assert_eq!(config.vault_address("10.0.0.7"), "http://10.0.0.7:8200");
    }

    #[test]
    fn test_validate_rejects_threshold_above_shares() {
        let config = ClusterConfiguration::default().with_shares(2, 3);
        assert_eq!(
            config.validate(),
            Err(ValidationError::ThresholdOutOfRange { shares: 2, threshold: 3 })
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let timings = UnsealTimings {
            share_submit_max_attempts: 0,
            ..UnsealTimings::default()
        };
        let config = ClusterConfiguration::default().with_timings(timings);
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroCount {
                field: "share_submit_max_attempts"
            })
        );
    }
}
