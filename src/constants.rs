//! Fixed protocol constants for Vault bootstrap and unseal.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Every wait and retry loop in the crate is bounded by one of these values
//! (or by the `UnsealTimings` value built from them).

use std::time::Duration;

// ============================================================================
// Cluster topology
// ============================================================================

/// Raft leader pod name (ordinal 0 of the Vault StatefulSet).
pub const DEFAULT_LEADER_NODE: &str = "vault-0";

/// Raft follower pod names, in the order they are joined and unsealed.
pub const DEFAULT_FOLLOWER_NODES: [&str; 2] = ["vault-1", "vault-2"];

/// Namespace the Vault StatefulSet runs in.
pub const DEFAULT_NAMESPACE: &str = "vault";

/// Label the StatefulSet controller stamps on every pod with its own name.
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Port of the Vault HTTP API.
pub const VAULT_API_PORT: u16 = 8200;

/// Scheme used to reach pods directly by IP.
pub const VAULT_API_SCHEME: &str = "http";

// ============================================================================
// Key material
// ============================================================================

/// Default number of key shares produced by `sys/init`.
pub const DEFAULT_SECRET_SHARES: u8 = 5;

/// Default number of shares required to unseal.
pub const DEFAULT_SECRET_THRESHOLD: u8 = 3;

/// Upper bound Vault accepts for `secret_shares`.
pub const MAX_SECRET_SHARES: u8 = 255;

/// Kubernetes secret holding the initialization record.
pub const DEFAULT_SECRET_NAME: &str = "vault-unseal-secret";

/// Secret key holding the root token.
pub const ROOT_TOKEN_KEY: &str = "root-token";

/// Prefix of the secret keys holding unseal shares (`root-unseal-key-1`, ...).
pub const UNSEAL_KEY_PREFIX: &str = "root-unseal-key-";

// ============================================================================
// Timing
// ============================================================================

/// Interval between workload registry polls during discovery.
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long discovery waits for a pod to be running.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline covering every attempt to submit a single share.
pub const SHARE_SUBMIT_DEADLINE: Duration = Duration::from_secs(60);

/// Attempts allowed within `SHARE_SUBMIT_DEADLINE`.
pub const SHARE_SUBMIT_MAX_ATTEMPTS: u32 = 5;

/// Backoff before the first resubmission of a share.
pub const SHARE_SUBMIT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Cap on the backoff between share resubmissions.
pub const SHARE_SUBMIT_MAX_BACKOFF: Duration = Duration::from_secs(4);

/// Seal-status polls after each submitted share.
pub const SEAL_STATUS_MAX_POLLS: u32 = 10;

/// Interval between seal-status polls.
pub const SEAL_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(6);

/// Settle delay after a successful `sys/init`.
pub const INIT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Settle delay after a successful raft join.
pub const JOIN_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Attempts to persist a fresh initialization record before giving up.
pub const RECORD_PERSIST_MAX_ATTEMPTS: u32 = 3;

/// Timeout applied to every HTTP request against the Vault API.
pub const VAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
