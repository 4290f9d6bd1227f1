//! Vault control-plane contract.
//!
//! The bootstrap and unseal components only talk to Vault through
//! [`VaultApi`], one client per resolved node address. [`VaultConnector`]
//! produces those clients so the orchestrator can be driven by the HTTP
//! implementation in production and by the simulation in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Subset of `GET /v1/sys/health` used for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether `sys/init` has run (or the node joined a Raft cluster).
    pub initialized: bool,
    /// Whether the node is sealed.
    pub sealed: bool,
    /// Whether the node is a standby (follower) instance.
    #[serde(default)]
    pub standby: bool,
}

/// Response of `GET /v1/sys/seal-status` and `PUT /v1/sys/unseal`.
///
/// Transient: fetched on every poll, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the node is still sealed.
    pub sealed: bool,
    /// Shares required to unseal.
    #[serde(rename = "t")]
    pub threshold: u32,
    /// Total shares.
    #[serde(rename = "n")]
    pub shares: u32,
    /// Shares accepted in the current unseal attempt.
    pub progress: u32,
}

/// Request payload for `PUT /v1/sys/init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub secret_shares: u8,
    pub secret_threshold: u8,
}

/// Response of `PUT /v1/sys/init`. Carries raw key material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Hex-encoded unseal key shares.
    pub keys: Vec<String>,
    /// Initial root token.
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &format_args!("<{} redacted>", self.keys.len()))
            .field("root_token", &"<redacted>")
            .finish()
    }
}

/// Request payload for `POST /v1/sys/storage/raft/join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftJoinRequest {
    /// API address of the Raft leader, e.g. `http://10.0.0.5:8200`.
    pub leader_api_addr: String,
    /// Let Vault keep retrying the join in the background.
    pub retry: bool,
}

/// Response of `POST /v1/sys/storage/raft/join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftJoinResponse {
    pub joined: bool,
}

/// Typed client for one Vault node.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Base URL of the node this client talks to.
    fn address(&self) -> &str;

    /// Initialization and seal state.
    async fn health(&self) -> Result<HealthStatus, VaultApiError>;

    /// One-time initialization. Returns fresh key shares and root token.
    async fn init(&self, request: InitRequest) -> Result<InitResponse, VaultApiError>;

    /// Submit one unseal key share.
    async fn unseal(&self, share: &str) -> Result<SealStatus, VaultApiError>;

    /// Current seal status.
    async fn seal_status(&self) -> Result<SealStatus, VaultApiError>;

    /// Join this node to an existing Raft cluster.
    async fn raft_join(&self, request: RaftJoinRequest) -> Result<RaftJoinResponse, VaultApiError>;
}

/// Produces a [`VaultApi`] client for a resolved node address.
pub trait VaultConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn VaultApi>, VaultApiError>;
}

/// Errors returned by the Vault control plane.
#[derive(Debug, Error)]
pub enum VaultApiError {
    /// The request did not complete in time. Retryable.
    #[error("vault request timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },
    /// The node could not be reached.
    #[error("vault transport failure during {operation}: {reason}")]
    Transport {
        /// Operation that failed.
        operation: String,
        /// Description of the failure.
        reason: String,
    },
    /// Vault answered with a non-success status.
    #[error("vault returned HTTP {status} for {operation}: {}", .errors.join("; "))]
    Status {
        /// Operation that failed.
        operation: String,
        /// HTTP status code.
        status: u16,
        /// Messages from the `errors` field of the response body.
        errors: Vec<String>,
    },
    /// The response body could not be decoded.
    #[error("invalid vault response for {operation}: {reason}")]
    Decode {
        /// Operation whose response was malformed.
        operation: String,
        /// Decoder message.
        reason: String,
    },
    /// The node address could not be turned into a client.
    #[error("invalid vault address '{address}': {reason}")]
    InvalidAddress {
        /// Offending address.
        address: String,
        /// Parser message.
        reason: String,
    },
}

impl VaultApiError {
    pub(crate) fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub(crate) fn transport<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::Decode {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure was a timeout (the only retryable submission error).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether Vault rejected `sys/init` because it already ran.
    pub fn is_already_initialized(&self) -> bool {
        match self {
            Self::Status { status, errors, .. } => {
                *status == 400 && errors.iter().any(|message| message.contains("already initialized"))
            }
            _ => false,
        }
    }
}
