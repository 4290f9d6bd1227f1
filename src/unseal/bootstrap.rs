//! Cluster bootstrapper: one-time initialization of the leader.
//!
//! The init response is the only copy of the key material until it has been
//! persisted, so persistence happens before anything else touches it and is
//! retried on transport failures. Vault itself is never re-initialized.

use std::sync::Arc;

use snafu::Snafu;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::ClusterConfiguration;
use crate::kubernetes::RecordStore;
use crate::kubernetes::StateStoreError;
use crate::record::InitializationRecord;
use crate::record::RecordError;
use crate::retry::RetryError;
use crate::retry::RetryPolicy;
use crate::retry::retry;
use crate::vault::InitRequest;
use crate::vault::VaultApi;
use crate::vault::VaultApiError;

/// Errors initializing the leader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BootstrapError {
    #[snafu(display("vault init on {node} failed: {source}"))]
    Init { node: String, source: VaultApiError },

    #[snafu(display("{node} was initialized by someone else"))]
    AlreadyInitialized { node: String },

    #[snafu(display("vault init on {node} returned an unusable response: {source}"))]
    InvalidInitResponse { node: String, source: RecordError },

    #[snafu(display("initialization record {namespace}/{name} already exists"))]
    AlreadyInitializedConflict { name: String, namespace: String },

    #[snafu(display(
        "vault on {node} was initialized but its key material could not be persisted after {attempts} attempts: {reason}"
    ))]
    KeyMaterialNotPersisted { node: String, attempts: u32, reason: String },
}

impl BootstrapError {
    /// Another operator initialized the cluster first; the persisted record
    /// is authoritative.
    pub fn lost_race(&self) -> bool {
        matches!(self, Self::AlreadyInitialized { .. } | Self::AlreadyInitializedConflict { .. })
    }
}

/// Initializes an uninitialized leader and persists its key material.
#[derive(Clone)]
pub struct Bootstrapper {
    records: RecordStore,
    config: Arc<ClusterConfiguration>,
}

impl Bootstrapper {
    pub fn new(records: RecordStore, config: Arc<ClusterConfiguration>) -> Self {
        Self { records, config }
    }

    /// Initialize `node` and persist the resulting record.
    ///
    /// The caller must have observed `node` as not initialized.
    pub async fn initialize(&self, node: &str, client: &dyn VaultApi) -> Result<InitializationRecord, BootstrapError> {
        let request = InitRequest {
            secret_shares: self.config.secret_shares,
            secret_threshold: self.config.secret_threshold,
        };
        info!(
            node,
            shares = request.secret_shares,
            threshold = request.secret_threshold,
            "initializing vault"
        );

        let response = match client.init(request).await {
            Ok(response) => response,
            Err(err) if err.is_already_initialized() => {
                warn!(node, "vault reports it is already initialized");
                return AlreadyInitializedSnafu { node }.fail();
            }
            Err(source) => {
                return Err(BootstrapError::Init {
                    node: node.to_string(),
                    source,
                });
            }
        };

        let record = InitializationRecord::from_init_response(response, self.config.secret_shares).map_err(|source| {
            error!(node, error = %source, "vault init response is unusable");
            BootstrapError::InvalidInitResponse {
                node: node.to_string(),
                source,
            }
        })?;

        self.persist(node, &record).await?;
        info!(node, secret = %self.records.name(), "persisted initialization record");

        tokio::time::sleep(self.config.timings.init_settle_delay).await;
        Ok(record)
    }

    async fn persist(&self, node: &str, record: &InitializationRecord) -> Result<(), BootstrapError> {
        let policy = RetryPolicy::record_persist(&self.config.timings);
        let result = retry(&policy, "persist-record", StateStoreError::is_transient, |attempt| async move {
            if attempt > 1 {
                warn!(node, attempt, "retrying persistence of initialization record");
            }
            self.records.create(record).await
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal {
                source: StateStoreError::RecordAlreadyExists { name, namespace },
                ..
            }) => {
                warn!(node, %name, %namespace, "initialization record already exists");
                Err(BootstrapError::AlreadyInitializedConflict { name, namespace })
            }
            Err(err) => {
                let attempts = err.attempts();
                let reason = match err {
                    RetryError::Fatal { source, .. } => source.to_string(),
                    RetryError::Exhausted {
                        last_error: Some(source),
                        ..
                    }
                    | RetryError::DeadlineExceeded {
                        last_error: Some(source),
                        ..
                    } => source.to_string(),
                    RetryError::Exhausted { last_error: None, .. } | RetryError::DeadlineExceeded { last_error: None, .. } => {
                        "secret store did not respond".to_string()
                    }
                };
                error!(node, attempts, %reason, "CRITICAL: vault is initialized but its key material was not persisted");
                Err(BootstrapError::KeyMaterialNotPersisted {
                    node: node.to_string(),
                    attempts,
                    reason,
                })
            }
        }
    }
}
