//! Secret state store.
//!
//! [`SecretStore`] abstracts a flat, namespaced string-to-string record store
//! with create-only writes. [`KubeSecretStore`] backs it with Kubernetes
//! `Secret` objects; [`InMemorySecretStore`] is the deterministic test double.
//!
//! [`RecordStore`] sits on top and owns the durable
//! [`InitializationRecord`]: it is the single source of truth for "has this
//! cluster been initialized, and with what key shares".

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::Client;
use kube::api::ObjectMeta;
use kube::api::PostParams;
use snafu::Snafu;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::ClusterConfiguration;
use crate::record::InitializationRecord;
use crate::record::RecordError;

/// Durable, create-only record storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the record `name` in `namespace`.
    async fn get(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, String>, SecretStoreError>;

    /// Create the record `name` in `namespace`. Fails with
    /// [`SecretStoreError::AlreadyExists`] when it is already present.
    async fn put(&self, name: &str, namespace: &str, data: BTreeMap<String, String>) -> Result<(), SecretStoreError>;
}

/// Errors returned by a [`SecretStore`].
#[derive(Debug, Error)]
pub enum SecretStoreError {
    /// No record with that name exists.
    #[error("secret {namespace}/{name} not found")]
    NotFound {
        /// Record name.
        name: String,
        /// Record namespace.
        namespace: String,
    },
    /// A create-only write found an existing record.
    #[error("secret {namespace}/{name} already exists")]
    AlreadyExists {
        /// Record name.
        name: String,
        /// Record namespace.
        namespace: String,
    },
    /// A stored value is not valid UTF-8.
    #[error("secret {namespace}/{name} key '{key}' is not valid UTF-8")]
    InvalidUtf8 {
        /// Record name.
        name: String,
        /// Record namespace.
        namespace: String,
        /// Offending key.
        key: String,
    },
    /// Transport or API failure.
    #[error("secret store failure on {namespace}/{name}: {reason}")]
    Backend {
        /// Record name.
        name: String,
        /// Record namespace.
        namespace: String,
        /// Description of the failure.
        reason: String,
    },
}

impl SecretStoreError {
    /// Whether the failure is a transport/API problem rather than a definite answer.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

// ============================================================================
// Kubernetes implementation
// ============================================================================

/// [`SecretStore`] backed by Kubernetes secrets.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn map_error(name: &str, namespace: &str, err: kube::Error) -> SecretStoreError {
        match err {
            kube::Error::Api(response) if response.code == 404 => SecretStoreError::NotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(response) if response.code == 409 => SecretStoreError::AlreadyExists {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            other => SecretStoreError::Backend {
                name: name.to_string(),
                namespace: namespace.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, String>, SecretStoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|err| Self::map_error(name, namespace, err))?;

        let mut parsed = BTreeMap::new();
        for (key, ByteString(bytes)) in secret.data.unwrap_or_default() {
            let value = String::from_utf8(bytes).map_err(|_| SecretStoreError::InvalidUtf8 {
                name: name.to_string(),
                namespace: namespace.to_string(),
                key: key.clone(),
            })?;
            parsed.insert(key, value);
        }
        Ok(parsed)
    }

    async fn put(&self, name: &str, namespace: &str, data: BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data.into_iter().map(|(key, value)| (key, ByteString(value.into_bytes()))).collect()),
            ..Secret::default()
        };

        api.create(&PostParams::default(), &secret)
            .await
            .map_err(|err| Self::map_error(name, namespace, err))?;

        info!(name, namespace, "created secret");
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory secret store for testing.
///
/// Thread-safe and deterministic. Counts reads and writes so tests can assert
/// that a run performed no mutations.
#[derive(Default)]
pub struct InMemorySecretStore {
    data: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
    gets: AtomicU32,
    puts: AtomicU32,
    failing_puts: AtomicU32,
    unacknowledged_puts: AtomicU32,
}

impl InMemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing create-only checks.
    pub async fn insert(&self, name: &str, namespace: &str, data: BTreeMap<String, String>) {
        self.data.write().await.insert((namespace.to_string(), name.to_string()), data);
    }

    /// Snapshot of a stored record.
    pub async fn snapshot(&self, name: &str, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.data.read().await.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Make the next `count` writes fail with a backend error.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` successful writes store the record but report a
    /// backend error, as when a create lands and its response is lost.
    pub fn lose_next_put_acks(&self, count: u32) {
        self.unacknowledged_puts.store(count, Ordering::SeqCst);
    }

    /// Number of `get` calls so far.
    pub fn get_count(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `put` calls so far (successful or not).
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, String>, SecretStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.snapshot(name, namespace).await.ok_or_else(|| SecretStoreError::NotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
    }

    async fn put(&self, name: &str, namespace: &str, data: BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SecretStoreError::Backend {
                name: name.to_string(),
                namespace: namespace.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let mut guard = self.data.write().await;
        let key = (namespace.to_string(), name.to_string());
        if guard.contains_key(&key) {
            return Err(SecretStoreError::AlreadyExists {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        guard.insert(key, data);
        drop(guard);

        let unacknowledged = self
            .unacknowledged_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if unacknowledged {
            return Err(SecretStoreError::Backend {
                name: name.to_string(),
                namespace: namespace.to_string(),
                reason: "connection reset after write".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Initialization record store
// ============================================================================

/// Errors reading or writing the initialization record.
#[derive(Debug, Snafu)]
pub enum StateStoreError {
    #[snafu(display("initialization record {namespace}/{name} not found"))]
    RecordNotFound { name: String, namespace: String },

    #[snafu(display("initialization record {namespace}/{name} already exists"))]
    RecordAlreadyExists { name: String, namespace: String },

    #[snafu(display("initialization record {namespace}/{name} is corrupt: {source}"))]
    CorruptRecord {
        name: String,
        namespace: String,
        source: RecordError,
    },

    #[snafu(display("{source}"))]
    Store { source: SecretStoreError },
}

impl From<SecretStoreError> for StateStoreError {
    fn from(source: SecretStoreError) -> Self {
        match source {
            SecretStoreError::NotFound { name, namespace } => StateStoreError::RecordNotFound { name, namespace },
            SecretStoreError::AlreadyExists { name, namespace } => {
                StateStoreError::RecordAlreadyExists { name, namespace }
            }
            other => StateStoreError::Store { source: other },
        }
    }
}

impl StateStoreError {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { source } if source.is_backend())
    }
}

/// Reads and creates the cluster's [`InitializationRecord`].
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn SecretStore>,
    name: String,
    namespace: String,
    expected_shares: u8,
}

impl RecordStore {
    pub fn new(store: Arc<dyn SecretStore>, config: &ClusterConfiguration) -> Self {
        Self {
            store,
            name: config.secret_name.clone(),
            namespace: config.namespace.clone(),
            expected_shares: config.secret_shares,
        }
    }

    /// Whether a record exists. Does not decode it.
    pub async fn exists(&self) -> Result<bool, StateStoreError> {
        match self.store.get(&self.name, &self.namespace).await {
            Ok(_) => Ok(true),
            Err(SecretStoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Read and decode the persisted record.
    pub async fn read(&self) -> Result<InitializationRecord, StateStoreError> {
        let data = self.store.get(&self.name, &self.namespace).await?;
        InitializationRecord::from_secret_data(&data, self.expected_shares).map_err(|source| {
            StateStoreError::CorruptRecord {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                source,
            }
        })
    }

    /// Create the record. Fails with
    /// [`StateStoreError::RecordAlreadyExists`] if one is already persisted.
    pub async fn create(&self, record: &InitializationRecord) -> Result<(), StateStoreError> {
        info!(name = %self.name, namespace = %self.namespace, "creating secret containing vault initialization data");
        self.store.put(&self.name, &self.namespace, record.to_secret_data()).await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
