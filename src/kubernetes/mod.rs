//! Kubernetes integration.
//!
//! - [`client`]: credential resolution and client construction
//! - [`registry`]: pod listing ([`PodRegistry`])
//! - [`discovery`]: resolving member names to Vault addresses
//! - [`secrets`]: the secret state store and the initialization record

pub mod client;
pub mod discovery;
pub mod registry;
pub mod secrets;

pub use client::CredentialSource;
pub use client::create_client;
pub use discovery::ClusterNode;
pub use discovery::DiscoveryError;
pub use discovery::NodeDiscovery;
pub use registry::InMemoryPodRegistry;
pub use registry::KubePodRegistry;
pub use registry::PodRegistry;
pub use registry::PodSnapshot;
pub use registry::RegistryError;
pub use secrets::InMemorySecretStore;
pub use secrets::KubeSecretStore;
pub use secrets::RecordStore;
pub use secrets::SecretStore;
pub use secrets::SecretStoreError;
pub use secrets::StateStoreError;
