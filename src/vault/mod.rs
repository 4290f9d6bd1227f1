//! Vault control-plane client.
//!
//! - [`api`]: the [`VaultApi`] contract, payload types, and errors
//! - [`http`]: `reqwest` implementation used against real pods

pub mod api;
pub mod http;

pub use api::HealthStatus;
pub use api::InitRequest;
pub use api::InitResponse;
pub use api::RaftJoinRequest;
pub use api::RaftJoinResponse;
pub use api::SealStatus;
pub use api::VaultApi;
pub use api::VaultApiError;
pub use api::VaultConnector;
pub use http::HttpVaultClient;
pub use http::HttpVaultConnector;
