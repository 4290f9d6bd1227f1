//! Testing infrastructure for bootstrap and unseal tests.
//!
//! Deterministic, in-memory stand-ins for every external system, so the whole
//! protocol runs without Kubernetes or Vault and, with a paused tokio clock,
//! without real waiting.
//!
//! ## Key Components
//!
//! - [`SimulatedVaultCluster`]: Vault nodes with shared key material, call
//!   recording and fault injection
//! - [`InMemoryPodRegistry`]: scripted pod listings
//! - [`InMemorySecretStore`]: create-only record store with failure injection
//! - [`UnsealHarness`]: all of the above wired for a configured cluster
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let harness = UnsealHarness::new().await;
//! let report = harness.orchestrator()?.run(false).await?;
//!
//! assert!(!harness.vault.is_sealed(&harness.address("vault-2")));
//! assert!(harness.persisted_record().await.is_some());
//! ```

pub mod harness;
pub mod simulated_vault;

pub use harness::UnsealHarness;
pub use simulated_vault::SimulatedVaultCluster;
pub use simulated_vault::VaultCall;
pub use simulated_vault::VaultOp;

pub use crate::kubernetes::InMemoryPodRegistry;
pub use crate::kubernetes::InMemorySecretStore;
