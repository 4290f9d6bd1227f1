//! Bootstrap and unseal orchestration for Raft-backed Vault clusters on
//! Kubernetes.
//!
//! Takes a freshly deployed, sealed and uninitialized cluster to fully
//! initialized, joined, and unsealed, and is safe to re-run after a partial
//! failure.
//!
//! # Modules
//!
//! - [`config`]: cluster configuration, protocol timings, validation
//! - [`kubernetes`]: client construction, node discovery, secret state store
//! - [`vault`]: Vault control-plane client
//! - [`record`]: the persisted initialization record
//! - [`retry`]: bounded retry and polling
//! - [`unseal`]: bootstrapper, shard distributor, raft join, orchestrator
//! - [`testing`]: in-memory fakes for all external systems

pub mod config;
pub mod constants;
pub mod kubernetes;
pub mod record;
pub mod retry;
pub mod testing;
pub mod unseal;
pub mod vault;

pub use config::ClusterConfiguration;
pub use config::ConfigError;
pub use config::UnsealTimings;
pub use record::InitializationRecord;
pub use record::KeyShare;
pub use unseal::OrchestratorError;
pub use unseal::RunReport;
pub use unseal::UnsealOrchestrator;
