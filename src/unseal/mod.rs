//! Bootstrap and unseal protocol.
//!
//! - [`bootstrap`]: one-time leader initialization and record persistence
//! - [`distributor`]: threshold share submission for one node
//! - [`join`]: Raft join of followers
//! - [`reconcile`]: node classification and per-role planning
//! - [`orchestrator`]: the leader-then-followers sequence

pub mod bootstrap;
pub mod distributor;
pub mod join;
pub mod orchestrator;
pub mod reconcile;

pub use bootstrap::BootstrapError;
pub use bootstrap::Bootstrapper;
pub use distributor::ShardDistributor;
pub use distributor::UnsealError;
pub use distributor::UnsealProgress;
pub use join::JoinError;
pub use join::RaftJoinCoordinator;
pub use orchestrator::NodeOutcome;
pub use orchestrator::NodeReport;
pub use orchestrator::OrchestratorError;
pub use orchestrator::RunReport;
pub use orchestrator::StepError;
pub use orchestrator::UnsealOrchestrator;
pub use reconcile::FollowerAction;
pub use reconcile::LeaderAction;
pub use reconcile::NodeRole;
pub use reconcile::NodeState;
pub use reconcile::ReconcileError;
