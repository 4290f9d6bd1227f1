//! Unseal orchestrator: leader first, then each follower in order.
//!
//! # Sequence
//!
//! 1. Resolve the leader, classify it, and bootstrap or unseal it. When
//!    bootstrapping loses a race against another operator, the persisted
//!    record is read back and used instead.
//! 2. Unless leader-only, read the persisted record once and, for each
//!    follower in configured order, resolve it, classify it, join it to the
//!    leader if needed, and unseal it with the persisted shares.
//!
//! Any failure aborts the remaining sequence. The error carries the report of
//! the nodes completed so far and the name of the failing node; re-running is
//! the recovery path.

use std::sync::Arc;

use serde::Serialize;
use snafu::Snafu;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::bootstrap::BootstrapError;
use super::bootstrap::Bootstrapper;
use super::distributor::ShardDistributor;
use super::distributor::UnsealError;
use super::distributor::UnsealProgress;
use super::join::JoinError;
use super::join::RaftJoinCoordinator;
use super::reconcile::FollowerAction;
use super::reconcile::LeaderAction;
use super::reconcile::NodeRole;
use super::reconcile::NodeState;
use super::reconcile::ReconcileError;
use super::reconcile::plan_follower;
use super::reconcile::plan_leader;
use crate::config::ClusterConfiguration;
use crate::config::ValidationError;
use crate::kubernetes::DiscoveryError;
use crate::kubernetes::NodeDiscovery;
use crate::kubernetes::PodRegistry;
use crate::kubernetes::RecordStore;
use crate::kubernetes::SecretStore;
use crate::kubernetes::StateStoreError;
use crate::record::InitializationRecord;
use crate::record::KeyShare;
use crate::vault::VaultApi;
use crate::vault::VaultApiError;
use crate::vault::VaultConnector;

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Already initialized and unsealed; nothing was done.
    AlreadyUnsealed,
    /// Already initialized; `init` did nothing.
    AlreadyInitialized,
    /// Initialized and persisted, not unsealed.
    Initialized,
    /// Initialized, persisted, and unsealed with the fresh shares.
    Bootstrapped { unseal: UnsealProgress },
    /// Bootstrap lost a race; unsealed with the persisted record instead.
    Recovered { unseal: UnsealProgress },
    /// Unsealed with the persisted shares.
    Unsealed { unseal: UnsealProgress },
    /// Joined the leader, then unsealed if needed.
    Joined { unseal: Option<UnsealProgress> },
}

impl NodeOutcome {
    pub fn unseal_progress(&self) -> Option<&UnsealProgress> {
        match self {
            NodeOutcome::Bootstrapped { unseal } | NodeOutcome::Recovered { unseal } | NodeOutcome::Unsealed { unseal } => {
                Some(unseal)
            }
            NodeOutcome::Joined { unseal } => unseal.as_ref(),
            NodeOutcome::AlreadyUnsealed | NodeOutcome::AlreadyInitialized | NodeOutcome::Initialized => None,
        }
    }
}

/// Report for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub address: String,
    pub role: NodeRole,
    pub initial_state: NodeState,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
}

/// Nodes handled by a run, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|report| report.node == name)
    }
}

/// A single failed step.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StepError {
    #[snafu(display("node discovery failed"))]
    Discovery { source: DiscoveryError },

    #[snafu(display("cannot reach vault"))]
    Connect { source: VaultApiError },

    #[snafu(display("health check failed"))]
    Health { source: VaultApiError },

    #[snafu(display("node is in a state that cannot be acted on"))]
    Reconcile { source: ReconcileError },

    #[snafu(display("initialization record unavailable"))]
    Record { source: StateStoreError },

    #[snafu(display("bootstrap failed"))]
    Bootstrap { source: BootstrapError },

    #[snafu(display("raft join failed"))]
    Join { source: JoinError },

    #[snafu(display("unseal failed"))]
    Unseal { source: UnsealError },
}

/// A run that stopped at `node`.
#[derive(Debug, Snafu)]
#[snafu(display("unseal run stopped at node {node}"))]
pub struct OrchestratorError {
    /// Node whose step failed.
    pub node: String,
    /// Nodes completed before the failure.
    pub report: RunReport,
    pub source: StepError,
}

impl From<DiscoveryError> for StepError {
    fn from(source: DiscoveryError) -> Self {
        StepError::Discovery { source }
    }
}

impl From<ReconcileError> for StepError {
    fn from(source: ReconcileError) -> Self {
        StepError::Reconcile { source }
    }
}

impl From<BootstrapError> for StepError {
    fn from(source: BootstrapError) -> Self {
        StepError::Bootstrap { source }
    }
}

impl From<JoinError> for StepError {
    fn from(source: JoinError) -> Self {
        StepError::Join { source }
    }
}

impl From<UnsealError> for StepError {
    fn from(source: UnsealError) -> Self {
        StepError::Unseal { source }
    }
}

/// A discovered node with a connected client.
struct Target {
    address: String,
    client: Arc<dyn VaultApi>,
}

/// Drives a cluster from freshly deployed to initialized, joined, and unsealed.
pub struct UnsealOrchestrator {
    config: Arc<ClusterConfiguration>,
    discovery: NodeDiscovery,
    connector: Arc<dyn VaultConnector>,
    records: RecordStore,
    bootstrapper: Bootstrapper,
    distributor: ShardDistributor,
    joiner: RaftJoinCoordinator,
}

impl UnsealOrchestrator {
    /// Build an orchestrator; `config` is validated first.
    pub fn new(
        config: ClusterConfiguration,
        registry: Arc<dyn PodRegistry>,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn VaultConnector>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let config = Arc::new(config);
        let records = RecordStore::new(secrets, &config);
        Ok(Self {
            discovery: NodeDiscovery::new(registry, config.clone()),
            bootstrapper: Bootstrapper::new(records.clone(), config.clone()),
            distributor: ShardDistributor::new(&config),
            joiner: RaftJoinCoordinator::new(config.timings.join_settle_delay),
            records,
            connector,
            config,
        })
    }

    /// Bootstrap/unseal the leader and, unless `leader_only`, join and unseal
    /// every follower in order.
    pub async fn run(&self, leader_only: bool) -> Result<RunReport, OrchestratorError> {
        let mut report = RunReport::default();
        let leader = self.config.leader.as_str();

        let (leader_report, leader_address) = match self.reconcile_leader().await {
            Ok(done) => done,
            Err(source) => return Err(Self::abort(leader, report, source)),
        };
        report.nodes.push(leader_report);

        if leader_only {
            info!(leader, "leader-only run, skipping followers");
            return Ok(report);
        }
        if self.config.followers.is_empty() {
            return Ok(report);
        }

        let leader_api_addr = self.config.raft_leader_api_addr.clone().unwrap_or(leader_address);
        let record = match self.read_optional_record().await {
            Ok(record) => record,
            Err(source) => return Err(Self::abort(&self.config.followers[0], report, source)),
        };

        for follower in &self.config.followers {
            match self.reconcile_follower(follower, record.as_ref(), &leader_api_addr).await {
                Ok(node_report) => report.nodes.push(node_report),
                Err(source) => return Err(Self::abort(follower, report, source)),
            }
        }

        info!(nodes = report.nodes.len(), "all vault nodes unsealed");
        Ok(report)
    }

    /// Initialize the leader and persist its record without unsealing.
    /// Does nothing when the leader is already initialized.
    pub async fn init_leader(&self) -> Result<RunReport, OrchestratorError> {
        let leader = self.config.leader.as_str();
        match self.init_leader_inner().await {
            Ok(node_report) => Ok(RunReport {
                nodes: vec![node_report],
            }),
            Err(source) => Err(Self::abort(leader, RunReport::default(), source)),
        }
    }

    async fn init_leader_inner(&self) -> Result<NodeReport, StepError> {
        let leader = self.config.leader.as_str();
        let target = self.connect(leader).await?;
        let health = target.client.health().await.map_err(|source| StepError::Health { source })?;
        let record_present = self.record_present().await?;
        let state = NodeState::classify(&health, record_present);

        let outcome = match state {
            NodeState::InitializedSealed | NodeState::InitializedUnsealed => {
                info!(node = leader, "vault already initialized");
                NodeOutcome::AlreadyInitialized
            }
            NodeState::UninitializedWithRecordConflict => {
                return Err(ReconcileError::StaleRecord {
                    node: leader.to_string(),
                }
                .into());
            }
            NodeState::UninitializedNoRecord => match self.bootstrapper.initialize(leader, target.client.as_ref()).await {
                Ok(_) => NodeOutcome::Initialized,
                Err(err) if err.lost_race() => {
                    warn!(node = leader, error = %err, "leader was initialized concurrently");
                    NodeOutcome::AlreadyInitialized
                }
                Err(err) => return Err(err.into()),
            },
        };

        Ok(NodeReport {
            node: leader.to_string(),
            address: target.address,
            role: NodeRole::Leader,
            initial_state: state,
            outcome,
        })
    }

    async fn reconcile_leader(&self) -> Result<(NodeReport, String), StepError> {
        let leader = self.config.leader.as_str();
        let target = self.connect(leader).await?;
        let health = target.client.health().await.map_err(|source| StepError::Health { source })?;
        let record_present = self.record_present().await?;
        let state = NodeState::classify(&health, record_present);
        let action = plan_leader(leader, state)?;
        info!(node = leader, ?state, ?action, "reconciled leader");

        let client = target.client.as_ref();
        let outcome = match action {
            LeaderAction::Nothing => NodeOutcome::AlreadyUnsealed,
            LeaderAction::Bootstrap => match self.bootstrapper.initialize(leader, client).await {
                Ok(record) => NodeOutcome::Bootstrapped {
                    unseal: self.distributor.unseal(leader, client, record.shares()).await?,
                },
                Err(err) if err.lost_race() => {
                    warn!(node = leader, error = %err, "bootstrap lost a race, recovering from the persisted record");
                    let record = self.read_record(leader).await?;
                    NodeOutcome::Recovered {
                        unseal: self.distributor.unseal(leader, client, record.shares()).await?,
                    }
                }
                Err(err) => return Err(err.into()),
            },
            LeaderAction::Unseal => {
                let record = self.read_record(leader).await?;
                NodeOutcome::Unsealed {
                    unseal: self.distributor.unseal(leader, client, record.shares()).await?,
                }
            }
        };

        let address = target.address.clone();
        Ok((
            NodeReport {
                node: leader.to_string(),
                address: target.address,
                role: NodeRole::Leader,
                initial_state: state,
                outcome,
            },
            address,
        ))
    }

    async fn reconcile_follower(
        &self,
        follower: &str,
        record: Option<&InitializationRecord>,
        leader_api_addr: &str,
    ) -> Result<NodeReport, StepError> {
        let target = self.connect(follower).await?;
        let client = target.client.as_ref();
        let health = client.health().await.map_err(|source| StepError::Health { source })?;
        let state = NodeState::classify(&health, record.is_some());
        let action = plan_follower(follower, state)?;
        info!(node = follower, ?state, ?action, "reconciled follower");

        let outcome = match action {
            FollowerAction::Nothing => NodeOutcome::AlreadyUnsealed,
            FollowerAction::Unseal => NodeOutcome::Unsealed {
                unseal: self.distributor.unseal(follower, client, Self::shares_for(follower, record)?).await?,
            },
            FollowerAction::JoinAndUnseal => {
                self.joiner.join_follower(follower, client, leader_api_addr).await?;
                let health = client.health().await.map_err(|source| StepError::Health { source })?;
                let unseal = if health.sealed {
                    Some(self.distributor.unseal(follower, client, Self::shares_for(follower, record)?).await?)
                } else {
                    info!(node = follower, "follower unsealed after joining");
                    None
                };
                NodeOutcome::Joined { unseal }
            }
        };

        Ok(NodeReport {
            node: follower.to_string(),
            address: target.address,
            role: NodeRole::Follower,
            initial_state: state,
            outcome,
        })
    }

    async fn connect(&self, name: &str) -> Result<Target, StepError> {
        let address = self.discovery.resolve_default(name).await?.address;
        let client = self.connector.connect(&address).map_err(|source| StepError::Connect { source })?;
        Ok(Target { address, client })
    }

    async fn record_present(&self) -> Result<bool, StepError> {
        self.records.exists().await.map_err(|source| StepError::Record { source })
    }

    async fn read_record(&self, node: &str) -> Result<InitializationRecord, StepError> {
        match self.records.read().await {
            Ok(record) => Ok(record),
            Err(StateStoreError::RecordNotFound { .. }) => Err(StepError::Reconcile {
                source: ReconcileError::MissingRecord { node: node.to_string() },
            }),
            Err(source) => Err(StepError::Record { source }),
        }
    }

    async fn read_optional_record(&self) -> Result<Option<InitializationRecord>, StepError> {
        match self.records.read().await {
            Ok(record) => Ok(Some(record)),
            Err(StateStoreError::RecordNotFound { .. }) => Ok(None),
            Err(source) => Err(StepError::Record { source }),
        }
    }

    fn shares_for<'a>(node: &str, record: Option<&'a InitializationRecord>) -> Result<&'a [KeyShare], StepError> {
        record.map(InitializationRecord::shares).ok_or_else(|| StepError::Reconcile {
            source: ReconcileError::MissingRecord { node: node.to_string() },
        })
    }

    fn abort(node: &str, report: RunReport, source: StepError) -> OrchestratorError {
        error!(node, completed = report.nodes.len(), error = %source, "unseal run aborted");
        OrchestratorError {
            node: node.to_string(),
            report,
            source,
        }
    }
}
