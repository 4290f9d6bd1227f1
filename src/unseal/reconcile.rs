//! Node reconciliation.
//!
//! Every node is classified into exactly one [`NodeState`] from its health
//! and the presence of a persisted record, then mapped to a single action
//! for its role ([`plan_leader`], [`plan_follower`]). Both steps are pure.

use serde::Serialize;
use snafu::Snafu;

use crate::vault::HealthStatus;

/// Where a node stands before anything is done to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Not initialized, and no record is persisted.
    UninitializedNoRecord,
    /// Not initialized, but a record is persisted.
    UninitializedWithRecordConflict,
    InitializedSealed,
    InitializedUnsealed,
}

impl NodeState {
    pub fn classify(health: &HealthStatus, record_present: bool) -> Self {
        match (health.initialized, health.sealed, record_present) {
            (false, _, false) => NodeState::UninitializedNoRecord,
            (false, _, true) => NodeState::UninitializedWithRecordConflict,
            (true, true, _) => NodeState::InitializedSealed,
            (true, false, _) => NodeState::InitializedUnsealed,
        }
    }
}

/// Role of a node in the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
}

/// What to do to the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderAction {
    /// Initialize, persist the record, unseal with the fresh shares.
    Bootstrap,
    /// Unseal with the persisted shares.
    Unseal,
    Nothing,
}

/// What to do to a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerAction {
    /// Join the leader's Raft cluster, then unseal if still sealed.
    JoinAndUnseal,
    /// Unseal with the persisted shares.
    Unseal,
    Nothing,
}

/// A node state that must not be acted on.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ReconcileError {
    #[snafu(display(
        "leader {node} is not initialized but an initialization record already exists; refusing to initialize over it"
    ))]
    StaleRecord { node: String },

    #[snafu(display("{node} needs the persisted initialization record but none exists"))]
    MissingRecord { node: String },
}

/// Decide what to do to the leader `node` in `state`. An uninitialized
/// leader is never initialized over an existing record.
pub fn plan_leader(node: &str, state: NodeState) -> Result<LeaderAction, ReconcileError> {
    match state {
        NodeState::UninitializedNoRecord => Ok(LeaderAction::Bootstrap),
        NodeState::UninitializedWithRecordConflict => StaleRecordSnafu { node }.fail(),
        NodeState::InitializedSealed => Ok(LeaderAction::Unseal),
        NodeState::InitializedUnsealed => Ok(LeaderAction::Nothing),
    }
}

/// Decide what to do to the follower `node` in `state`.
pub fn plan_follower(node: &str, state: NodeState) -> Result<FollowerAction, ReconcileError> {
    match state {
        NodeState::UninitializedWithRecordConflict => Ok(FollowerAction::JoinAndUnseal),
        NodeState::UninitializedNoRecord => MissingRecordSnafu { node }.fail(),
        NodeState::InitializedSealed => Ok(FollowerAction::Unseal),
        NodeState::InitializedUnsealed => Ok(FollowerAction::Nothing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(initialized: bool, sealed: bool) -> HealthStatus {
        HealthStatus {
            initialized,
            sealed,
            standby: false,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(NodeState::classify(&health(false, true), false), NodeState::UninitializedNoRecord);
        assert_eq!(
            NodeState::classify(&health(false, true), true),
            NodeState::UninitializedWithRecordConflict
        );
        assert_eq!(NodeState::classify(&health(true, true), true), NodeState::InitializedSealed);
        assert_eq!(NodeState::classify(&health(true, true), false), NodeState::InitializedSealed);
        assert_eq!(NodeState::classify(&health(true, false), false), NodeState::InitializedUnsealed);
    }

    #[test]
    fn test_leader_plan() {
        let leader = |state| plan_leader("vault-0", state);
        assert_eq!(leader(NodeState::UninitializedNoRecord), Ok(LeaderAction::Bootstrap));
        assert_eq!(
            leader(NodeState::UninitializedWithRecordConflict),
            Err(ReconcileError::StaleRecord {
                node: "vault-0".to_string()
            })
        );
        assert_eq!(leader(NodeState::InitializedSealed), Ok(LeaderAction::Unseal));
        assert_eq!(leader(NodeState::InitializedUnsealed), Ok(LeaderAction::Nothing));
    }

    #[test]
    fn test_follower_plan() {
        let follower = |state| plan_follower("vault-1", state);
        assert_eq!(follower(NodeState::UninitializedWithRecordConflict), Ok(FollowerAction::JoinAndUnseal));
        assert_eq!(
            follower(NodeState::UninitializedNoRecord),
            Err(ReconcileError::MissingRecord {
                node: "vault-1".to_string()
            })
        );
        assert_eq!(follower(NodeState::InitializedSealed), Ok(FollowerAction::Unseal));
        assert_eq!(follower(NodeState::InitializedUnsealed), Ok(FollowerAction::Nothing));
    }
}
