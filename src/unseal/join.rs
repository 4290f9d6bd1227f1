//! Raft join coordinator.

use std::time::Duration;

use snafu::Snafu;
use tracing::info;

use crate::vault::RaftJoinRequest;
use crate::vault::VaultApi;
use crate::vault::VaultApiError;

/// Errors joining a follower to the leader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JoinError {
    #[snafu(display("raft join of {node} to {leader} failed: {source}"))]
    Submission {
        node: String,
        leader: String,
        source: VaultApiError,
    },

    #[snafu(display("{node} did not join the raft cluster at {leader}"))]
    NotJoined { node: String, leader: String },
}

/// Joins uninitialized followers to the leader's Raft cluster.
#[derive(Debug, Clone)]
pub struct RaftJoinCoordinator {
    settle_delay: Duration,
}

impl RaftJoinCoordinator {
    pub fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }

    /// Issue a single join request for `node`, then wait for it to settle.
    ///
    /// Vault keeps retrying the join server-side (`retry = true`); there is no
    /// client-side retry loop.
    pub async fn join_follower(&self, node: &str, client: &dyn VaultApi, leader_api_addr: &str) -> Result<(), JoinError> {
        info!(node, leader = leader_api_addr, "joining raft cluster");
        let request = RaftJoinRequest {
            leader_api_addr: leader_api_addr.to_string(),
            retry: true,
        };

        let response = client.raft_join(request).await.map_err(|source| JoinError::Submission {
            node: node.to_string(),
            leader: leader_api_addr.to_string(),
            source,
        })?;
        if !response.joined {
            return NotJoinedSnafu {
                node,
                leader: leader_api_addr,
            }
            .fail();
        }

        info!(node, settle = ?self.settle_delay, "joined raft cluster");
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }
}
