//! Shard distributor: the unseal state machine for one node.
//!
//! A node moves `Sealed -> PartiallyUnsealed(progress) -> Unsealed` as key
//! shares are submitted. Shares go in persisted order, one at a time:
//!
//! 1. submit share `i` under a fresh deadline, retrying only timeouts
//! 2. poll seal status until the node is unsealed (stop, success) or its
//!    progress counter moves past the last observed value (accepted)
//! 3. if the poll window closes with no movement, remember share `i` as
//!    unconfirmed and carry on with the next share
//!
//! At most `threshold` shares are ever submitted. A node that is still sealed
//! after that is an error, and an explicitly ambiguous one when any share
//! went unconfirmed.


use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ClusterConfiguration;
use crate::config::UnsealTimings;
use crate::record::KeyShare;
use crate::retry::PollOutcome;
use crate::retry::PollPolicy;
use crate::retry::RetryError;
use crate::retry::RetryPolicy;
use crate::retry::poll_until;
use crate::retry::retry;
use crate::vault::SealStatus;
use crate::vault::VaultApi;
use crate::vault::VaultApiError;

/// Errors unsealing a node.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum UnsealError {
    #[snafu(display("failed to read seal status of {node}: {source}"))]
    SealStatus { node: String, source: VaultApiError },

    #[snafu(display("{node} needs {threshold} shares to unseal but only {available} are available"))]
    InsufficientShares {
        node: String,
        available: usize,
        threshold: usize,
    },

    #[snafu(display("submitting share {share} to {node} failed: {source}"))]
    Submission {
        node: String,
        share: usize,
        source: VaultApiError,
    },

    #[snafu(display("submitting share {share} to {node} timed out after {attempts} attempts"))]
    SubmissionTimeout { node: String, share: usize, attempts: u32 },

    #[snafu(display(
        "{node} is still sealed (progress {progress}/{threshold}); shares {unconfirmed:?} were never confirmed"
    ))]
    PartialUnsealAmbiguity {
        node: String,
        unconfirmed: Vec<usize>,
        progress: u32,
        threshold: u32,
    },

    #[snafu(display("{node} is still sealed after {submitted} shares (progress {progress}/{threshold})"))]
    StillSealed {
        node: String,
        submitted: usize,
        progress: u32,
        threshold: u32,
    },
}

/// What an unseal pass did to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnsealProgress {
    /// Shares submitted, counting from the first.
    pub shares_submitted: usize,
    /// 1-based indices of shares whose acceptance was never observed.
    pub unconfirmed_shares: Vec<usize>,
    /// The node was unsealed before any share was submitted.
    pub already_unsealed: bool,
}

/// What one poll window observed after a submission.
enum Observation {
    Unsealed,
    Accepted(u32),
}

/// Submits key shares to a node until it unseals.
#[derive(Debug, Clone)]
pub struct ShardDistributor {
    threshold: usize,
    timings: UnsealTimings,
}

impl ShardDistributor {
    pub fn new(config: &ClusterConfiguration) -> Self {
        Self {
            threshold: config.threshold(),
            timings: config.timings.clone(),
        }
    }

    /// Unseal `node` through `client` using `shares` in order.
    ///
    /// A sealed node given fewer than `threshold` shares fails with
    /// [`UnsealError::InsufficientShares`] before any share is submitted,
    /// even if the node's own progress would need fewer.
    pub async fn unseal(&self, node: &str, client: &dyn VaultApi, shares: &[KeyShare]) -> Result<UnsealProgress, UnsealError> {
        let initial = client.seal_status().await.context(SealStatusSnafu { node })?;
        if !initial.sealed {
            info!(node, "vault already unsealed");
            return Ok(UnsealProgress {
                already_unsealed: true,
                ..UnsealProgress::default()
            });
        }

        if shares.len() < self.threshold {
            return InsufficientSharesSnafu {
                node,
                available: shares.len(),
                threshold: self.threshold,
            }
            .fail();
        }

        let mut progress = UnsealProgress::default();
        let mut last = initial;

        for (position, share) in shares.iter().take(self.threshold).enumerate() {
            let index = position + 1;
            info!(node, share = index, progress = last.progress, threshold = last.threshold, "submitting unseal share");
            self.submit(node, client, index, share).await?;
            progress.shares_submitted = index;

            match self.observe(node, client, &last).await? {
                PollOutcome::Ready {
                    value: Observation::Unsealed,
                    ..
                } => {
                    info!(node, shares = index, "vault unsealed");
                    return Ok(progress);
                }
                PollOutcome::Ready {
                    value: Observation::Accepted(seen),
                    polls,
                } => {
                    debug!(node, share = index, progress = seen, polls, "share accepted");
                    last.progress = seen;
                }
                PollOutcome::Exhausted { polls, elapsed } => {
                    warn!(node, share = index, polls, ?elapsed, "share acceptance never observed");
                    progress.unconfirmed_shares.push(index);
                }
            }
        }

        if progress.unconfirmed_shares.is_empty() {
            StillSealedSnafu {
                node,
                submitted: progress.shares_submitted,
                progress: last.progress,
                threshold: last.threshold,
            }
            .fail()
        } else {
            PartialUnsealAmbiguitySnafu {
                node,
                unconfirmed: progress.unconfirmed_shares,
                progress: last.progress,
                threshold: last.threshold,
            }
            .fail()
        }
    }

    async fn submit(&self, node: &str, client: &dyn VaultApi, index: usize, share: &KeyShare) -> Result<(), UnsealError> {
        let policy = RetryPolicy::share_submission(&self.timings);
        let result = retry(&policy, "unseal", VaultApiError::is_timeout, |attempt| async move {
            if attempt > 1 {
                debug!(node, share = index, attempt, "retrying unseal share");
            }
            client.unseal(share.expose()).await
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(RetryError::Fatal { source, .. }) => Err(UnsealError::Submission {
                node: node.to_string(),
                share: index,
                source,
            }),
            Err(err) => Err(UnsealError::SubmissionTimeout {
                node: node.to_string(),
                share: index,
                attempts: err.attempts(),
            }),
        }
    }

    /// Poll seal status after a submission. A timed-out poll counts as no
    /// observation; any other failure aborts.
    async fn observe(&self, node: &str, client: &dyn VaultApi, last: &SealStatus) -> Result<PollOutcome<Observation>, UnsealError> {
        let policy = PollPolicy::seal_status(&self.timings);
        let last_progress = last.progress;
        poll_until(&policy, |poll| async move {
            let status = match client.seal_status().await {
                Ok(status) => status,
                Err(err) if err.is_timeout() => {
                    warn!(node, poll, error = %err, "seal status poll timed out");
                    return Ok(None);
                }
                Err(source) => {
                    return Err(UnsealError::SealStatus {
                        node: node.to_string(),
                        source,
                    });
                }
            };
            if !status.sealed {
                return Ok(Some(Observation::Unsealed));
            }
            if status.progress > last_progress {
                return Ok(Some(Observation::Accepted(status.progress)));
            }
            debug!(node, poll, progress = status.progress, "waiting for share to be accepted");
            Ok(None)
        })
        .await
    }
}
