//! Node discovery: logical member name to reachable Vault address.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::registry::PodRegistry;
use super::registry::RegistryError;
use crate::config::ClusterConfiguration;
use crate::retry::PollOutcome;
use crate::retry::PollPolicy;
use crate::retry::poll_until;

/// A cluster member resolved to a reachable pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Logical name, e.g. `vault-0`.
    pub name: String,
    /// Label selector matching the member's pod.
    pub selector: String,
    /// Control-plane base URL.
    pub address: String,
}

/// Errors resolving a node.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DiscoveryError {
    #[snafu(display("node {node} was not running in namespace {namespace} after {timeout:?}"))]
    Timeout {
        node: String,
        namespace: String,
        timeout: Duration,
    },

    #[snafu(display("failed to look up node {node}: {source}"))]
    Registry { node: String, source: RegistryError },
}

/// Resolves cluster members through a [`PodRegistry`].
#[derive(Clone)]
pub struct NodeDiscovery {
    registry: Arc<dyn PodRegistry>,
    config: Arc<ClusterConfiguration>,
}

impl NodeDiscovery {
    pub fn new(registry: Arc<dyn PodRegistry>, config: Arc<ClusterConfiguration>) -> Self {
        Self { registry, config }
    }

    /// Poll until `node` has a running pod with an IP, or `timeout` passes.
    ///
    /// A registry call still pending when `timeout` passes is abandoned.
    pub async fn resolve(&self, node: &str, timeout: Duration) -> Result<ClusterNode, DiscoveryError> {
        let selector = self.config.node_selector(node);
        let namespace = self.config.namespace.as_str();
        let selector = selector.as_str();
        let policy = PollPolicy::discovery(&self.config.timings, timeout);

        debug!(node, namespace, selector, "discovering node");

        let outcome = poll_until(&policy, |poll| async move {
            match self.registry.list_pods(namespace, selector).await {
                Ok(pods) => {
                    let ip = pods.iter().find_map(|pod| pod.reachable_ip().map(str::to_string));
                    if ip.is_none() {
                        debug!(node, poll, pods = pods.len(), "node not running yet");
                    }
                    Ok(ip)
                }
                Err(err) if err.is_retryable() => {
                    warn!(node, poll, error = %err, "pod lookup failed, retrying");
                    Ok(None)
                }
                Err(source) => Err(DiscoveryError::Registry {
                    node: node.to_string(),
                    source,
                }),
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready { value: ip, polls } => {
                let address = self.config.vault_address(&ip);
                info!(node, %address, polls, "discovered node");
                Ok(ClusterNode {
                    name: node.to_string(),
                    selector: selector.to_string(),
                    address,
                })
            }
            PollOutcome::Exhausted { .. } => Err(DiscoveryError::Timeout {
                node: node.to_string(),
                namespace: namespace.to_string(),
                timeout,
            }),
        }
    }

    /// [`resolve`](Self::resolve) with the configured discovery timeout.
    pub async fn resolve_default(&self, node: &str) -> Result<ClusterNode, DiscoveryError> {
        self.resolve(node, self.config.timings.discovery_timeout).await
    }
}
