//! Read-only view of the workload registry (pods).

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::Client;
use kube::api::ListParams;
use thiserror::Error;
use tokio::sync::Mutex;

/// Phase reported by a pod whose containers have started.
pub const POD_PHASE_RUNNING: &str = "Running";

/// The parts of a pod discovery cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: String,
    pub phase: Option<String>,
    pub pod_ip: Option<String>,
}

impl PodSnapshot {
    /// A pod that is running and reachable by IP.
    pub fn running(name: impl Into<String>, pod_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: Some(POD_PHASE_RUNNING.to_string()),
            pod_ip: Some(pod_ip.into()),
        }
    }

    /// A pod that has been scheduled but not started.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: Some("Pending".to_string()),
            pod_ip: None,
        }
    }

    /// IP of the pod if it is running and has one assigned.
    pub fn reachable_ip(&self) -> Option<&str> {
        if self.phase.as_deref() != Some(POD_PHASE_RUNNING) {
            return None;
        }
        self.pod_ip.as_deref().filter(|ip| !ip.is_empty())
    }
}

impl From<Pod> for PodSnapshot {
    fn from(pod: Pod) -> Self {
        let status = pod.status.unwrap_or_default();
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            phase: status.phase,
            pod_ip: status.pod_ip,
        }
    }
}

/// Lists pods by label selector within a namespace.
#[async_trait]
pub trait PodRegistry: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSnapshot>, RegistryError>;
}

/// Errors listing pods.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The namespace or resource was not found.
    #[error("not found: {reason}")]
    NotFound {
        /// Text included in the API response.
        reason: String,
    },
    /// A failure that may clear up on its own (timeouts, throttling, 5xx, connection errors).
    #[error("transient registry failure: {reason}")]
    Transient {
        /// Description of the failure.
        reason: String,
    },
    /// Any other API failure (authorization, bad request, ...).
    #[error("registry API error (HTTP {code}): {reason}")]
    Api {
        /// HTTP status code, 0 when the failure happened client-side.
        code: u16,
        /// Description of the failure.
        reason: String,
    },
}

impl RegistryError {
    /// Whether discovery should keep polling after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Transient { .. })
    }
}

impl From<kube::Error> for RegistryError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => RegistryError::NotFound {
                    reason: response.message,
                },
                408 | 429 | 500..=599 => RegistryError::Transient {
                    reason: response.message,
                },
                code => RegistryError::Api {
                    code,
                    reason: response.message,
                },
            },
            kube::Error::HyperError(err) => RegistryError::Transient { reason: err.to_string() },
            kube::Error::Service(err) => RegistryError::Transient { reason: err.to_string() },
            other => RegistryError::Api {
                code: 0,
                reason: other.to_string(),
            },
        }
    }
}

/// [`PodRegistry`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodRegistry {
    client: Client,
}

impl KubePodRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodRegistry for KubePodRegistry {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSnapshot>, RegistryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items.into_iter().map(PodSnapshot::from).collect())
    }
}

/// In-memory pod registry for testing.
///
/// Each selector maps to a queue of scripted responses; the last response is
/// repeated once the queue is down to one entry. Unknown selectors list no pods.
#[derive(Default)]
pub struct InMemoryPodRegistry {
    responses: Mutex<HashMap<(String, String), VecDeque<Result<Vec<PodSnapshot>, RegistryError>>>>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryPodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `selector` in `namespace` list `pods` from now on.
    pub async fn set_pods(&self, namespace: &str, selector: &str, pods: Vec<PodSnapshot>) {
        let mut guard = self.responses.lock().await;
        let queue = guard.entry((namespace.to_string(), selector.to_string())).or_default();
        queue.clear();
        queue.push_back(Ok(pods));
    }

    /// Append a scripted response for `selector` in `namespace`.
    pub async fn push_response(&self, namespace: &str, selector: &str, response: Result<Vec<PodSnapshot>, RegistryError>) {
        self.responses
            .lock()
            .await
            .entry((namespace.to_string(), selector.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Selectors listed so far, in call order.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PodRegistry for InMemoryPodRegistry {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSnapshot>, RegistryError> {
        self.calls.lock().await.push(selector.to_string());

        let mut guard = self.responses.lock().await;
        let Some(queue) = guard.get_mut(&(namespace.to_string(), selector.to_string())) else {
            return Ok(Vec::new());
        };
        let response = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
        response.unwrap_or_else(|| Ok(Vec::new()))
    }
}
