//! In-memory Vault cluster speaking the [`VaultApi`] contract.
//!
//! Nodes are keyed by address. The cluster holds one key set, created by the
//! first `init` and shared with every node that joins through `raft_join`.
//! Every call is recorded in order so tests can assert on sequencing and on
//! the absence of mutating calls.
//!
//! # Fault injection
//!
//! - [`SimulatedVaultCluster::fail_joins`]: `raft_join` returns a transport error
//! - [`SimulatedVaultCluster::time_out_unseals`]: the next `n` unseal calls time out
//! - [`SimulatedVaultCluster::ignore_unseals`]: shares are accepted but progress never moves
//! - [`SimulatedVaultCluster::set_unreachable`]: every call fails with a transport error

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;

use crate::vault::HealthStatus;
use crate::vault::InitRequest;
use crate::vault::InitResponse;
use crate::vault::RaftJoinRequest;
use crate::vault::RaftJoinResponse;
use crate::vault::SealStatus;
use crate::vault::VaultApi;
use crate::vault::VaultApiError;
use crate::vault::VaultConnector;

/// A control-plane call as seen by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultOp {
    Health,
    Init,
    Unseal { share: String },
    SealStatus,
    RaftJoin { leader: String },
}

impl VaultOp {
    /// Whether the call changes cluster state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, VaultOp::Init | VaultOp::Unseal { .. } | VaultOp::RaftJoin { .. })
    }
}

/// A recorded call against `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultCall {
    pub address: String,
    pub op: VaultOp,
}

#[derive(Debug, Default)]
struct SimNode {
    initialized: bool,
    sealed: bool,
    progress: u32,
    submitted: HashSet<String>,
    unreachable: bool,
    fail_joins: bool,
    ignore_unseals: bool,
    unseal_timeouts: u32,
}

#[derive(Debug, Default)]
struct KeySet {
    keys: Vec<String>,
    threshold: u32,
    root_token: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: HashMap<String, SimNode>,
    key_set: Option<KeySet>,
    generation: u32,
    calls: Vec<VaultCall>,
}

impl ClusterState {
    fn generate_key_set(&mut self, shares: u8, threshold: u8) -> &KeySet {
        self.generation += 1;
        let generation = self.generation;
        self.key_set.insert(KeySet {
            keys: (1..=shares).map(|i| format!("sim-{generation}-share-{i}")).collect(),
            threshold: u32::from(threshold),
            root_token: format!("hvs.sim-{generation}-root"),
        })
    }

    fn seal_status(&self, node: &SimNode) -> SealStatus {
        let (threshold, shares) = match (&self.key_set, node.initialized) {
            (Some(key_set), true) => (key_set.threshold, u32::try_from(key_set.keys.len()).unwrap_or(u32::MAX)),
            _ => (0, 0),
        };
        SealStatus {
            sealed: node.sealed,
            threshold,
            shares,
            progress: node.progress,
        }
    }
}

/// Simulated Vault cluster. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct SimulatedVaultCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl SimulatedVaultCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a fresh (uninitialized, sealed) node.
    pub fn add_node(&self, address: &str) {
        self.lock().nodes.insert(address.to_string(), SimNode {
            sealed: true,
            ..SimNode::default()
        });
    }

    /// Initialize `address` out of band, as if another operator had run
    /// `vault operator init`. Returns the generated shares and root token.
    pub fn initialize_node(&self, address: &str, shares: u8, threshold: u8) -> InitResponse {
        let mut state = self.lock();
        let key_set = state.generate_key_set(shares, threshold);
        let response = InitResponse {
            keys: key_set.keys.clone(),
            root_token: key_set.root_token.clone(),
        };
        if let Some(node) = state.nodes.get_mut(address) {
            node.initialized = true;
            node.sealed = true;
            node.progress = 0;
        }
        response
    }

    /// Join `address` to the cluster out of band (still sealed).
    pub fn join_node(&self, address: &str) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            node.initialized = true;
            node.sealed = true;
        }
    }

    /// Unseal `address` out of band.
    pub fn unseal_node(&self, address: &str) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            node.sealed = false;
            node.progress = 0;
            node.submitted.clear();
        }
    }

    /// Seal `address`, as a pod restart would.
    pub fn seal_node(&self, address: &str) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            node.sealed = true;
            node.progress = 0;
            node.submitted.clear();
        }
    }

    pub fn fail_joins(&self, address: &str) {
        self.with_node(address, |node| node.fail_joins = true);
    }

    pub fn time_out_unseals(&self, address: &str, count: u32) {
        self.with_node(address, |node| node.unseal_timeouts = count);
    }

    pub fn ignore_unseals(&self, address: &str) {
        self.with_node(address, |node| node.ignore_unseals = true);
    }

    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.with_node(address, |node| node.unreachable = unreachable);
    }

    fn with_node(&self, address: &str, f: impl FnOnce(&mut SimNode)) {
        if let Some(node) = self.lock().nodes.get_mut(address) {
            f(node);
        }
    }

    pub fn is_initialized(&self, address: &str) -> bool {
        self.lock().nodes.get(address).is_some_and(|node| node.initialized)
    }

    pub fn is_sealed(&self, address: &str) -> bool {
        self.lock().nodes.get(address).is_none_or(|node| node.sealed)
    }

    /// The cluster's current shares, if it has been initialized.
    pub fn keys(&self) -> Option<Vec<String>> {
        self.lock().key_set.as_ref().map(|key_set| key_set.keys.clone())
    }

    pub fn root_token(&self) -> Option<String> {
        self.lock().key_set.as_ref().map(|key_set| key_set.root_token.clone())
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<VaultCall> {
        self.lock().calls.clone()
    }

    /// Calls made against `address`, in order.
    pub fn ops(&self, address: &str) -> Vec<VaultOp> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.address == address)
            .map(|call| call.op.clone())
            .collect()
    }

    /// Calls that changed cluster state.
    pub fn mutating_calls(&self) -> Vec<VaultCall> {
        self.lock().calls.iter().filter(|call| call.op.is_mutating()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// A client bound to `address`.
    pub fn client(&self, address: &str) -> Arc<dyn VaultApi> {
        Arc::new(SimulatedVaultClient {
            cluster: self.clone(),
            address: address.to_string(),
        })
    }

    fn call<T>(
        &self,
        address: &str,
        op: VaultOp,
        operation: &str,
        f: impl FnOnce(&mut ClusterState) -> Result<T, VaultApiError>,
    ) -> Result<T, VaultApiError> {
        let mut state = self.lock();
        state.calls.push(VaultCall {
            address: address.to_string(),
            op,
        });
        let reachable = state.nodes.get(address).is_some_and(|node| !node.unreachable);
        if !reachable {
            return Err(VaultApiError::transport(operation, format!("connection refused: {address}")));
        }
        f(&mut *state)
    }
}

impl VaultConnector for SimulatedVaultCluster {
    fn connect(&self, address: &str) -> Result<Arc<dyn VaultApi>, VaultApiError> {
        Ok(self.client(address))
    }
}

fn bad_request(operation: &str, message: &str) -> VaultApiError {
    VaultApiError::Status {
        operation: operation.to_string(),
        status: 400,
        errors: vec![message.to_string()],
    }
}

/// Client for one simulated node.
struct SimulatedVaultClient {
    cluster: SimulatedVaultCluster,
    address: String,
}

#[async_trait]
impl VaultApi for SimulatedVaultClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn health(&self) -> Result<HealthStatus, VaultApiError> {
        let address = self.address.as_str();
        self.cluster.call(address, VaultOp::Health, "health", |state| {
            let node = &state.nodes[address];
            Ok(HealthStatus {
                initialized: node.initialized,
                sealed: node.sealed,
                standby: false,
            })
        })
    }

    async fn init(&self, request: InitRequest) -> Result<InitResponse, VaultApiError> {
        let address = self.address.as_str();
        self.cluster.call(address, VaultOp::Init, "init", |state| {
            if state.nodes[address].initialized {
                return Err(bad_request("init", "Vault is already initialized"));
            }
            let key_set = state.generate_key_set(request.secret_shares, request.secret_threshold);
            let response = InitResponse {
                keys: key_set.keys.clone(),
                root_token: key_set.root_token.clone(),
            };
            if let Some(node) = state.nodes.get_mut(address) {
                node.initialized = true;
                node.sealed = true;
                node.progress = 0;
            }
            Ok(response)
        })
    }

    async fn unseal(&self, share: &str) -> Result<SealStatus, VaultApiError> {
        let address = self.address.as_str();
        let op = VaultOp::Unseal {
            share: share.to_string(),
        };
        self.cluster.call(address, op, "unseal", |state| {
            let (valid, threshold) = match &state.key_set {
                Some(key_set) => (key_set.keys.iter().any(|key| key == share), key_set.threshold),
                None => (false, 0),
            };
            let Some(node) = state.nodes.get_mut(address) else {
                return Err(VaultApiError::transport("unseal", "node vanished"));
            };
            if node.unseal_timeouts > 0 {
                node.unseal_timeouts -= 1;
                return Err(VaultApiError::timeout("unseal"));
            }
            if !node.initialized {
                return Err(bad_request("unseal", "Vault is not initialized"));
            }
            if node.sealed && !node.ignore_unseals {
                if !valid {
                    node.progress = 0;
                    node.submitted.clear();
                    return Err(bad_request("unseal", "invalid key"));
                }
                if node.submitted.insert(share.to_string()) {
                    node.progress += 1;
                }
                if node.progress >= threshold {
                    node.sealed = false;
                    node.progress = 0;
                    node.submitted.clear();
                }
            }
            let node = &state.nodes[address];
            Ok(state.seal_status(node))
        })
    }

    async fn seal_status(&self) -> Result<SealStatus, VaultApiError> {
        let address = self.address.as_str();
        self.cluster.call(address, VaultOp::SealStatus, "seal-status", |state| {
            let node = &state.nodes[address];
            Ok(state.seal_status(node))
        })
    }

    async fn raft_join(&self, request: RaftJoinRequest) -> Result<RaftJoinResponse, VaultApiError> {
        let address = self.address.as_str();
        let op = VaultOp::RaftJoin {
            leader: request.leader_api_addr.clone(),
        };
        self.cluster.call(address, op, "raft-join", |state| {
            let leader_ready = state
                .nodes
                .get(&request.leader_api_addr)
                .is_some_and(|leader| leader.initialized && !leader.unreachable);
            let Some(node) = state.nodes.get_mut(address) else {
                return Err(VaultApiError::transport("raft-join", "node vanished"));
            };
            if node.fail_joins {
                return Err(VaultApiError::transport("raft-join", "connection reset by peer"));
            }
            if node.initialized {
                return Err(bad_request("raft-join", "node is already initialized"));
            }
            if !leader_ready {
                return Ok(RaftJoinResponse { joined: false });
            }
            node.initialized = true;
            node.sealed = true;
            node.progress = 0;
            Ok(RaftJoinResponse { joined: true })
        })
    }
}
