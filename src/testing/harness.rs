//! Wiring for end-to-end orchestrator tests.

use std::sync::Arc;

use crate::config::ClusterConfiguration;
use crate::config::ValidationError;
use crate::kubernetes::InMemoryPodRegistry;
use crate::kubernetes::InMemorySecretStore;
use crate::kubernetes::PodSnapshot;
use crate::record::InitializationRecord;
use crate::testing::SimulatedVaultCluster;
use crate::unseal::UnsealOrchestrator;

/// First pod IP handed out; members get consecutive addresses in order.
const FIRST_POD_OCTET: u8 = 10;

/// A simulated cluster with every configured member running.
///
/// The leader gets `10.0.0.10`, followers `10.0.0.11`, `10.0.0.12`, ...
pub struct UnsealHarness {
    pub config: ClusterConfiguration,
    pub registry: Arc<InMemoryPodRegistry>,
    pub secrets: Arc<InMemorySecretStore>,
    pub vault: SimulatedVaultCluster,
}

impl UnsealHarness {
    /// Harness for the default three-member cluster.
    pub async fn new() -> Self {
        Self::with_config(ClusterConfiguration::default()).await
    }

    pub async fn with_config(config: ClusterConfiguration) -> Self {
        let harness = Self {
            config,
            registry: Arc::new(InMemoryPodRegistry::new()),
            secrets: Arc::new(InMemorySecretStore::new()),
            vault: SimulatedVaultCluster::new(),
        };
        for name in harness.members() {
            let ip = harness.pod_ip(&name);
            let selector = harness.config.node_selector(&name);
            harness
                .registry
                .set_pods(&harness.config.namespace, &selector, vec![PodSnapshot::running(name.as_str(), ip.as_str())])
                .await;
            harness.vault.add_node(&harness.config.vault_address(&ip));
        }
        harness
    }

    /// Leader then followers, in processing order.
    pub fn members(&self) -> Vec<String> {
        std::iter::once(self.config.leader.clone()).chain(self.config.followers.iter().cloned()).collect()
    }

    /// Pod IP of `node`. Unknown names get an address past the last member.
    pub fn pod_ip(&self, node: &str) -> String {
        let members = self.members();
        let position = members.iter().position(|member| member == node).unwrap_or(members.len());
        let octet = usize::from(FIRST_POD_OCTET).saturating_add(position);
        format!("10.0.0.{octet}")
    }

    /// Vault address of `node`.
    pub fn address(&self, node: &str) -> String {
        self.config.vault_address(&self.pod_ip(node))
    }

    pub fn orchestrator(&self) -> Result<UnsealOrchestrator, ValidationError> {
        UnsealOrchestrator::new(
            self.config.clone(),
            self.registry.clone(),
            self.secrets.clone(),
            Arc::new(self.vault.clone()),
        )
    }

    /// Decoded record currently persisted, if any.
    pub async fn persisted_record(&self) -> Option<InitializationRecord> {
        let data = self.secrets.snapshot(&self.config.secret_name, &self.config.namespace).await?;
        InitializationRecord::from_secret_data(&data, self.config.secret_shares).ok()
    }

    /// Initialize the leader out of band and persist its record, as a
    /// previous run would have.
    pub async fn preinitialize_leader(&self) -> InitializationRecord {
        let leader = self.config.leader.clone();
        let response = self
            .vault
            .initialize_node(&self.address(&leader), self.config.secret_shares, self.config.secret_threshold);
        let record = match InitializationRecord::from_init_response(response, self.config.secret_shares) {
            Ok(record) => record,
            Err(err) => panic!("simulated init produced an invalid record: {err}"),
        };
        self.secrets
            .insert(&self.config.secret_name, &self.config.namespace, record.to_secret_data())
            .await;
        record
    }
}
