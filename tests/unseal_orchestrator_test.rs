//! End-to-end tests for the bootstrap and unseal sequence.
//!
//! Runs the orchestrator against the in-memory registry, secret store, and
//! simulated Vault cluster. The tokio clock is paused so settle delays and
//! poll intervals complete instantly.

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use vault_handler::ClusterConfiguration;
use vault_handler::UnsealOrchestrator;
use vault_handler::kubernetes::InMemorySecretStore;
use vault_handler::kubernetes::PodSnapshot;
use vault_handler::kubernetes::RegistryError;
use vault_handler::kubernetes::SecretStore;
use vault_handler::kubernetes::SecretStoreError;
use vault_handler::record::InitializationRecord;
use vault_handler::testing::SimulatedVaultCluster;
use vault_handler::testing::UnsealHarness;
use vault_handler::testing::VaultOp;
use vault_handler::unseal::BootstrapError;
use vault_handler::unseal::JoinError;
use vault_handler::unseal::NodeOutcome;
use vault_handler::unseal::NodeState;
use vault_handler::unseal::ReconcileError;
use vault_handler::unseal::StepError;
use vault_handler::unseal::UnsealError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}

fn unseal_shares(ops: &[VaultOp]) -> Vec<String> {
    ops.iter()
        .filter_map(|op| match op {
            VaultOp::Unseal { share } => Some(share.clone()),
            _ => None,
        })
        .collect()
}

fn init_count(ops: &[VaultOp]) -> usize {
    ops.iter().filter(|op| **op == VaultOp::Init).count()
}

/// Secret store that lets another operator win the bootstrap race: right
/// after the first read reports no record, the leader is initialized out of
/// band and that operator's record is stored.
struct RacingSecretStore {
    inner: Arc<InMemorySecretStore>,
    vault: SimulatedVaultCluster,
    leader_address: String,
    config: ClusterConfiguration,
    raced: AtomicBool,
}

impl RacingSecretStore {
    fn new(harness: &UnsealHarness) -> Self {
        Self {
            inner: harness.secrets.clone(),
            vault: harness.vault.clone(),
            leader_address: harness.address(&harness.config.leader),
            config: harness.config.clone(),
            raced: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SecretStore for RacingSecretStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<BTreeMap<String, String>, SecretStoreError> {
        let result = self.inner.get(name, namespace).await;
        if !self.raced.swap(true, Ordering::SeqCst) {
            let response =
                self.vault
                    .initialize_node(&self.leader_address, self.config.secret_shares, self.config.secret_threshold);
            let record = InitializationRecord::from_init_response(response, self.config.secret_shares).unwrap();
            self.inner.insert(name, namespace, record.to_secret_data()).await;
        }
        result
    }

    async fn put(&self, name: &str, namespace: &str, data: BTreeMap<String, String>) -> Result<(), SecretStoreError> {
        self.inner.put(name, namespace, data).await
    }
}

fn racing_orchestrator(harness: &UnsealHarness) -> UnsealOrchestrator {
    UnsealOrchestrator::new(
        harness.config.clone(),
        harness.registry.clone(),
        Arc::new(RacingSecretStore::new(harness)),
        Arc::new(harness.vault.clone()),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_fresh_cluster_is_bootstrapped_joined_and_unsealed() {
    init_tracing();
    let harness = UnsealHarness::new().await;

    let report = harness.orchestrator().unwrap().run(false).await.unwrap();

    assert_eq!(report.nodes.len(), 3);
    for name in ["vault-0", "vault-1", "vault-2"] {
        let address = harness.address(name);
        assert!(harness.vault.is_initialized(&address), "{name} not initialized");
        assert!(!harness.vault.is_sealed(&address), "{name} still sealed");
    }

    let leader = report.node("vault-0").unwrap();
    assert_eq!(leader.initial_state, NodeState::UninitializedNoRecord);
    assert!(matches!(leader.outcome, NodeOutcome::Bootstrapped { .. }));
    for follower in ["vault-1", "vault-2"] {
        let node = report.node(follower).unwrap();
        assert_eq!(node.initial_state, NodeState::UninitializedWithRecordConflict);
        assert!(matches!(node.outcome, NodeOutcome::Joined { unseal: Some(_) }));
    }

    // S=5: five shares and a root token, persisted exactly as Vault returned them.
    let record = harness.persisted_record().await.unwrap();
    assert_eq!(record.shares().len(), 5);
    assert!(!record.root_token().is_empty());
    assert_eq!(Some(record.root_token().to_string()), harness.vault.root_token());
    let persisted: Vec<String> = record.shares().iter().map(|share| share.expose().to_string()).collect();
    assert_eq!(Some(persisted.clone()), harness.vault.keys());

    // T=3: exactly the first three shares, in order, on every node.
    for name in ["vault-0", "vault-1", "vault-2"] {
        assert_eq!(unseal_shares(&harness.vault.ops(&harness.address(name))), persisted[..3].to_vec());
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_run_performs_no_mutating_calls() {
    let harness = UnsealHarness::new().await;
    harness.orchestrator().unwrap().run(false).await.unwrap();
    harness.vault.clear_calls();
    let puts_after_first_run = harness.secrets.put_count();

    let report = harness.orchestrator().unwrap().run(false).await.unwrap();

    assert!(harness.vault.mutating_calls().is_empty());
    assert_eq!(harness.secrets.put_count(), puts_after_first_run);
    assert!(report.nodes.iter().all(|node| node.outcome == NodeOutcome::AlreadyUnsealed));
}

#[tokio::test(start_paused = true)]
async fn test_followers_are_processed_strictly_in_order() {
    let harness = UnsealHarness::new().await;
    harness.orchestrator().unwrap().run(false).await.unwrap();

    let vault_1 = harness.address("vault-1");
    let vault_2 = harness.address("vault-2");
    let calls = harness.vault.calls();
    let last_vault_1 = calls.iter().rposition(|call| call.address == vault_1).unwrap();
    let first_vault_2 = calls.iter().position(|call| call.address == vault_2).unwrap();
    assert!(last_vault_1 < first_vault_2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_join_stops_before_next_follower() {
    let harness = UnsealHarness::new().await;
    harness.vault.fail_joins(&harness.address("vault-1"));

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-1");
    assert!(matches!(err.source, StepError::Join {
        source: JoinError::Submission { .. }
    }));
    // Each link in the chain says something new; the node is named once at the top.
    assert_eq!(err.to_string(), "unseal run stopped at node vault-1");
    assert_eq!(err.source.to_string(), "raft join failed");
    let detail = err.source.source().map(ToString::to_string).unwrap();
    assert!(detail.contains("vault-1"), "{detail}");
    // The leader finished before the failure and is reported.
    assert_eq!(err.report.nodes.len(), 1);
    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));

    assert!(harness.vault.ops(&harness.address("vault-2")).is_empty());
    assert!(!harness.vault.is_initialized(&harness.address("vault-2")));
}

#[tokio::test(start_paused = true)]
async fn test_leader_only_suppresses_follower_calls() {
    let harness = UnsealHarness::new().await;

    let report = harness.orchestrator().unwrap().run(true).await.unwrap();

    assert_eq!(report.nodes.len(), 1);
    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));
    for follower in ["vault-1", "vault-2"] {
        assert!(harness.vault.ops(&harness.address(follower)).is_empty());
    }
    let selectors = harness.registry.calls().await;
    assert!(selectors.iter().all(|selector| selector.ends_with("=vault-0")));
}

#[tokio::test(start_paused = true)]
async fn test_sealed_leader_recovers_from_persisted_record() {
    let harness = UnsealHarness::new().await;
    let record = harness.preinitialize_leader().await;
    harness.vault.clear_calls();

    let report = harness.orchestrator().unwrap().run(true).await.unwrap();

    let leader = report.node("vault-0").unwrap();
    assert_eq!(leader.initial_state, NodeState::InitializedSealed);
    assert!(matches!(leader.outcome, NodeOutcome::Unsealed { .. }));

    let ops = harness.vault.ops(&harness.address("vault-0"));
    assert!(!ops.contains(&VaultOp::Init));
    let expected: Vec<String> = record.shares()[..3].iter().map(|share| share.expose().to_string()).collect();
    assert_eq!(unseal_shares(&ops), expected);
    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));
}

#[tokio::test(start_paused = true)]
async fn test_restarted_follower_is_unsealed_without_rejoining() {
    let harness = UnsealHarness::new().await;
    harness.orchestrator().unwrap().run(false).await.unwrap();
    let vault_2 = harness.address("vault-2");
    harness.vault.seal_node(&vault_2);
    harness.vault.clear_calls();

    let report = harness.orchestrator().unwrap().run(false).await.unwrap();

    let node = report.node("vault-2").unwrap();
    assert_eq!(node.initial_state, NodeState::InitializedSealed);
    assert!(matches!(node.outcome, NodeOutcome::Unsealed { .. }));
    assert!(!harness.vault.ops(&vault_2).iter().any(|op| matches!(op, VaultOp::RaftJoin { .. })));
    assert!(!harness.vault.is_sealed(&vault_2));
}

#[tokio::test(start_paused = true)]
async fn test_stale_record_blocks_leader_initialization() {
    let harness = UnsealHarness::new().await;
    let stale = harness.preinitialize_leader().await;
    // The leader's storage was wiped but the record survived.
    harness.vault.add_node(&harness.address("vault-0"));
    harness.vault.clear_calls();

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-0");
    assert!(matches!(err.source, StepError::Reconcile {
        source: ReconcileError::StaleRecord { .. }
    }));
    assert!(harness.vault.mutating_calls().is_empty());
    assert_eq!(harness.persisted_record().await, Some(stale));
}

#[tokio::test(start_paused = true)]
async fn test_follower_without_record_is_rejected() {
    let harness = UnsealHarness::new().await;
    let leader = harness.address("vault-0");
    harness.vault.initialize_node(&leader, 5, 3);
    harness.vault.unseal_node(&leader);

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-1");
    assert!(matches!(err.source, StepError::Reconcile {
        source: ReconcileError::MissingRecord { .. }
    }));
    assert!(!harness.vault.is_initialized(&harness.address("vault-1")));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_shares_surface_as_ambiguity() {
    let harness = UnsealHarness::new().await;
    harness.vault.ignore_unseals(&harness.address("vault-1"));

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-1");
    match err.source {
        StepError::Unseal {
            source: UnsealError::PartialUnsealAmbiguity { unconfirmed, .. },
        } => assert_eq!(unconfirmed, vec![1, 2, 3]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.vault.ops(&harness.address("vault-2")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unseal_timeouts_are_retried() {
    let harness = UnsealHarness::new().await;
    harness.vault.time_out_unseals(&harness.address("vault-0"), 2);

    harness.orchestrator().unwrap().run(true).await.unwrap();

    let shares = unseal_shares(&harness.vault.ops(&harness.address("vault-0")));
    // Share 1 was sent three times, then shares 2 and 3 once each.
    assert_eq!(shares.len(), 5);
    assert_eq!(shares[0], shares[2]);
    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout_aborts_run() {
    let harness = UnsealHarness::new().await;
    let selector = harness.config.node_selector("vault-0");
    harness.registry.set_pods("vault", &selector, vec![PodSnapshot::pending("vault-0")]).await;

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-0");
    assert!(matches!(err.source, StepError::Discovery { .. }));
    assert!(err.report.nodes.is_empty());
    assert!(harness.vault.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_discovery_tolerates_transient_registry_errors() {
    let harness = UnsealHarness::new().await;
    let selector = harness.config.node_selector("vault-0");
    let ip = harness.pod_ip("vault-0");
    harness.registry.set_pods("vault", &selector, vec![]).await;
    harness
        .registry
        .push_response(
            "vault",
            &selector,
            Err(RegistryError::Transient {
                reason: "too many requests".to_string(),
            }),
        )
        .await;
    harness.registry.push_response("vault", &selector, Ok(vec![PodSnapshot::running("vault-0", ip)])).await;

    harness.orchestrator().unwrap().run(true).await.unwrap();

    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));
}

#[tokio::test(start_paused = true)]
async fn test_init_command_persists_without_unsealing() {
    let harness = UnsealHarness::new().await;
    let orchestrator = harness.orchestrator().unwrap();

    let report = orchestrator.init_leader().await.unwrap();
    assert_eq!(report.nodes[0].outcome, NodeOutcome::Initialized);
    let leader = harness.address("vault-0");
    assert!(harness.vault.is_initialized(&leader));
    assert!(harness.vault.is_sealed(&leader));
    assert!(harness.persisted_record().await.is_some());

    // Already initialized: nothing to do.
    harness.vault.clear_calls();
    let report = orchestrator.init_leader().await.unwrap();
    assert_eq!(report.nodes[0].outcome, NodeOutcome::AlreadyInitialized);
    assert!(harness.vault.mutating_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_persist_is_reported_as_unpersisted_key_material() {
    let harness = UnsealHarness::new().await;
    harness.secrets.fail_next_puts(3);

    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-0");
    assert!(matches!(err.source, StepError::Bootstrap {
        source: BootstrapError::KeyMaterialNotPersisted { .. }
    }));
    // Vault was initialized once and never again; no share was submitted.
    let ops = harness.vault.ops(&harness.address("vault-0"));
    assert_eq!(ops.iter().filter(|op| **op == VaultOp::Init).count(), 1);
    assert!(unseal_shares(&ops).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_raft_leader_api_addr_override_is_used_for_joins() {
    let mut config = ClusterConfiguration::default();
    config.raft_leader_api_addr = Some("http://vault-active.vault.svc:8200".to_string());
    let harness = UnsealHarness::with_config(config).await;

    // The simulation does not know the service address, so the join is refused.
    let err = harness.orchestrator().unwrap().run(false).await.unwrap_err();

    assert_eq!(err.node, "vault-1");
    assert!(matches!(err.source, StepError::Join {
        source: JoinError::NotJoined { .. }
    }));
    assert_eq!(harness.vault.ops(&harness.address("vault-1")).last(), Some(&VaultOp::RaftJoin {
        leader: "http://vault-active.vault.svc:8200".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_configuration_is_rejected() {
    let config = ClusterConfiguration::default().with_shares(3, 5);
    let harness = UnsealHarness::with_config(config).await;
    assert!(harness.orchestrator().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_recovers_when_record_write_lands_without_ack() {
    init_tracing();
    let harness = UnsealHarness::new().await;
    harness.secrets.lose_next_put_acks(1);

    let report = harness.orchestrator().unwrap().run(true).await.unwrap();

    let leader = report.node("vault-0").unwrap();
    assert_eq!(leader.initial_state, NodeState::UninitializedNoRecord);
    assert!(matches!(leader.outcome, NodeOutcome::Recovered { .. }), "{:?}", leader.outcome);
    // The first create stored the record; the retry found it in place.
    assert_eq!(harness.secrets.put_count(), 2);

    let record = harness.persisted_record().await.unwrap();
    let persisted: Vec<String> = record.shares().iter().map(|share| share.expose().to_string()).collect();
    let ops = harness.vault.ops(&harness.address("vault-0"));
    assert_eq!(unseal_shares(&ops), persisted[..3].to_vec());
    assert_eq!(init_count(&ops), 1);
    assert!(!harness.vault.is_sealed(&harness.address("vault-0")));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_recovers_when_another_operator_initialized_first() {
    init_tracing();
    let harness = UnsealHarness::new().await;

    let report = racing_orchestrator(&harness).run(false).await.unwrap();

    let leader = report.node("vault-0").unwrap();
    assert_eq!(leader.initial_state, NodeState::UninitializedNoRecord);
    assert!(matches!(leader.outcome, NodeOutcome::Recovered { .. }), "{:?}", leader.outcome);
    // Our own record was never written over the winner's.
    assert_eq!(harness.secrets.put_count(), 0);

    let record = harness.persisted_record().await.unwrap();
    assert_eq!(Some(record.root_token().to_string()), harness.vault.root_token());
    let persisted: Vec<String> = record.shares().iter().map(|share| share.expose().to_string()).collect();
    let leader_ops = harness.vault.ops(&harness.address("vault-0"));
    // The single Init is ours, rejected because the node was already initialized.
    assert_eq!(init_count(&leader_ops), 1);
    for name in ["vault-0", "vault-1", "vault-2"] {
        let ops = harness.vault.ops(&harness.address(name));
        assert_eq!(unseal_shares(&ops), persisted[..3].to_vec(), "{name}");
        assert!(!harness.vault.is_sealed(&harness.address(name)), "{name} still sealed");
    }
}

#[tokio::test(start_paused = true)]
async fn test_init_command_reports_already_initialized_after_losing_the_race() {
    let harness = UnsealHarness::new().await;

    let report = racing_orchestrator(&harness).init_leader().await.unwrap();

    let leader = report.node("vault-0").unwrap();
    assert_eq!(leader.initial_state, NodeState::UninitializedNoRecord);
    assert_eq!(leader.outcome, NodeOutcome::AlreadyInitialized);
    assert_eq!(harness.secrets.put_count(), 0);
    assert!(harness.persisted_record().await.is_some());
    let ops = harness.vault.ops(&harness.address("vault-0"));
    assert_eq!(init_count(&ops), 1);
    assert!(unseal_shares(&ops).is_empty());
}
