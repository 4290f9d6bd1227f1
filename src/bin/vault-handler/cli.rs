//! CLI argument parsing and command dispatch.
//!
//! Uses clap derive macros for declarative argument definition with
//! support for environment variables and global options.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use tracing::info;
use vault_handler::ClusterConfiguration;
use vault_handler::UnsealOrchestrator;
use vault_handler::constants::DEFAULT_NAMESPACE;
use vault_handler::constants::DEFAULT_SECRET_NAME;
use vault_handler::constants::DEFAULT_SECRET_SHARES;
use vault_handler::constants::DEFAULT_SECRET_THRESHOLD;
use vault_handler::constants::DISCOVERY_TIMEOUT;
use vault_handler::kubernetes::CredentialSource;
use vault_handler::kubernetes::KubePodRegistry;
use vault_handler::kubernetes::KubeSecretStore;
use vault_handler::kubernetes::create_client;
use vault_handler::unseal::OrchestratorError;
use vault_handler::unseal::RunReport;
use vault_handler::vault::HttpVaultConnector;

use crate::output::print_output;

/// Bootstrap and unseal a Raft-backed Vault cluster running in Kubernetes.
#[derive(Parser)]
#[command(name = "vault-handler")]
#[command(version)]
#[command(about = "Bootstrap and unseal a Raft-backed Vault cluster running in Kubernetes")]
#[command(long_about = "Initializes the Vault leader, persists its key material in a Kubernetes \
    secret, joins followers to the leader's Raft cluster, and unseals every node. \
    Safe to re-run after a partial failure.")]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global options available to all commands.
#[derive(Args, Clone, Debug)]
pub struct GlobalOptions {
    /// Use the pod's service account instead of a kubeconfig file.
    ///
    /// Pass `--use-kubeconfig-in-cluster=false` to run from a workstation;
    /// the kubeconfig is then read from KUBECONFIG or ~/.kube/config.
    #[arg(
        long = "use-kubeconfig-in-cluster",
        env = "VAULT_HANDLER_IN_CLUSTER",
        default_value_t = true,
        action = ArgAction::Set,
        global = true
    )]
    pub in_cluster: bool,

    /// Namespace of the Vault StatefulSet and the unseal secret.
    #[arg(long, env = "VAULT_HANDLER_NAMESPACE", default_value = DEFAULT_NAMESPACE, global = true)]
    pub namespace: String,

    /// Name of the secret holding the root token and unseal keys.
    #[arg(long, env = "VAULT_HANDLER_SECRET_NAME", default_value = DEFAULT_SECRET_NAME, global = true)]
    pub secret_name: String,

    /// Number of key shares generated at initialization.
    #[arg(long, env = "VAULT_HANDLER_SECRET_SHARES", default_value_t = DEFAULT_SECRET_SHARES, global = true)]
    pub secret_shares: u8,

    /// Number of key shares required to unseal.
    #[arg(long, env = "VAULT_HANDLER_SECRET_THRESHOLD", default_value_t = DEFAULT_SECRET_THRESHOLD, global = true)]
    pub secret_threshold: u8,

    /// Seconds to wait for each pod to be running.
    #[arg(
        long = "discovery-timeout",
        env = "VAULT_HANDLER_DISCOVERY_TIMEOUT",
        default_value_t = DISCOVERY_TIMEOUT.as_secs(),
        global = true
    )]
    pub discovery_timeout_secs: u64,

    /// Leader API address followers join (default: the leader's pod address).
    #[arg(long, env = "VAULT_HANDLER_RAFT_LEADER_API_ADDR", global = true)]
    pub raft_leader_api_addr: Option<String>,

    /// Output JSON instead of human-readable format.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Suppress all logging output.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

impl GlobalOptions {
    /// Build the cluster configuration from these options.
    pub fn cluster_configuration(&self) -> ClusterConfiguration {
        let mut config = ClusterConfiguration {
            namespace: self.namespace.clone(),
            secret_name: self.secret_name.clone(),
            raft_leader_api_addr: self.raft_leader_api_addr.clone(),
            ..ClusterConfiguration::default()
        }
        .with_shares(self.secret_shares, self.secret_threshold);
        config.timings.discovery_timeout = Duration::from_secs(self.discovery_timeout_secs);
        config
    }
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the leader if needed, then join and unseal every node.
    Unseal(UnsealArgs),

    /// Initialize the leader and persist its key material without unsealing.
    ///
    /// Does nothing when the leader is already initialized.
    Init,
}

#[derive(Args, Debug)]
pub struct UnsealArgs {
    /// Only initialize/unseal the leader; leave followers untouched.
    #[arg(long)]
    pub leader_only: bool,
}

impl Cli {
    /// Execute the CLI command.
    pub async fn run(self) -> Result<()> {
        let config = self.global.cluster_configuration();
        config.validate().context("invalid cluster configuration")?;

        let source = CredentialSource::resolve(self.global.in_cluster).context("failed to locate Kubernetes credentials")?;
        let client = create_client(&source).await.context("failed to create Kubernetes client")?;
        let connector =
            HttpVaultConnector::new(config.timings.request_timeout).context("failed to create Vault HTTP client")?;

        info!(namespace = %config.namespace, leader = %config.leader, followers = ?config.followers, "starting");

        let orchestrator = UnsealOrchestrator::new(
            config,
            Arc::new(KubePodRegistry::new(client.clone())),
            Arc::new(KubeSecretStore::new(client)),
            Arc::new(connector),
        )
        .context("invalid cluster configuration")?;

        let result = match &self.command {
            Commands::Unseal(args) => orchestrator.run(args.leader_only).await,
            Commands::Init => orchestrator.init_leader().await,
        };
        finish(result, self.global.is_json)
    }
}

/// Print the report (partial on failure) and map the outcome to the exit status.
fn finish(result: Result<RunReport, OrchestratorError>, json: bool) -> Result<()> {
    match result {
        Ok(report) => {
            print_output(&report, json);
            Ok(())
        }
        Err(err) => {
            if !err.report.nodes.is_empty() {
                print_output(&err.report, json);
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["vault-handler", "unseal"]).unwrap();
        assert!(cli.global.in_cluster);
        assert!(matches!(cli.command, Commands::Unseal(UnsealArgs { leader_only: false })));

        let config = cli.global.cluster_configuration();
        assert_eq!(config, ClusterConfiguration::default());
    }

    #[test]
    fn test_local_credentials_and_overrides() {
        let cli = Cli::try_parse_from([
            "vault-handler",
            "--use-kubeconfig-in-cluster=false",
            "--namespace",
            "secrets",
            "--secret-shares",
            "7",
            "--secret-threshold",
            "4",
            "--discovery-timeout",
            "120",
            "unseal",
            "--leader-only",
        ])
        .unwrap();

        assert!(!cli.global.in_cluster);
        assert!(matches!(cli.command, Commands::Unseal(UnsealArgs { leader_only: true })));
        let config = cli.global.cluster_configuration();
        assert_eq!(config.namespace, "secrets");
        assert_eq!((config.secret_shares, config.secret_threshold), (7, 4));
        assert_eq!(config.timings.discovery_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_init_command() {
        let cli = Cli::try_parse_from(["vault-handler", "init", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Init));
        assert!(cli.global.is_json);
    }
}
