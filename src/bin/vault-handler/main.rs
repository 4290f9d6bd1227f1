//! vault-handler - bootstrap and unseal a Raft-backed Vault cluster on Kubernetes.
//!
//! # Usage
//!
//! ```bash
//! # From a pod with a service account that can read pods and create secrets
//! vault-handler unseal
//!
//! # Only the leader
//! vault-handler unseal --leader-only
//!
//! # From a workstation, using KUBECONFIG or ~/.kube/config
//! vault-handler --use-kubeconfig-in-cluster=false unseal
//!
//! # Initialize and persist key material, without unsealing
//! vault-handler init
//!
//! # JSON report for scripting
//! vault-handler --json unseal | jq '.nodes[].outcome'
//! ```
//!
//! # Tiger Style
//!
//! - Explicit error handling with anyhow
//! - Bounded waits on every step
//! - Fail-fast on invalid arguments

mod cli;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Initialize tracing subscriber with environment-based filtering.
///
/// - `quiet`: Suppress all logging output
/// - `verbose`: Enable debug-level logging
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.is_quiet, cli.global.is_verbose);

    cli.run().await
}
