//! Configuration error types

use snafu::Snafu;

use super::validation::ValidationError;

/// Errors raised while building the process configuration or Kubernetes client.
///
/// Always fatal: surfaced immediately, never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A configuration value failed validation.
    #[snafu(display("invalid configuration: {source}"))]
    Invalid { source: ValidationError },

    /// The kubeconfig file could not be found or read.
    #[snafu(display("error reading kubeconfig {path}: {source}"))]
    ReadKubeconfig {
        path: String,
        source: kube::config::KubeconfigError,
    },

    /// Building client configuration from a kubeconfig failed.
    #[snafu(display("error building kubeconfig: {source}"))]
    BuildKubeconfig { source: kube::config::KubeconfigError },

    /// In-cluster service-account credentials were unavailable.
    #[snafu(display("error loading in-cluster configuration: {source}"))]
    InCluster { source: kube::config::InClusterError },

    /// Creating the Kubernetes client failed.
    #[snafu(display("error creating kubernetes client: {source}"))]
    CreateClient { source: kube::Error },

    /// Creating the Vault HTTP client failed.
    #[snafu(display("error creating vault http client: {source}"))]
    HttpClient { source: reqwest::Error },

    /// No home directory to resolve `~/.kube/config` against.
    #[snafu(display("cannot locate kubeconfig: KUBECONFIG is unset and no home directory is known"))]
    NoHomeDirectory,
}

impl From<ValidationError> for ConfigError {
    fn from(source: ValidationError) -> Self {
        ConfigError::Invalid { source }
    }
}
