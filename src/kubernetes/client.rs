//! Kubernetes client construction.
//!
//! In-cluster mode uses the pod's service account. Local mode reads the
//! kubeconfig at `KUBECONFIG`, falling back to `~/.kube/config`.

use std::path::PathBuf;

use kube::Client;
use kube::Config;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use snafu::ResultExt;
use tracing::debug;

use crate::config::ConfigError;
use crate::config::error::BuildKubeconfigSnafu;
use crate::config::error::CreateClientSnafu;
use crate::config::error::InClusterSnafu;
use crate::config::error::ReadKubeconfigSnafu;

/// Environment variable overriding the kubeconfig location.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Where Kubernetes credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Service account mounted into the pod.
    InCluster,
    /// A kubeconfig file on disk.
    Kubeconfig(PathBuf),
}

impl CredentialSource {
    /// Pick the credential source for `in_cluster`, resolving the kubeconfig
    /// location from the environment when running locally.
    pub fn resolve(in_cluster: bool) -> Result<Self, ConfigError> {
        if in_cluster {
            return Ok(Self::InCluster);
        }
        kubeconfig_location(std::env::var_os(KUBECONFIG_ENV), std::env::var_os("HOME")).map(Self::Kubeconfig)
    }
}

/// Resolve the kubeconfig path: `KUBECONFIG` wins, otherwise `$HOME/.kube/config`.
///
/// Only the first entry of a multi-path `KUBECONFIG` is used.
pub fn kubeconfig_location(
    kubeconfig_env: Option<std::ffi::OsString>,
    home: Option<std::ffi::OsString>,
) -> Result<PathBuf, ConfigError> {
    if let Some(value) = kubeconfig_env.filter(|value| !value.is_empty()) {
        if let Some(first) = std::env::split_paths(&value).next() {
            return Ok(first);
        }
    }
    let home = home.filter(|value| !value.is_empty()).ok_or(ConfigError::NoHomeDirectory)?;
    Ok(PathBuf::from(home).join(".kube").join("config"))
}

/// Build a Kubernetes client from `source`.
pub async fn create_client(source: &CredentialSource) -> Result<Client, ConfigError> {
    let config = match source {
        CredentialSource::InCluster => Config::incluster().context(InClusterSnafu)?,
        CredentialSource::Kubeconfig(path) => {
            debug!(path = %path.display(), "loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu {
                path: path.display().to_string(),
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context(BuildKubeconfigSnafu)?
        }
    };
    Client::try_from(config).context(CreateClientSnafu)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    #[test]
    fn test_kubeconfig_env_wins() {
        let path = kubeconfig_location(Some(OsString::from("/tmp/kube.yaml")), Some(OsString::from("/home/op"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/kube.yaml"));
    }

    #[test]
    fn test_kubeconfig_falls_back_to_home() {
        let path = kubeconfig_location(None, Some(OsString::from("/home/op"))).unwrap();
        assert_eq!(path, PathBuf::from("/home/op/.kube/config"));

        let path = kubeconfig_location(Some(OsString::new()), Some(OsString::from("/home/op"))).unwrap();
        assert_eq!(path, PathBuf::from("/home/op/.kube/config"));
    }

    #[test]
    fn test_kubeconfig_without_home_is_an_error() {
        assert!(matches!(kubeconfig_location(None, None), Err(ConfigError::NoHomeDirectory)));
    }

    #[test]
    fn test_in_cluster_source_skips_kubeconfig() {
        assert_eq!(CredentialSource::resolve(true).unwrap(), CredentialSource::InCluster);
    }
}
