//! HTTP implementation of [`VaultApi`] over `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::Method;
use reqwest::Response;
use reqwest::Url;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::api::HealthStatus;
use super::api::InitRequest;
use super::api::InitResponse;
use super::api::RaftJoinRequest;
use super::api::RaftJoinResponse;
use super::api::SealStatus;
use super::api::VaultApi;
use super::api::VaultApiError;
use super::api::VaultConnector;
use crate::config::ConfigError;
use crate::config::error::HttpClientSnafu;

// `*code=299` keeps every state a 2xx so the body is always decodable.
const HEALTH_PATH: &str =
    "/v1/sys/health?standbyok=true&perfstandbyok=true&sealedcode=299&uninitcode=299&drsecondarycode=299";
const INIT_PATH: &str = "/v1/sys/init";
const UNSEAL_PATH: &str = "/v1/sys/unseal";
const SEAL_STATUS_PATH: &str = "/v1/sys/seal-status";
const RAFT_JOIN_PATH: &str = "/v1/sys/storage/raft/join";

/// Error body returned by Vault for non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Serialize)]
struct UnsealBody<'a> {
    key: &'a str,
}

/// HTTP client for a single Vault node.
#[derive(Clone)]
pub struct HttpVaultClient {
    client: Client,
    base_url: Url,
    address: String,
}

impl HttpVaultClient {
    /// Build a client for `address` (e.g. `http://10.0.0.5:8200`) sharing the
    /// connection pool of `client`.
    pub fn new(client: Client, address: &str) -> Result<Self, VaultApiError> {
        let address = address.trim_end_matches('/').to_string();
        let base_url = Url::parse(&address).map_err(|err| VaultApiError::InvalidAddress {
            address: address.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            client,
            base_url,
            address,
        })
    }

    async fn request<B, T>(&self, method: Method, path: &str, operation: &str, body: Option<&B>) -> Result<T, VaultApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path).map_err(|err| VaultApiError::InvalidAddress {
            address: self.address.clone(),
            reason: err.to_string(),
        })?;
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = builder.send().await.map_err(|err| Self::map_send_error(operation, err))?;
        Self::decode_response(operation, resp).await
    }

    fn map_send_error(operation: &str, err: reqwest::Error) -> VaultApiError {
        if err.is_timeout() {
            VaultApiError::timeout(operation)
        } else {
            VaultApiError::transport(operation, err.to_string())
        }
    }

    async fn decode_response<T>(operation: &str, resp: Response) -> Result<T, VaultApiError>
    where
        T: DeserializeOwned,
    {
        let status = resp.status();
        if status.is_success() {
            resp.json::<T>().await.map_err(|err| {
                if err.is_timeout() {
                    VaultApiError::timeout(operation)
                } else {
                    VaultApiError::decode(operation, err.to_string())
                }
            })
        } else {
            let body = resp.text().await.unwrap_or_default();
            let errors = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(parsed) if !parsed.errors.is_empty() => parsed.errors,
                _ if body.trim().is_empty() => Vec::new(),
                _ => vec![body],
            };
            Err(VaultApiError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                errors,
            })
        }
    }
}

#[async_trait]
impl VaultApi for HttpVaultClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn health(&self) -> Result<HealthStatus, VaultApiError> {
        self.request::<(), _>(Method::GET, HEALTH_PATH, "health", None).await
    }

    async fn init(&self, request: InitRequest) -> Result<InitResponse, VaultApiError> {
        self.request(Method::PUT, INIT_PATH, "init", Some(&request)).await
    }

    async fn unseal(&self, share: &str) -> Result<SealStatus, VaultApiError> {
        self.request(Method::PUT, UNSEAL_PATH, "unseal", Some(&UnsealBody { key: share })).await
    }

    async fn seal_status(&self) -> Result<SealStatus, VaultApiError> {
        self.request::<(), _>(Method::GET, SEAL_STATUS_PATH, "seal-status", None).await
    }

    async fn raft_join(&self, request: RaftJoinRequest) -> Result<RaftJoinResponse, VaultApiError> {
        self.request(Method::POST, RAFT_JOIN_PATH, "raft-join", Some(&request)).await
    }
}

/// Connector handing out [`HttpVaultClient`]s that share one connection pool.
#[derive(Clone)]
pub struct HttpVaultConnector {
    client: Client,
}

impl HttpVaultConnector {
    /// Build a connector whose requests time out after `request_timeout`.
    ///
    /// Pods are reached by IP, so certificate verification is disabled for
    /// `https` addresses, matching the Vault CLI's `-tls-skip-verify`.
    pub fn new(request_timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .context(HttpClientSnafu)?;
        Ok(Self { client })
    }
}

impl VaultConnector for HttpVaultConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn VaultApi>, VaultApiError> {
        Ok(Arc::new(HttpVaultClient::new(self.client.clone(), address)?))
    }
}
