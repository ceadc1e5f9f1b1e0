//! Access to the cluster object store
//!
//! Writes carry the `resourceVersion` of the object they were derived from,
//! so a concurrent change makes them fail with [`StoreError::Conflict`]
//! instead of silently overwriting it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use constellation_common::Error;

use crate::crd::{NodeVersion, NODE_VERSION_NAME};

/// Budget for a single call against the cluster API
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for one read-modify-write transaction, retries included
pub const TRANSACTION_BUDGET: Duration = Duration::from_secs(30);

/// Run `transaction` within [`TRANSACTION_BUDGET`]
///
/// Expiry surfaces as a transport error naming `operation`.
pub async fn within_budget<T, F>(operation: &str, transaction: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(TRANSACTION_BUDGET, transaction).await {
        Ok(result) => result,
        Err(_) => Err(Error::transport(
            operation,
            format!("transaction did not complete within {:?}", TRANSACTION_BUDGET),
        )),
    }
}

/// Failure of one object store call
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// Create of an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// The object changed since it was read
    #[error("{kind} {name} was modified concurrently")]
    Conflict {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// The call exceeded [`CALL_TIMEOUT`]
    #[error("{kind} {name}: call timed out after {timeout:?}")]
    Timeout {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// Any other API failure
    #[error("{kind} {name}: {message}")]
    Api {
        /// Object kind
        kind: &'static str,
        /// Object name
        name: String,
        /// HTTP status, `None` when no response was received
        code: Option<u16>,
        /// Error reported by the API
        message: String,
    },
}

impl StoreError {
    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a create hit an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether the write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether repeating the call may succeed
    ///
    /// Conflicts, timeouts, throttling, server errors, and failures without
    /// a response are transient. Any other 4xx rejects the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Timeout { .. } => true,
            Self::Api { code: None, .. } => true,
            Self::Api { code: Some(code), .. } => *code == 429 || *code >= 500,
            Self::NotFound { .. } | Self::AlreadyExists { .. } => false,
        }
    }

    fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        let name = name.to_string();
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound { kind, name },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists { kind, name }
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict { kind, name },
            kube::Error::Api(resp) => Self::Api {
                kind,
                name,
                code: Some(resp.code),
                message: resp.message,
            },
            other => Self::Api {
                kind,
                name,
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { kind, name } => {
                Error::not_found(format!("{} {}", kind, name), err.to_string())
            }
            StoreError::Conflict { kind, name } => {
                Error::transport_status(format!("{} {}", kind, name), 409)
            }
            StoreError::Timeout { kind, name, .. } => {
                Error::transport(format!("{} {}", kind, name), err.to_string())
            }
            StoreError::Api { kind, name, code, .. } if err.is_transient() => Error::Transport {
                target: format!("{} {}", kind, name),
                message: err.to_string(),
                status: *code,
            },
            StoreError::Api { code, .. } => Error::internal_with_context(
                "cluster_store",
                format!("{} (status {})", err, code.unwrap_or_default()),
            ),
            StoreError::AlreadyExists { .. } => {
                Error::internal_with_context("cluster_store", err.to_string())
            }
        }
    }
}

/// Objects the lifecycle engine reads and writes inside the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// The cluster's NodeVersion
    async fn get_node_version(&self) -> Result<NodeVersion, StoreError>;

    /// Replace the NodeVersion; fails with `Conflict` on a stale resource version
    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, StoreError>;

    /// ConfigMap `name` in the system namespace
    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError>;

    /// Create a ConfigMap; fails with `AlreadyExists` if the name is taken
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Replace a ConfigMap; fails with `Conflict` on a stale resource version
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Delete ConfigMap `name`
    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError>;
}

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config_validation(format!("reading kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::config_validation(format!("loading kubeconfig {}: {}", path.display(), e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::config_validation(format!("no usable kubeconfig: {}", e))
        })?,
    };
    config.connect_timeout = Some(CALL_TIMEOUT);
    config.read_timeout = Some(CALL_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::internal_with_context("create_client", e.to_string()))
}

/// [`ClusterStore`] talking to the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
    namespace: String,
}

impl KubeClusterStore {
    /// Store for ConfigMaps in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn node_versions(&self) -> Api<NodeVersion> {
        Api::all(self.client.clone())
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

async fn call<T, F>(kind: &'static str, name: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    debug!(kind, name, "Cluster API call");
    match tokio::time::timeout(CALL_TIMEOUT, fut).await {
        Ok(result) => result.map_err(|e| StoreError::from_kube(kind, name, e)),
        Err(_) => Err(StoreError::Timeout {
            kind,
            name: name.to_string(),
            timeout: CALL_TIMEOUT,
        }),
    }
}

fn name_of(config_map: &ConfigMap) -> String {
    config_map.metadata.name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_node_version(&self) -> Result<NodeVersion, StoreError> {
        call("NodeVersion", NODE_VERSION_NAME, self.node_versions().get(NODE_VERSION_NAME)).await
    }

    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, StoreError> {
        call(
            "NodeVersion",
            NODE_VERSION_NAME,
            self.node_versions()
                .replace(NODE_VERSION_NAME, &PostParams::default(), node_version),
        )
        .await
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError> {
        call("ConfigMap", name, self.config_maps().get(name)).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = name_of(config_map);
        call(
            "ConfigMap",
            &name,
            self.config_maps().create(&PostParams::default(), config_map),
        )
        .await
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = name_of(config_map);
        call(
            "ConfigMap",
            &name,
            self.config_maps()
                .replace(&name, &PostParams::default(), config_map),
        )
        .await
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError> {
        match call(
            "ConfigMap",
            name,
            self.config_maps().delete(name, &DeleteParams::default()),
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use constellation_common::ErrorKind;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn kube_errors_are_classified() {
        assert!(StoreError::from_kube("ConfigMap", "a", api_error(404, "NotFound")).is_not_found());
        assert!(StoreError::from_kube("ConfigMap", "a", api_error(409, "AlreadyExists")).is_already_exists());
        assert!(StoreError::from_kube("ConfigMap", "a", api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            StoreError::from_kube("ConfigMap", "a", api_error(500, "InternalError")),
            StoreError::Api { .. }
        ));
    }

    #[test]
    fn conflicts_map_to_retryable_errors() {
        let err: Error = StoreError::Conflict {
            kind: "NodeVersion",
            name: NODE_VERSION_NAME.to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: Error = StoreError::NotFound {
            kind: "ConfigMap",
            name: "join-config".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejected_requests_are_not_retried() {
        for code in [400, 401, 403, 422] {
            let err: Error =
                StoreError::from_kube("ConfigMap", "join-config", api_error(code, "Forbidden")).into();
            assert!(!err.is_retryable(), "status {} must fail fast", code);
            assert_eq!(err.kind(), ErrorKind::Internal);
        }
        for code in [429, 500, 503] {
            let err: Error =
                StoreError::from_kube("ConfigMap", "join-config", api_error(code, "Unavailable")).into();
            assert!(err.is_retryable(), "status {} is transient", code);
        }
    }

    #[tokio::test]
    async fn timeouts_are_reported() {
        tokio::time::pause();
        let pending = std::future::pending::<Result<(), kube::Error>>();
        let err = call("ConfigMap", "join-config", pending).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));
    }
}
