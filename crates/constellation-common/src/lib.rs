//! Common types for the Constellation lifecycle engine: errors, config,
//! versions, persisted state, and rollback

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod fs;
pub mod provider;
pub mod retry;
pub mod rollback;
pub mod state;
pub mod telemetry;
pub mod version;

pub use error::{BackendStep, Error, ErrorKind};
pub use provider::{AttestationVariant, CloudProvider};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// User configuration file name
pub const CONFIG_FILENAME: &str = "constellation-conf.yaml";

/// Cluster identity file name
pub const STATE_FILENAME: &str = "constellation-state.json";

/// Master secret file name
pub const MASTER_SECRET_FILENAME: &str = "constellation-mastersecret.base64";

/// Cluster IaC workspace directory
pub const TERRAFORM_WORKING_DIR: &str = "constellation-terraform";

/// IAM IaC workspace directory
pub const TERRAFORM_IAM_WORKING_DIR: &str = "constellation-iam-terraform";

/// Parent directory of upgrade workspaces and backups
pub const UPGRADE_DIR: &str = "constellation-upgrade";

/// Name of the cluster workspace inside an upgrade directory
pub const TERRAFORM_UPGRADE_WORKING_DIR: &str = "terraform";

/// Name of the cluster workspace backup inside an upgrade directory
pub const TERRAFORM_UPGRADE_BACKUP_DIR: &str = "terraform-backup";

/// Namespace of the engine's cluster resources
pub const CONSTELLATION_NAMESPACE: &str = "kube-system";

/// Environment variable selecting the development signing key and CDN
pub const DEV_ENV_VAR: &str = "CONSTELLATION_DEV";

/// Production CDN base URL
pub const CDN_REPOSITORY_URL: &str = "https://cdn.confidential.cloud";

/// Development CDN base URL
pub const CDN_DEV_REPOSITORY_URL: &str = "https://cdn.confidential.cloud/dev";

/// Whether the development key set is enabled through the environment
pub fn dev_mode_enabled() -> bool {
    std::env::var(DEV_ENV_VAR)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
