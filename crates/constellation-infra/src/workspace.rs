//! IaC workspace: a directory of templates, variables and backend state
//!
//! ```text
//! Empty ──prepare──▶ Prepared ──plan──▶ Planned ──apply──▶ Applied
//!   ▲                   │                 │                   │
//!   └──── cleanup ◀──── destroy ◀─────────┴───────────────────┘
//! ```
//!
//! Upgrades never touch the current workspace directly. A copy is prepared
//! next to a backup under `constellation-upgrade/<upgrade_id>/` and only
//! promoted to the current workspace after a successful apply.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use constellation_common::fs::{atomic_write, copy_dir, remove_dir_if_exists};
use constellation_common::{BackendStep, CloudProvider, Error, Result};

use crate::backend::IacBackend;
use crate::templates::Template;

/// Variables file inside a workspace
pub const VARS_FILE: &str = "terraform.tfvars";

/// Saved plan inside a workspace
pub const PLAN_FILE: &str = "plan.zip";

/// Backend state inside a workspace
pub const STATE_FILE: &str = "terraform.tfstate";

/// Lock file in the directory holding all workspaces
pub const LOCK_FILE: &str = ".constellation.lock";

/// Backend log file, next to the workspaces
pub const LOG_FILE: &str = "terraform.log";

/// Minimum length of the init secret output
pub const MIN_INIT_SECRET_LEN: usize = 32;

// =============================================================================
// Lock
// =============================================================================

/// Exclusive advisory lock on the directory holding the workspaces
///
/// Released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Take the lock without waiting
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| Error::io("workspace_lock", root, e))?;
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io("workspace_lock", &path, e))?;
        FileExt::try_lock_exclusive(&file).map_err(|e| {
            Error::workspace_busy(
                root,
                format!("another constellation command holds {}: {}", path.display(), e),
            )
        })?;
        debug!(path = %path.display(), "Workspace lock acquired");
        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release workspace lock");
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// What an applied cluster workspace reports
#[derive(Clone, PartialEq, Eq)]
pub struct InfraState {
    /// Host or IP of the API server / init endpoint
    pub cluster_endpoint: String,
    /// SANs of the API server certificate
    pub api_server_cert_sans: Vec<String>,
    /// Secret for initializing the first control plane node
    pub init_secret: Vec<u8>,
    /// Unique id of the cluster resources
    pub uid: String,
    /// Azure attestation provider URL
    pub attestation_url: Option<String>,
}

impl fmt::Debug for InfraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfraState")
            .field("cluster_endpoint", &self.cluster_endpoint)
            .field("api_server_cert_sans", &self.api_server_cert_sans)
            .field("init_secret", &"[REDACTED]")
            .field("uid", &self.uid)
            .field("attestation_url", &self.attestation_url)
            .finish()
    }
}

/// What an applied IAM workspace reports
#[derive(Clone, PartialEq, Eq)]
pub enum IamOutput {
    /// AWS instance profiles
    Aws {
        /// Profile for control plane nodes
        control_plane_instance_profile: String,
        /// Profile for worker nodes
        worker_nodes_instance_profile: String,
    },
    /// Azure identity
    Azure {
        /// Subscription id
        subscription_id: String,
        /// Tenant id
        tenant_id: String,
        /// User assigned identity resource id
        uami_id: String,
    },
    /// GCP service account
    Gcp {
        /// Service account key (base64 JSON)
        service_account_key: String,
    },
}

impl fmt::Debug for IamOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aws {
                control_plane_instance_profile,
                worker_nodes_instance_profile,
            } => f
                .debug_struct("Aws")
                .field("control_plane_instance_profile", control_plane_instance_profile)
                .field("worker_nodes_instance_profile", worker_nodes_instance_profile)
                .finish(),
            Self::Azure {
                subscription_id,
                tenant_id,
                uami_id,
            } => f
                .debug_struct("Azure")
                .field("subscription_id", subscription_id)
                .field("tenant_id", tenant_id)
                .field("uami_id", uami_id)
                .finish(),
            Self::Gcp { .. } => f
                .debug_struct("Gcp")
                .field("service_account_key", &"[REDACTED]")
                .finish(),
        }
    }
}

struct Outputs<'a> {
    values: &'a BTreeMap<String, Value>,
    provider: CloudProvider,
}

impl Outputs<'_> {
    fn missing(&self, key: &str, what: &str) -> Error {
        Error::cloud_backend(
            BackendStep::Output,
            self.provider,
            format!("output {:?} {}", key, what),
        )
    }

    fn string(&self, key: &str) -> Result<String> {
        match self.values.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::String(_)) => Err(self.missing(key, "is empty")),
            Some(_) => Err(self.missing(key, "is not a string")),
            None => Err(self.missing(key, "not found")),
        }
    }

    fn optional_string(&self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| self.missing(key, "is not a list"))?;
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.missing(key, "contains a non-string"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

// =============================================================================
// Workspace
// =============================================================================

/// One IaC working directory
#[derive(Clone)]
pub struct IacWorkspace {
    dir: PathBuf,
    backend: Arc<dyn IacBackend>,
    provider: CloudProvider,
}

impl fmt::Debug for IacWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IacWorkspace")
            .field("dir", &self.dir)
            .field("provider", &self.provider)
            .finish()
    }
}

impl IacWorkspace {
    /// Workspace at `dir` for resources on `provider`
    pub fn new(dir: impl Into<PathBuf>, backend: Arc<dyn IacBackend>, provider: CloudProvider) -> Self {
        Self {
            dir: dir.into(),
            backend,
            provider,
        }
    }

    /// Directory of the workspace
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Provider of the managed resources
    pub fn provider(&self) -> CloudProvider {
        self.provider
    }

    /// Whether a variables file has been written
    pub fn is_prepared(&self) -> bool {
        self.dir.join(VARS_FILE).is_file()
    }

    fn backend_err(&self, step: BackendStep) -> impl Fn(crate::backend::BackendError) -> Error + '_ {
        move |e| {
            debug!(step = %step, error = %e, "Backend step failed");
            e.into_error(self.provider)
        }
    }

    /// Write the template and the rendered variables
    ///
    /// An existing variables file with different content is rejected.
    pub fn prepare(&self, template: &Template, vars: &str) -> Result<()> {
        let vars_path = self.dir.join(VARS_FILE);
        match std::fs::read_to_string(&vars_path) {
            Ok(existing) if existing != vars => {
                return Err(Error::config_validation(format!(
                    "workspace {} already exists with different variables",
                    self.dir.display()
                )));
            }
            Ok(_) => debug!(dir = %self.dir.display(), "Workspace already prepared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("prepare_workspace", &vars_path, e)),
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io("prepare_workspace", &self.dir, e))?;
        template.write_to(&self.dir)?;
        atomic_write(&vars_path, vars.as_bytes())?;
        info!(dir = %self.dir.display(), template = template.name, "Workspace prepared");
        Ok(())
    }

    /// Init and plan; `true` when the plan contains changes
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<bool> {
        self.backend
            .init(&self.dir, cancel)
            .await
            .map_err(self.backend_err(BackendStep::Init))?;
        let has_diff = self
            .backend
            .plan(&self.dir, PLAN_FILE, cancel)
            .await
            .map_err(self.backend_err(BackendStep::Plan))?;
        debug!(dir = %self.dir.display(), has_diff, "Plan computed");
        Ok(has_diff)
    }

    /// Render the last plan to `out`
    pub async fn show_plan(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let rendered = self
            .backend
            .show_plan(&self.dir, PLAN_FILE)
            .await
            .map_err(self.backend_err(BackendStep::Show))?;
        out.write_all(rendered.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| Error::internal_with_context("show_plan", e.to_string()))
    }

    async fn apply(&self, cancel: &CancellationToken) -> Result<BTreeMap<String, Value>> {
        self.backend
            .apply(&self.dir, cancel)
            .await
            .map_err(self.backend_err(BackendStep::Apply))?;
        self.backend
            .output(&self.dir)
            .await
            .map_err(self.backend_err(BackendStep::Output))
    }

    /// Apply a cluster workspace and read its outputs
    pub async fn apply_cluster(&self, cancel: &CancellationToken) -> Result<InfraState> {
        let values = self.apply(cancel).await?;
        let outputs = Outputs {
            values: &values,
            provider: self.provider,
        };

        let cluster_endpoint = outputs.string("ip")?;
        let init_secret = outputs.string("initSecret")?.into_bytes();
        if init_secret.len() < MIN_INIT_SECRET_LEN {
            return Err(outputs.missing(
                "initSecret",
                &format!("is shorter than {} bytes", MIN_INIT_SECRET_LEN),
            ));
        }
        let api_server_cert_sans = outputs
            .string_list("api_server_cert_sans")?
            .unwrap_or_else(|| vec![cluster_endpoint.clone()]);

        Ok(InfraState {
            cluster_endpoint,
            api_server_cert_sans,
            init_secret,
            uid: outputs.string("uid")?,
            attestation_url: outputs.optional_string("attestationURL"),
        })
    }

    /// Apply an IAM workspace and read its outputs
    pub async fn apply_iam(&self, cancel: &CancellationToken) -> Result<IamOutput> {
        let values = self.apply(cancel).await?;
        let outputs = Outputs {
            values: &values,
            provider: self.provider,
        };
        match self.provider {
            CloudProvider::Aws => Ok(IamOutput::Aws {
                control_plane_instance_profile: outputs.string("control_plane_instance_profile")?,
                worker_nodes_instance_profile: outputs.string("worker_nodes_instance_profile")?,
            }),
            CloudProvider::Azure => Ok(IamOutput::Azure {
                subscription_id: outputs.string("subscription_id")?,
                tenant_id: outputs.string("tenant_id")?,
                uami_id: outputs.string("uami_id")?,
            }),
            CloudProvider::Gcp => Ok(IamOutput::Gcp {
                service_account_key: outputs.string("sa_key")?,
            }),
            other => Err(Error::config_validation(format!(
                "IAM resources cannot be created on {}",
                other
            ))),
        }
    }

    /// Destroy all resources; a workspace that was never prepared is a no-op
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "No workspace, nothing to destroy");
            return Ok(());
        }
        self.backend
            .destroy(&self.dir, cancel)
            .await
            .map_err(self.backend_err(BackendStep::Destroy))?;
        info!(dir = %self.dir.display(), "Resources destroyed");
        Ok(())
    }

    /// Delete the workspace directory
    pub fn cleanup_workspace(&self) -> Result<()> {
        remove_dir_if_exists(&self.dir).map_err(|e| {
            Error::cloud_backend(BackendStep::Cleanup, self.provider, e.to_string())
        })
    }

    /// Stage a backup of this workspace and a prepared upgrade copy
    ///
    /// `upgrade_dir` and `backup_dir` must share a parent that does not
    /// exist yet. Both directories appear together or not at all.
    pub fn prepare_upgrade_workspace(
        &self,
        template: &Template,
        upgrade_dir: &Path,
        backup_dir: &Path,
        vars: &str,
    ) -> Result<UpgradeWorkspace> {
        self.prepare_upgrade_with(template, upgrade_dir, backup_dir, vars, &mut |_| Ok(()))
    }

    fn prepare_upgrade_with(
        &self,
        template: &Template,
        upgrade_dir: &Path,
        backup_dir: &Path,
        vars: &str,
        before: &mut dyn FnMut(StagingStep) -> Result<()>,
    ) -> Result<UpgradeWorkspace> {
        let root = match (upgrade_dir.parent(), backup_dir.parent()) {
            (Some(a), Some(b)) if a == b => a.to_path_buf(),
            _ => {
                return Err(Error::internal_with_context(
                    "prepare_upgrade_workspace",
                    "upgrade and backup directories must share a parent",
                ))
            }
        };
        if !self.is_prepared() {
            return Err(Error::config_validation(format!(
                "no workspace at {}; create the cluster first",
                self.dir.display()
            )));
        }
        if backup_dir.exists() {
            return Err(Error::config_validation(format!(
                "upgrade backup {} already exists; inspect and remove it manually",
                backup_dir.display()
            )));
        }
        if root.exists() {
            return Err(Error::config_validation(format!(
                "upgrade directory {} already exists",
                root.display()
            )));
        }

        let (upgrade_name, backup_name) = match (upgrade_dir.file_name(), backup_dir.file_name()) {
            (Some(u), Some(b)) if u != b => (u.to_owned(), b.to_owned()),
            _ => {
                return Err(Error::internal_with_context(
                    "prepare_upgrade_workspace",
                    "upgrade and backup directories need distinct names",
                ))
            }
        };
        let staging = staging_path(&root)?;
        remove_dir_if_exists(&staging)?;

        let staged = (|| -> Result<()> {
            before(StagingStep::CopyBackup)?;
            copy_dir(&self.dir, &staging.join(&backup_name))?;
            before(StagingStep::CopyUpgrade)?;
            let staged_upgrade = staging.join(&upgrade_name);
            copy_dir(&self.dir, &staged_upgrade)?;
            before(StagingStep::WriteTemplate)?;
            template.write_to(&staged_upgrade)?;
            before(StagingStep::WriteVars)?;
            atomic_write(&staged_upgrade.join(VARS_FILE), vars.as_bytes())?;
            before(StagingStep::Publish)?;
            std::fs::rename(&staging, &root).map_err(|e| Error::io("prepare_upgrade_workspace", &root, e))
        })();

        if let Err(e) = staged {
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
            }
            return Err(Error::cloud_backend(BackendStep::Prepare, self.provider, e.to_string()));
        }

        info!(
            upgrade = %upgrade_dir.display(),
            backup = %backup_dir.display(),
            "Upgrade workspace prepared"
        );
        Ok(UpgradeWorkspace {
            workspace: IacWorkspace::new(upgrade_dir, self.backend.clone(), self.provider),
            current_dir: self.dir.clone(),
            backup_dir: backup_dir.to_path_buf(),
            root,
        })
    }
}

/// I/O steps of staging an upgrade workspace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StagingStep {
    CopyBackup,
    CopyUpgrade,
    WriteTemplate,
    WriteVars,
    Publish,
}

fn staging_path(root: &Path) -> Result<PathBuf> {
    let name = root.file_name().ok_or_else(|| {
        Error::internal_with_context(
            "prepare_upgrade_workspace",
            format!("{} has no file name", root.display()),
        )
    })?;
    let parent = root.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| Error::io("prepare_upgrade_workspace", parent, e))?;
    Ok(parent.join(format!(".{}.staging", name.to_string_lossy())))
}

// =============================================================================
// Upgrade workspace
// =============================================================================

/// A prepared upgrade copy plus the backup of the workspace it replaces
#[derive(Debug)]
pub struct UpgradeWorkspace {
    workspace: IacWorkspace,
    current_dir: PathBuf,
    backup_dir: PathBuf,
    root: PathBuf,
}

impl UpgradeWorkspace {
    /// The upgrade copy
    pub fn workspace(&self) -> &IacWorkspace {
        &self.workspace
    }

    /// Backup of the workspace as it was before the upgrade
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Directory holding both upgrade copy and backup
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Put the backup back in place and drop the upgrade directory
    pub fn restore_backup(self) -> Result<()> {
        restore_backup(&self.current_dir, &self.backup_dir)?;
        remove_dir_if_exists(&self.root)?;
        info!(dir = %self.current_dir.display(), "Workspace restored from backup");
        Ok(())
    }

    /// Replace the current workspace with the upgraded copy
    pub fn promote(self) -> Result<()> {
        promote_upgrade_workspace(&self.current_dir, self.workspace.dir(), &self.backup_dir)?;
        remove_dir_if_exists(&self.root)?;
        Ok(())
    }

    /// Drop the upgrade directory; the current workspace is untouched
    pub fn discard(self) -> Result<()> {
        remove_dir_if_exists(&self.root)
    }
}

/// Replace `current_dir` with `backup_dir`
pub fn restore_backup(current_dir: &Path, backup_dir: &Path) -> Result<()> {
    if !backup_dir.is_dir() {
        return Err(Error::internal_with_context(
            "restore_backup",
            format!("backup {} does not exist", backup_dir.display()),
        ));
    }
    remove_dir_if_exists(current_dir)?;
    std::fs::rename(backup_dir, current_dir).map_err(|e| Error::io("restore_backup", backup_dir, e))
}

/// Replace `current_dir` with `upgrade_dir`, then delete `backup_dir`
pub fn promote_upgrade_workspace(current_dir: &Path, upgrade_dir: &Path, backup_dir: &Path) -> Result<()> {
    if !upgrade_dir.is_dir() {
        return Err(Error::internal_with_context(
            "promote_upgrade_workspace",
            format!("upgrade workspace {} does not exist", upgrade_dir.display()),
        ));
    }
    remove_dir_if_exists(current_dir)?;
    std::fs::rename(upgrade_dir, current_dir)
        .map_err(|e| Error::io("promote_upgrade_workspace", upgrade_dir, e))?;
    remove_dir_if_exists(backup_dir)?;
    info!(dir = %current_dir.display(), "Upgrade workspace promoted");
    Ok(())
}
