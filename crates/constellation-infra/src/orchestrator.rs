//! Cluster lifecycle on top of the IaC workspaces
//!
//! [`InfraOrchestrator`] ties measurements, image references, variable
//! builders and workspaces together into `create`, `upgrade`, `destroy`
//! and the IAM equivalents. Every operation holds the workspace lock for
//! its whole duration.
//!
//! Failure handling follows one rule: steps that created something push a
//! compensation, and any error other than cancellation runs them newest
//! first. A cancelled operation leaves its artifacts in place so that
//! `destroy` can pick them up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use constellation_attestation::{
    AttestationConfigBuilder, AttestationPolicy, FetchedMeasurements, MasterSecret, MeasurementSource,
};
use constellation_common::config::{ClusterConfig, IamConfig};
use constellation_common::fs::remove_file_if_exists;
use constellation_common::rollback::{Compensation, RollbackComposer};
use constellation_common::state::{load_master_secret, save_master_secret, IdFile};
use constellation_common::version::ImageVersion;
use constellation_common::{
    AttestationVariant, BackendStep, CloudProvider, Error, Result, MASTER_SECRET_FILENAME, STATE_FILENAME,
    TERRAFORM_IAM_WORKING_DIR, TERRAFORM_UPGRADE_BACKUP_DIR, TERRAFORM_UPGRADE_WORKING_DIR,
    TERRAFORM_WORKING_DIR, UPGRADE_DIR,
};

use crate::backend::IacBackend;
use crate::image::ImageReferenceSource;
use crate::libvirt::{DockerLibvirtRunner, LibvirtRunner};
use crate::policy_patcher::PolicyPatcher;
use crate::rollback::{LibvirtCompensation, WorkspaceCompensation};
use crate::templates::{iam_template_for, template_for};
use crate::variables::{current_uid, resolve_libvirt, variables_for, IamVariables, LibvirtTarget};
use crate::workspace::{IacWorkspace, IamOutput, InfraState, UpgradeWorkspace, WorkspaceLock};

const CREATE_PHASES: u32 = 6;
const UPGRADE_PHASES: u32 = 5;

// =============================================================================
// Seams
// =============================================================================

/// Asks whether a rendered plan may be applied
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlanConfirmer: Send + Sync {
    /// Show `plan` and return the decision
    async fn confirm(&self, plan: &str) -> Result<bool>;
}

/// Approves every plan without asking
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl PlanConfirmer for AutoApprove {
    async fn confirm(&self, _plan: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Work done against the new cluster once its infrastructure exists
///
/// The returned compensation, if any, is rolled back together with the
/// infrastructure when a later step fails.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterHandoff: Send + Sync {
    /// Provision cluster side configuration for `state`
    async fn provision(
        &self,
        state: &InfraState,
        policy: &AttestationPolicy,
        measurement_salt: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn Compensation>>>;
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a successful `create`
#[derive(Debug)]
pub struct CreateOutcome {
    /// Outputs of the applied workspace
    pub state: InfraState,
    /// Identity written to the state file
    pub id_file: IdFile,
    /// Attestation policy bound to the new cluster
    pub policy: AttestationPolicy,
}

/// Result of an `upgrade` run
#[derive(Debug)]
pub struct UpgradeOutcome {
    /// Name of the upgrade directory
    pub upgrade_id: String,
    /// Whether the plan contained infrastructure changes
    pub has_diff: bool,
    /// Whether the upgrade was applied and promoted
    pub applied: bool,
    /// Image the cluster should move to
    pub image: ImageVersion,
    /// Provider specific reference of that image
    pub image_reference: String,
    /// Verified measurements of the image
    pub measurements: FetchedMeasurements,
    /// Attestation policy for the new image, bound to the cluster identity
    pub policy: AttestationPolicy,
}

/// New upgrade id: UTC timestamp plus 8 random hex characters
pub fn new_upgrade_id(check_only: bool) -> String {
    let suffix = hex::encode(rand::random::<[u8; 4]>());
    let mut id = format!("{}-{}", Utc::now().format("%Y-%m-%d-%H-%M-%S"), suffix);
    if check_only {
        id.push_str("-tmp");
    }
    id
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Cluster and IAM lifecycle for one workspace root
pub struct InfraOrchestrator {
    root: PathBuf,
    backend: Arc<dyn IacBackend>,
    measurements: Arc<dyn MeasurementSource>,
    images: Arc<dyn ImageReferenceSource>,
    libvirt: Arc<dyn LibvirtRunner>,
    patcher: Option<Arc<dyn PolicyPatcher>>,
    confirmer: Arc<dyn PlanConfirmer>,
    handoff: Option<Arc<dyn ClusterHandoff>>,
}

impl InfraOrchestrator {
    /// Orchestrator for the workspace root `root`
    ///
    /// Plans are approved automatically until [`Self::with_confirmer`] is
    /// used; the local libvirt container is managed through docker.
    pub fn new(
        root: impl Into<PathBuf>,
        backend: Arc<dyn IacBackend>,
        measurements: Arc<dyn MeasurementSource>,
        images: Arc<dyn ImageReferenceSource>,
    ) -> Self {
        let root = root.into();
        Self {
            libvirt: Arc::new(DockerLibvirtRunner::new(root.clone())),
            root,
            backend,
            measurements,
            images,
            patcher: None,
            confirmer: Arc::new(AutoApprove),
            handoff: None,
        }
    }

    /// Use another libvirt runner
    pub fn with_libvirt(mut self, libvirt: Arc<dyn LibvirtRunner>) -> Self {
        self.libvirt = libvirt;
        self
    }

    /// Patcher for Azure attestation providers
    pub fn with_policy_patcher(mut self, patcher: Arc<dyn PolicyPatcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Ask `confirmer` before applying a plan with changes
    pub fn with_confirmer(mut self, confirmer: Arc<dyn PlanConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    /// Run `handoff` after the infrastructure of a new cluster is up
    pub fn with_handoff(mut self, handoff: Arc<dyn ClusterHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILENAME)
    }

    fn master_secret_path(&self) -> PathBuf {
        self.root.join(MASTER_SECRET_FILENAME)
    }

    fn cluster_workspace(&self, provider: CloudProvider) -> IacWorkspace {
        IacWorkspace::new(self.root.join(TERRAFORM_WORKING_DIR), self.backend.clone(), provider)
    }

    fn iam_workspace(&self, provider: CloudProvider) -> IacWorkspace {
        IacWorkspace::new(self.root.join(TERRAFORM_IAM_WORKING_DIR), self.backend.clone(), provider)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Create the infrastructure of a new cluster
    pub async fn create(&self, config: &ClusterConfig, cancel: &CancellationToken) -> Result<CreateOutcome> {
        config.validate()?;
        let _lock = WorkspaceLock::acquire(&self.root)?;
        if self.state_path().exists() {
            return Err(Error::config_validation(format!(
                "{} already exists; destroy the current cluster first",
                self.state_path().display()
            )));
        }

        let mut rollback = RollbackComposer::new();
        match self.create_steps(config, cancel, &mut rollback).await {
            Ok(outcome) => {
                rollback.commit();
                info!(
                    provider = %config.cloud_provider,
                    endpoint = %outcome.state.cluster_endpoint,
                    "Cluster infrastructure created"
                );
                Ok(outcome)
            }
            Err(e @ Error::Cancelled { .. }) => {
                warn!(
                    error = %e,
                    "Create was cancelled; resources may remain, run `constellation destroy` to remove them"
                );
                Err(e)
            }
            Err(e) => Err(rollback.rollback(e).await),
        }
    }

    async fn create_steps(
        &self,
        config: &ClusterConfig,
        cancel: &CancellationToken,
        rollback: &mut RollbackComposer,
    ) -> Result<CreateOutcome> {
        let provider = config.cloud_provider;
        let variant = config.attestation_variant();
        let image = config.image_version()?;

        info!("[Phase 1/{}] Fetching measurements for {}", CREATE_PHASES, image);
        let fetched = self.measurements.fetch(&image, variant, cancel).await?;

        info!("[Phase 2/{}] Building attestation policy", CREATE_PHASES);
        let secret = match load_master_secret(&self.master_secret_path())? {
            Some(key) => MasterSecret::with_new_salt(key)?,
            None => MasterSecret::generate()?,
        };
        let policy = AttestationConfigBuilder::new(&fetched.bundle)
            .with_master_secret(&secret)?
            .build()?;

        info!("[Phase 3/{}] Resolving image reference", CREATE_PHASES);
        let image_ref = self
            .images
            .fetch_reference(provider, variant, &image, &region_of(config), cancel)
            .await?;
        let libvirt = self.prepare_libvirt(config, cancel, rollback).await?;

        info!("[Phase 4/{}] Preparing workspace", CREATE_PHASES);
        let vars = variables_for(config, &image_ref, libvirt.as_ref())?.render()?;
        let workspace = self.cluster_workspace(provider);
        workspace.prepare(&template_for(provider), &vars)?;
        rollback.push(Box::new(WorkspaceCompensation::new(
            workspace.clone(),
            CancellationToken::new(),
        )));

        info!("[Phase 5/{}] Planning and applying infrastructure", CREATE_PHASES);
        if !self.plan_and_confirm(&workspace, cancel).await? {
            let declined = std::mem::take(rollback);
            for failure in declined.run().await {
                warn!(error = %failure, "Cleanup after declined plan failed");
            }
            return Err(Error::cancelled("create: plan declined"));
        }
        let state = workspace.apply_cluster(cancel).await?;
        self.patch_attestation_policy(variant, &state, cancel).await?;

        info!("[Phase 6/{}] Writing cluster identity", CREATE_PHASES);
        if let Some(handoff) = &self.handoff {
            if let Some(compensation) = handoff.provision(&state, &policy, secret.salt(), cancel).await? {
                rollback.push(compensation);
            }
        }
        let id_file = IdFile {
            cloud_provider: provider,
            cluster_endpoint: state.cluster_endpoint.clone(),
            uid: state.uid.clone(),
            init_secret: state.init_secret.clone(),
            attestation_url: state.attestation_url.clone(),
            measurement_salt: Some(secret.salt().to_vec()),
            owner_id: Some(hex::encode(secret.owner_id())),
            cluster_id: Some(hex::encode(secret.cluster_id()?)),
        };
        save_master_secret(&self.master_secret_path(), secret.key())?;
        id_file.save(&self.state_path())?;

        Ok(CreateOutcome { state, id_file, policy })
    }

    /// Start the local libvirt container when the config asks for it
    async fn prepare_libvirt(
        &self,
        config: &ClusterConfig,
        cancel: &CancellationToken,
        rollback: &mut RollbackComposer,
    ) -> Result<Option<LibvirtTarget>> {
        if config.cloud_provider != CloudProvider::Qemu {
            return Ok(None);
        }
        let qemu = config
            .provider
            .qemu
            .as_ref()
            .ok_or_else(|| Error::config_field("provider.qemu", "QEMU settings missing"))?;
        let target = resolve_libvirt(&qemu.libvirt_socket, current_uid())?;
        if target.start_container {
            self.libvirt
                .start(&config.name, &qemu.libvirt_container_image, cancel)
                .await?;
            rollback.push(Box::new(LibvirtCompensation::new(self.libvirt.clone())));
        }
        Ok(Some(target))
    }

    /// Plan; with changes, show the plan and ask. `false` means declined.
    async fn plan_and_confirm(&self, workspace: &IacWorkspace, cancel: &CancellationToken) -> Result<bool> {
        if !workspace.plan(cancel).await? {
            info!(dir = %workspace.dir().display(), "No infrastructure changes");
            return Ok(true);
        }
        let mut rendered = Vec::new();
        workspace.show_plan(&mut rendered).await?;
        self.confirmer.confirm(&String::from_utf8_lossy(&rendered)).await
    }

    async fn patch_attestation_policy(
        &self,
        variant: AttestationVariant,
        state: &InfraState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if variant != AttestationVariant::AzureSevSnp {
            return Ok(());
        }
        let patcher = self.patcher.as_ref().ok_or_else(|| {
            Error::internal_with_context("patch_attestation_policy", "no policy patcher configured")
        })?;
        let url = state.attestation_url.as_deref().ok_or_else(|| {
            Error::cloud_backend(
                BackendStep::Output,
                CloudProvider::Azure,
                "missing attestationURL output",
            )
        })?;
        patcher.patch(url, cancel).await
    }

    // =========================================================================
    // Upgrade
    // =========================================================================

    /// Move the infrastructure to the image and settings of `config`
    ///
    /// With `check_only` the plan is computed in a throwaway copy and
    /// nothing is applied.
    pub async fn upgrade(
        &self,
        config: &ClusterConfig,
        check_only: bool,
        cancel: &CancellationToken,
    ) -> Result<UpgradeOutcome> {
        config.validate()?;
        let _lock = WorkspaceLock::acquire(&self.root)?;
        let mut id_file = IdFile::load(&self.state_path())?;
        if id_file.cloud_provider != config.cloud_provider {
            return Err(Error::config_field(
                "cloudProvider",
                format!(
                    "cluster runs on {}, config names {}",
                    id_file.cloud_provider, config.cloud_provider
                ),
            ));
        }
        self.ensure_no_pending_upgrade()?;

        let provider = config.cloud_provider;
        let variant = config.attestation_variant();
        let image = config.image_version()?;

        info!("[Phase 1/{}] Fetching measurements for {}", UPGRADE_PHASES, image);
        let measurements = self.measurements.fetch(&image, variant, cancel).await?;
        let policy = self.cluster_policy(&id_file, &measurements)?;

        info!("[Phase 2/{}] Resolving image reference", UPGRADE_PHASES);
        let image_reference = self
            .images
            .fetch_reference(provider, variant, &image, &region_of(config), cancel)
            .await?;
        let libvirt = match &config.provider.qemu {
            Some(qemu) if provider == CloudProvider::Qemu => {
                Some(resolve_libvirt(&qemu.libvirt_socket, current_uid())?)
            }
            _ => None,
        };
        let vars = variables_for(config, &image_reference, libvirt.as_ref())?.render()?;

        let upgrade_id = new_upgrade_id(check_only);
        let upgrade_root = self.root.join(UPGRADE_DIR).join(&upgrade_id);
        info!(
            upgrade_id = %upgrade_id,
            "[Phase 3/{}] Preparing upgrade workspace", UPGRADE_PHASES
        );
        let upgrade = self.cluster_workspace(provider).prepare_upgrade_workspace(
            &template_for(provider),
            &upgrade_root.join(TERRAFORM_UPGRADE_WORKING_DIR),
            &upgrade_root.join(TERRAFORM_UPGRADE_BACKUP_DIR),
            &vars,
        )?;

        let mut outcome = UpgradeOutcome {
            upgrade_id,
            has_diff: false,
            applied: false,
            image,
            image_reference,
            measurements,
            policy,
        };

        if check_only {
            let planned = upgrade.workspace().plan(cancel).await;
            let shown = match &planned {
                Ok(true) => {
                    let mut rendered = Vec::new();
                    upgrade.workspace().show_plan(&mut rendered).await.map(|_| rendered)
                }
                _ => Ok(Vec::new()),
            };
            upgrade.discard()?;
            outcome.has_diff = planned?;
            if outcome.has_diff {
                info!("Planned infrastructure changes:\n{}", String::from_utf8_lossy(&shown?));
            }
            return Ok(outcome);
        }

        let backup = upgrade.backup_dir().to_path_buf();
        match self
            .apply_upgrade(upgrade, variant, &mut id_file, &mut outcome, cancel)
            .await
        {
            Ok(()) => Ok(outcome),
            Err(e) => {
                error!(
                    upgrade_id = %outcome.upgrade_id,
                    backup = %backup.display(),
                    error = %e,
                    "Infrastructure upgrade failed; the backup is kept for inspection"
                );
                Err(e)
            }
        }
    }

    async fn apply_upgrade(
        &self,
        upgrade: UpgradeWorkspace,
        variant: AttestationVariant,
        id_file: &mut IdFile,
        outcome: &mut UpgradeOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("[Phase 4/{}] Planning infrastructure changes", UPGRADE_PHASES);
        outcome.has_diff = upgrade.workspace().plan(cancel).await?;
        if outcome.has_diff {
            let mut rendered = Vec::new();
            upgrade.workspace().show_plan(&mut rendered).await?;
            if !self.confirmer.confirm(&String::from_utf8_lossy(&rendered)).await? {
                upgrade.restore_backup()?;
                return Err(Error::cancelled("upgrade: plan declined"));
            }
        }

        info!("[Phase 5/{}] Applying infrastructure changes", UPGRADE_PHASES);
        let state = upgrade.workspace().apply_cluster(cancel).await?;
        self.patch_attestation_policy(variant, &state, cancel).await?;
        upgrade.promote()?;

        id_file.cluster_endpoint = state.cluster_endpoint;
        id_file.uid = state.uid;
        id_file.init_secret = state.init_secret;
        id_file.attestation_url = state.attestation_url;
        id_file.save(&self.state_path())?;
        outcome.applied = true;
        info!(upgrade_id = %outcome.upgrade_id, "Infrastructure upgraded");
        Ok(())
    }

    /// Policy for `measurements` bound to the identity of the existing cluster
    fn cluster_policy(&self, id_file: &IdFile, measurements: &FetchedMeasurements) -> Result<AttestationPolicy> {
        let key = load_master_secret(&self.master_secret_path())?.ok_or_else(|| {
            Error::config_validation(format!(
                "{} not found; the cluster identity is required for an upgrade",
                self.master_secret_path().display()
            ))
        })?;
        let salt: [u8; 32] = id_file
            .measurement_salt
            .as_deref()
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                Error::config_validation(format!(
                    "{} has no valid measurement salt",
                    self.state_path().display()
                ))
            })?;
        let secret = MasterSecret::from_parts(key, salt);
        AttestationConfigBuilder::new(&measurements.bundle)
            .with_master_secret(&secret)?
            .build()
    }

    /// A backup left behind by an earlier upgrade must be handled manually
    fn ensure_no_pending_upgrade(&self) -> Result<()> {
        let dir = self.root.join(UPGRADE_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io("upgrade", &dir, e)),
        };
        for entry in entries.flatten() {
            let backup = entry.path().join(TERRAFORM_UPGRADE_BACKUP_DIR);
            if backup.exists() {
                return Err(Error::config_validation(format!(
                    "upgrade backup {} exists from an earlier upgrade; inspect and remove it manually",
                    backup.display()
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Tear down the cluster infrastructure and delete the local state
    pub async fn destroy(&self, provider: CloudProvider, cancel: &CancellationToken) -> Result<()> {
        let _lock = WorkspaceLock::acquire(&self.root)?;
        let workspace = self.cluster_workspace(provider);

        info!(provider = %provider, "Destroying cluster infrastructure");
        workspace.destroy(cancel).await?;
        if provider == CloudProvider::Qemu {
            self.libvirt.stop().await?;
        }
        workspace.cleanup_workspace()?;
        remove_file_if_exists(&self.state_path())?;
        remove_file_if_exists(&self.master_secret_path())?;
        info!("Cluster destroyed");
        Ok(())
    }

    // =========================================================================
    // IAM
    // =========================================================================

    /// Create the IAM resources described by `iam`
    pub async fn create_iam(&self, iam: &IamConfig, cancel: &CancellationToken) -> Result<IamOutput> {
        let provider = iam.provider();
        let template = iam_template_for(provider)?;
        let vars = IamVariables::from_config(iam).render()?;
        let _lock = WorkspaceLock::acquire(&self.root)?;

        let workspace = self.iam_workspace(provider);
        workspace.prepare(&template, &vars)?;
        let mut rollback = RollbackComposer::new();
        rollback.push(Box::new(WorkspaceCompensation::new(
            workspace.clone(),
            CancellationToken::new(),
        )));

        let applied = async {
            if !self.plan_and_confirm(&workspace, cancel).await? {
                return Ok(None);
            }
            workspace.apply_iam(cancel).await.map(Some)
        }
        .await;

        match applied {
            Ok(Some(output)) => {
                rollback.commit();
                info!(provider = %provider, "IAM resources created");
                Ok(output)
            }
            Ok(None) => {
                for failure in rollback.run().await {
                    warn!(error = %failure, "Cleanup after declined plan failed");
                }
                Err(Error::cancelled("iam create: plan declined"))
            }
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => Err(rollback.rollback(e).await),
        }
    }

    /// Destroy the IAM resources and their workspace
    pub async fn destroy_iam(&self, provider: CloudProvider, cancel: &CancellationToken) -> Result<()> {
        let _lock = WorkspaceLock::acquire(&self.root)?;
        let workspace = self.iam_workspace(provider);
        workspace.destroy(cancel).await?;
        workspace.cleanup_workspace()?;
        info!(provider = %provider, "IAM resources destroyed");
        Ok(())
    }
}

/// Region used to narrow image lookups (AMIs are regional)
fn region_of(config: &ClusterConfig) -> String {
    config
        .provider
        .aws
        .as_ref()
        .map(|aws| aws.region.clone())
        .unwrap_or_default()
}
