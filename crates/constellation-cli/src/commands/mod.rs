//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use constellation_attestation::{
    build_http_client, AttestationPolicy, MeasurementFetcher, ReqwestGetter, RekorClient,
    TrustAnchors,
};
use constellation_cluster::{create_client, provision_join_config, KubeClusterStore};
use constellation_common::config::ClusterConfig;
use constellation_common::rollback::Compensation;
use constellation_common::{
    CloudProvider, Error, Result, CONFIG_FILENAME, CONSTELLATION_NAMESPACE,
};
use constellation_infra::policy_patcher::azure_guest_policy;
use constellation_infra::{
    AzureCliTokenProvider, AzurePolicyPatcher, ClusterHandoff, ImageFetcher, InfraOrchestrator,
    InfraState, LogLevel, PlanConfirmer, ReqwestPolicyEndpoint, TerraformCli,
};

use crate::GlobalArgs;

pub mod config;
pub mod create;
pub mod destroy;
pub mod iam;
pub mod upgrade;

/// Kubeconfig written next to the state file once a cluster is initialized
pub const ADMIN_CONF_FILENAME: &str = "constellation-admin.conf";

/// Log file of the IaC backend inside the workspace
pub const TERRAFORM_LOG_FILENAME: &str = "terraform.log";

/// clap value parser for `--tf-log`
pub fn parse_log_level(s: &str) -> std::result::Result<LogLevel, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Secure boot setting selecting the policy of a new Azure attestation provider
pub(crate) fn azure_secure_boot(config: &ClusterConfig) -> Option<bool> {
    match config.cloud_provider {
        CloudProvider::Azure => config.provider.azure.as_ref().map(|a| a.secure_boot),
        _ => None,
    }
}

/// Resolved global flags
pub struct Context {
    args: GlobalArgs,
}

impl Context {
    /// Context for one CLI invocation
    pub fn new(args: GlobalArgs) -> Self {
        Self { args }
    }

    /// Workspace root
    pub fn workspace(&self) -> &Path {
        &self.args.workspace
    }

    /// Whether prompts are answered automatically
    pub fn assume_yes(&self) -> bool {
        self.args.yes
    }

    /// `path` relative to the workspace unless absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.args.workspace.join(path)
        }
    }

    /// Load the cluster config, by default `constellation-conf.yaml`
    pub fn load_config(&self, path: Option<&Path>) -> Result<ClusterConfig> {
        let path = self.resolve(path.unwrap_or(Path::new(CONFIG_FILENAME)));
        debug!(path = %path.display(), "Loading cluster config");
        ClusterConfig::load(&path)
    }

    /// Explicit `--kubeconfig`, else the admin config in the workspace if present
    pub fn kubeconfig(&self) -> Option<PathBuf> {
        if let Some(path) = &self.args.kubeconfig {
            return Some(self.resolve(path));
        }
        let admin = self.args.workspace.join(ADMIN_CONF_FILENAME);
        admin.exists().then_some(admin)
    }

    /// Signing keys, transparency log, and CDN to trust
    pub fn trust_anchors(&self) -> Result<TrustAnchors> {
        let mut anchors = if self.args.dev || constellation_common::dev_mode_enabled() {
            info!("Using development signing key");
            TrustAnchors::development()?
        } else {
            TrustAnchors::production()?
        };
        if let Some(url) = &self.args.cdn_url {
            anchors.cdn_url = url.trim_end_matches('/').to_string();
        }
        Ok(anchors)
    }

    /// Local cache of verified measurement documents and image overrides
    pub fn cache_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("constellation"))
            .unwrap_or_else(|| self.args.workspace.join(".constellation-cache"))
    }

    /// Fetcher for signed measurement documents
    pub fn measurement_fetcher(&self, http: &reqwest::Client) -> Result<MeasurementFetcher> {
        let anchors = self.trust_anchors()?;
        let log = RekorClient::new(anchors.log_url.clone(), http.clone());
        Ok(MeasurementFetcher::new(
            Arc::new(ReqwestGetter::new(http.clone())),
            Arc::new(log),
            anchors,
            self.cache_dir(),
        ))
    }

    /// Orchestrator over the workspace
    ///
    /// `azure_secure_boot` selects the attestation policy written to a new
    /// Azure attestation provider.
    pub fn orchestrator(&self, azure_secure_boot: Option<bool>) -> Result<InfraOrchestrator> {
        let http = build_http_client()?;
        let anchors = self.trust_anchors()?;

        let mut backend = TerraformCli::new(&self.args.terraform);
        if self.args.tf_log != LogLevel::Off {
            backend = backend.with_log(
                self.args.tf_log,
                self.args.workspace.join(TERRAFORM_LOG_FILENAME),
            );
        }
        let images = ImageFetcher::new(
            Arc::new(ReqwestGetter::new(http.clone())),
            anchors.cdn_url.clone(),
            self.cache_dir(),
        );

        let mut orchestrator = InfraOrchestrator::new(
            self.args.workspace.clone(),
            Arc::new(backend),
            Arc::new(self.measurement_fetcher(&http)?),
            Arc::new(images),
        )
        .with_confirmer(Arc::new(StdinConfirmer {
            assume_yes: self.args.yes,
        }));

        if let Some(secure_boot) = azure_secure_boot {
            orchestrator = orchestrator.with_policy_patcher(Arc::new(AzurePolicyPatcher::new(
                Arc::new(AzureCliTokenProvider),
                Arc::new(ReqwestPolicyEndpoint::new(http)),
                azure_guest_policy(secure_boot),
            )));
        }
        Ok(orchestrator)
    }

    /// Object store of the cluster behind the kubeconfig
    pub async fn cluster_store(&self) -> Result<Arc<KubeClusterStore>> {
        let kubeconfig = self.kubeconfig();
        let client = create_client(kubeconfig.as_deref()).await?;
        Ok(Arc::new(KubeClusterStore::new(client, CONSTELLATION_NAMESPACE)))
    }
}

/// Ask a yes/no question on the terminal
pub async fn prompt(question: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{} [y/N]: ", question).as_bytes())
        .await
        .map_err(|e| Error::internal_with_context("prompt", e.to_string()))?;
    stdout
        .flush()
        .await
        .map_err(|e| Error::internal_with_context("prompt", e.to_string()))?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| Error::internal_with_context("prompt", e.to_string()))?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Prints plans and asks on stdin before applying them
pub struct StdinConfirmer {
    assume_yes: bool,
}

#[async_trait]
impl PlanConfirmer for StdinConfirmer {
    async fn confirm(&self, plan: &str) -> Result<bool> {
        println!("{}", plan);
        if self.assume_yes {
            return Ok(true);
        }
        prompt("Do you want to apply these changes?").await
    }
}

/// Writes the join configuration into the new cluster
pub struct KubeHandoff {
    kubeconfig: PathBuf,
}

impl KubeHandoff {
    /// Handoff through `kubeconfig`
    pub fn new(kubeconfig: PathBuf) -> Self {
        Self { kubeconfig }
    }
}

#[async_trait]
impl ClusterHandoff for KubeHandoff {
    async fn provision(
        &self,
        state: &InfraState,
        policy: &AttestationPolicy,
        measurement_salt: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn Compensation>>> {
        info!(endpoint = %state.cluster_endpoint, "Writing join configuration");
        let provision = async {
            let client = create_client(Some(self.kubeconfig.as_path())).await?;
            let store = Arc::new(KubeClusterStore::new(client, CONSTELLATION_NAMESPACE));
            provision_join_config(store, policy, measurement_salt).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled("provision join config")),
            undo = provision => Ok(Some(Box::new(undo?) as Box<dyn Compensation>)),
        }
    }
}
