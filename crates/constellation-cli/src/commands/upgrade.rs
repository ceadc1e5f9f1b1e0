//! Upgrade commands
//!
//! `apply` checks the cluster's upgrade preconditions, moves the
//! infrastructure, then converges the join configuration and asks the node
//! operator for the new versions. `check` only plans the infrastructure
//! change in a throwaway workspace.

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use constellation_cluster::{default_components, ClusterStore, DesiredVersions, UpgradeCoordinator};
use constellation_common::version::{check_kubernetes_upgrade, check_upgrade};
use constellation_common::Result;

use super::{azure_secure_boot, Context};

/// Apply an upgrade
#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Cluster config, relative to the workspace
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Upgrade even if a previous upgrade is still running or the version
    /// rules reject the request
    #[arg(long)]
    pub force: bool,
}

/// Check an upgrade
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Cluster config, relative to the workspace
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,
}

pub async fn apply(ctx: &Context, args: ApplyArgs, cancel: &CancellationToken) -> Result<()> {
    let config = ctx.load_config(args.config_file.as_deref())?;
    let image = config.image_version()?;
    let coordinator = UpgradeCoordinator::new(ctx.cluster_store().await?);

    info!("[Phase 1/3] Checking cluster state");
    for skipped in coordinator
        .preflight(image.version(), &config.kubernetes_version, args.force)
        .await?
    {
        println!("Will skip: {}", skipped);
    }

    info!("[Phase 2/3] Upgrading infrastructure");
    let orchestrator = ctx.orchestrator(azure_secure_boot(&config))?;
    let outcome = orchestrator.upgrade(&config, false, cancel).await?;
    if outcome.has_diff {
        println!("Infrastructure upgraded ({})", outcome.upgrade_id);
    } else {
        println!("Infrastructure is up to date");
    }

    info!("[Phase 3/3] Updating attestation config and requesting node upgrade");
    let desired = DesiredVersions {
        image_reference: outcome.image_reference.clone(),
        image_version: outcome.image.version().to_string(),
        kubernetes_version: config.kubernetes_version.clone(),
        kubernetes_components: default_components(&config.kubernetes_version),
    };
    let (policy_changed, report) = coordinator
        .converge(&outcome.policy, &desired, args.force, cancel)
        .await?;
    if policy_changed {
        println!("Attestation config updated for {}", outcome.image);
    }
    for skipped in &report.skipped {
        warn!(error = %skipped, "Part of the upgrade was skipped");
        println!("Skipped: {}", skipped);
    }
    if report.image_updated {
        println!("Nodes are upgrading to image {}", desired.image_version);
    }
    if report.kubernetes_updated {
        println!("Nodes are upgrading to Kubernetes {}", desired.kubernetes_version);
    }
    Ok(())
}

pub async fn check(ctx: &Context, args: CheckArgs, cancel: &CancellationToken) -> Result<()> {
    let config = ctx.load_config(args.config_file.as_deref())?;
    let orchestrator = ctx.orchestrator(azure_secure_boot(&config))?;

    let outcome = orchestrator.upgrade(&config, true, cancel).await?;
    println!("Target image:         {}", outcome.image);
    println!("Image reference:      {}", outcome.image_reference);
    println!(
        "Measurements digest:  {}",
        outcome.measurements.document_sha256
    );
    println!(
        "Infrastructure:       {}",
        if outcome.has_diff {
            "changes pending"
        } else {
            "up to date"
        }
    );

    if ctx.kubeconfig().is_none() {
        return Ok(());
    }
    let store = ctx.cluster_store().await?;
    let current = store.get_node_version().await?;
    let verdict = |check: Result<()>| match check {
        Ok(()) => "upgrade possible".to_string(),
        Err(e) => e.to_string(),
    };
    println!(
        "Image:      {} -> {} ({})",
        current.spec.image_version,
        outcome.image.version(),
        verdict(check_upgrade(
            "image",
            &current.spec.image_version,
            outcome.image.version()
        ))
    );
    println!(
        "Kubernetes: {} -> {} ({})",
        current.spec.kubernetes_cluster_version,
        config.kubernetes_version,
        verdict(check_kubernetes_upgrade(
            &current.spec.kubernetes_cluster_version,
            &config.kubernetes_version
        ))
    );
    if current.upgrade_in_progress() {
        println!("An upgrade is still in progress");
    }
    Ok(())
}
