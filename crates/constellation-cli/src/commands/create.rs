//! Create command - provision the infrastructure of a new cluster

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use constellation_common::{Result, STATE_FILENAME};

use super::{azure_secure_boot, Context, KubeHandoff};

/// Create a cluster from the config file
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Cluster config, relative to the workspace
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,
}

pub async fn run(ctx: &Context, args: CreateArgs, cancel: &CancellationToken) -> Result<()> {
    let config = ctx.load_config(args.config_file.as_deref())?;

    let mut orchestrator = ctx.orchestrator(azure_secure_boot(&config))?;
    match ctx.kubeconfig() {
        Some(kubeconfig) => {
            orchestrator = orchestrator.with_handoff(Arc::new(KubeHandoff::new(kubeconfig)));
        }
        None => info!("No kubeconfig given, the join configuration is written on init"),
    }

    let outcome = orchestrator.create(&config, cancel).await?;

    println!("Your Constellation cluster was created successfully.");
    println!("  Cloud provider:  {}", outcome.id_file.cloud_provider);
    println!("  Endpoint:        {}", outcome.state.cluster_endpoint);
    println!("  UID:             {}", outcome.state.uid);
    if let Some(owner_id) = &outcome.id_file.owner_id {
        println!("  Owner ID:        {}", owner_id);
    }
    if let Some(cluster_id) = &outcome.id_file.cluster_id {
        println!("  Cluster ID:      {}", cluster_id);
    }
    if let Some(url) = &outcome.state.attestation_url {
        println!("  Attestation URL: {}", url);
    }
    println!(
        "Cluster identity written to {}",
        ctx.workspace().join(STATE_FILENAME).display()
    );
    Ok(())
}
