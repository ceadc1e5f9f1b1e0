//! Destroy command - tear down the cluster and remove its local state

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use constellation_common::state::IdFile;
use constellation_common::{CloudProvider, Error, Result, STATE_FILENAME};

use super::{prompt, Context};

/// Destroy the cluster of the workspace
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Cluster config, consulted when the state file is gone
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,
}

fn provider_of(ctx: &Context, args: &DestroyArgs) -> Result<CloudProvider> {
    let state = ctx.workspace().join(STATE_FILENAME);
    if state.exists() {
        return Ok(IdFile::load(&state)?.cloud_provider);
    }
    debug!(path = %state.display(), "No state file, reading provider from config");
    Ok(ctx.load_config(args.config_file.as_deref())?.cloud_provider)
}

pub async fn run(ctx: &Context, args: DestroyArgs, cancel: &CancellationToken) -> Result<()> {
    let provider = provider_of(ctx, &args)?;
    if !ctx.assume_yes()
        && !prompt(&format!(
            "This destroys the {} cluster in {} and all its data. Continue?",
            provider,
            ctx.workspace().display()
        ))
        .await?
    {
        return Err(Error::cancelled("destroy: not confirmed"));
    }

    ctx.orchestrator(None)?.destroy(provider, cancel).await?;
    println!("Your Constellation cluster was terminated successfully.");
    Ok(())
}
