//! IAM commands - identities and permissions a cluster runs with

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;

use constellation_common::config::IamConfig;
use constellation_common::{CloudProvider, Error, Result};
use constellation_infra::IamOutput;

use super::{prompt, Context};

/// Create IAM resources
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// YAML description of the IAM resources, relative to the workspace
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,
}

/// Destroy IAM resources
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Provider the IAM resources were created on
    #[arg(long)]
    pub provider: CloudProvider,
}

/// Parse an IAM description
pub fn parse_iam_config(raw: &str) -> Result<IamConfig> {
    serde_yaml::from_str(raw)
        .map_err(|e| Error::config_validation(format!("parsing IAM config: {}", e)))
}

fn print_output(output: &IamOutput) {
    println!("Your IAM configuration was created successfully.");
    match output {
        IamOutput::Aws {
            control_plane_instance_profile,
            worker_nodes_instance_profile,
        } => {
            println!("  Control plane instance profile: {}", control_plane_instance_profile);
            println!("  Worker nodes instance profile:  {}", worker_nodes_instance_profile);
        }
        IamOutput::Azure {
            subscription_id,
            tenant_id,
            uami_id,
        } => {
            println!("  Subscription:                   {}", subscription_id);
            println!("  Tenant:                         {}", tenant_id);
            println!("  User assigned identity:         {}", uami_id);
        }
        IamOutput::Gcp { .. } => {
            println!("  Service account key: stored in the IAM workspace outputs");
        }
    }
}

pub async fn create(ctx: &Context, args: CreateArgs, cancel: &CancellationToken) -> Result<()> {
    let path = ctx.resolve(&args.file);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::config_validation(format!("reading {}: {}", path.display(), e)))?;
    let iam = parse_iam_config(&raw)?;

    let output = ctx.orchestrator(None)?.create_iam(&iam, cancel).await?;
    print_output(&output);
    Ok(())
}

pub async fn destroy(ctx: &Context, args: DestroyArgs, cancel: &CancellationToken) -> Result<()> {
    if !args.provider.supports_iam() {
        return Err(Error::config_field(
            "provider",
            format!("{} has no IAM resources", args.provider),
        ));
    }
    if !ctx.assume_yes()
        && !prompt(&format!("Destroy the {} IAM resources?", args.provider)).await?
    {
        return Err(Error::cancelled("iam destroy: not confirmed"));
    }
    ctx.orchestrator(None)?
        .destroy_iam(args.provider, cancel)
        .await?;
    println!("Your IAM configuration was deleted successfully.");
    Ok(())
}
