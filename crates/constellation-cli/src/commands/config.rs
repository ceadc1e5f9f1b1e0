//! Config commands

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use constellation_attestation::{build_http_client, AttestationPolicy};
use constellation_common::fs::atomic_write;
use constellation_common::Result;

use super::Context;

/// Fetch measurements of the configured image
#[derive(Args, Debug)]
pub struct FetchMeasurementsArgs {
    /// Cluster config, relative to the workspace
    #[arg(short = 'f', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Write the measurements here instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

pub async fn fetch_measurements(
    ctx: &Context,
    args: FetchMeasurementsArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = ctx.load_config(args.config_file.as_deref())?;
    let image = config.image_version()?;
    let variant = config.attestation_variant();

    let fetcher = ctx.measurement_fetcher(&build_http_client()?)?;
    let fetched = fetcher.fetch(&image, variant, cancel).await?;
    info!(
        image = %image,
        variant = %variant,
        sha256 = %fetched.document_sha256,
        from_cache = fetched.from_cache,
        "Measurements verified"
    );

    let json = AttestationPolicy::from_bundle(&fetched.bundle).to_json()?;
    match args.output {
        Some(path) => {
            let path = ctx.resolve(&path);
            atomic_write(&path, json.as_bytes())?;
            println!("Measurements for {} written to {}", image, path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
