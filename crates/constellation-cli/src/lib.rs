//! Constellation CLI library

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

pub use constellation_common::{Error, Result};

use commands::Context;

/// Constellation - confidential Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "constellation")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the config, state, and IaC workspaces
    #[arg(
        short = 'w',
        long,
        global = true,
        env = "CONSTELLATION_WORKSPACE",
        default_value = "."
    )]
    pub workspace: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log JSON lines instead of text
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Trust the development signing key and CDN
    #[arg(long, global = true, env = "CONSTELLATION_DEV")]
    pub dev: bool,

    /// Override the CDN base URL
    #[arg(long, global = true)]
    pub cdn_url: Option<String>,

    /// Kubeconfig of the cluster
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Log level of the IaC backend (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "off", value_parser = commands::parse_log_level)]
    pub tf_log: constellation_infra::LogLevel,

    /// IaC binary
    #[arg(long, global = true, env = "CONSTELLATION_TERRAFORM", default_value = "terraform")]
    pub terraform: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the infrastructure of a new cluster
    Create(commands::create::CreateArgs),

    /// Upgrade a cluster to the image and versions in its config
    #[command(subcommand)]
    Upgrade(UpgradeCommands),

    /// Destroy the cluster and delete local cluster state
    Destroy(commands::destroy::DestroyArgs),

    /// Manage the IAM resources a cluster needs
    #[command(subcommand)]
    Iam(IamCommands),

    /// Work with the cluster configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum UpgradeCommands {
    /// Apply an upgrade
    Apply(commands::upgrade::ApplyArgs),
    /// Show what an upgrade would change without applying it
    Check(commands::upgrade::CheckArgs),
}

#[derive(Subcommand, Debug)]
pub enum IamCommands {
    /// Create IAM resources
    Create(commands::iam::CreateArgs),
    /// Destroy IAM resources
    Destroy(commands::iam::DestroyArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Fetch and verify the measurements of the configured image
    FetchMeasurements(commands::config::FetchMeasurementsArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let ctx = Context::new(self.global);
        match self.command {
            Commands::Create(args) => commands::create::run(&ctx, args, &cancel).await,
            Commands::Upgrade(UpgradeCommands::Apply(args)) => {
                commands::upgrade::apply(&ctx, args, &cancel).await
            }
            Commands::Upgrade(UpgradeCommands::Check(args)) => {
                commands::upgrade::check(&ctx, args, &cancel).await
            }
            Commands::Destroy(args) => commands::destroy::run(&ctx, args, &cancel).await,
            Commands::Iam(IamCommands::Create(args)) => {
                commands::iam::create(&ctx, args, &cancel).await
            }
            Commands::Iam(IamCommands::Destroy(args)) => {
                commands::iam::destroy(&ctx, args, &cancel).await
            }
            Commands::Config(ConfigCommands::FetchMeasurements(args)) => {
                commands::config::fetch_measurements(&ctx, args, &cancel).await
            }
        }
    }
}
