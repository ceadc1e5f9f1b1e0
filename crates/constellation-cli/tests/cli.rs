//! Command line surface and exit codes

use std::path::PathBuf;

use clap::Parser;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use constellation_cli::commands::iam::parse_iam_config;
use constellation_cli::{Cli, Commands, ConfigCommands, IamCommands, UpgradeCommands};
use constellation_common::config::IamConfig;
use constellation_common::CloudProvider;
use constellation_infra::LogLevel;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("constellation").chain(args.iter().copied())).unwrap()
}

// =============================================================================
// Argument parsing
// =============================================================================

#[test]
fn create_uses_workspace_defaults() {
    let cli = parse(&["create"]);
    assert_eq!(cli.global.workspace, PathBuf::from("."));
    assert_eq!(cli.global.tf_log, LogLevel::Off);
    assert!(!cli.global.yes);
    match cli.command {
        Commands::Create(args) => assert!(args.config_file.is_none()),
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = parse(&[
        "upgrade", "apply", "--force", "-w", "/tmp/cluster", "--yes", "--tf-log", "debug",
    ]);
    assert_eq!(cli.global.workspace, PathBuf::from("/tmp/cluster"));
    assert!(cli.global.yes);
    assert_eq!(cli.global.tf_log, LogLevel::Debug);
    match cli.command {
        Commands::Upgrade(UpgradeCommands::Apply(args)) => assert!(args.force),
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn upgrade_check_takes_a_config_path() {
    let cli = parse(&["upgrade", "check", "-f", "other-conf.yaml"]);
    match cli.command {
        Commands::Upgrade(UpgradeCommands::Check(args)) => {
            assert_eq!(args.config_file, Some(PathBuf::from("other-conf.yaml")))
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn unknown_tf_log_level_is_rejected() {
    assert!(Cli::try_parse_from(["constellation", "destroy", "--tf-log", "loud"]).is_err());
}

#[test]
fn iam_destroy_parses_the_provider() {
    let cli = parse(&["iam", "destroy", "--provider", "Azure"]);
    match cli.command {
        Commands::Iam(IamCommands::Destroy(args)) => {
            assert_eq!(args.provider, CloudProvider::Azure)
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(Cli::try_parse_from(["constellation", "iam", "destroy", "--provider", "mars"]).is_err());
}

#[test]
fn fetch_measurements_accepts_an_output_file() {
    let cli = parse(&["config", "fetch-measurements", "-o", "measurements.json", "--dev"]);
    assert!(cli.global.dev);
    match cli.command {
        Commands::Config(ConfigCommands::FetchMeasurements(args)) => {
            assert_eq!(args.output, Some(PathBuf::from("measurements.json")))
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn iam_config_is_read_from_yaml() {
    let iam = parse_iam_config(
        "provider: gcp\nproject_id: proj\nregion: europe-west3\nzone: europe-west3-b\nservice_account_id: constell\n",
    )
    .unwrap();
    assert_eq!(iam.provider(), CloudProvider::Gcp);
    assert!(matches!(iam, IamConfig::Gcp { ref zone, .. } if zone == "europe-west3-b"));

    let err = parse_iam_config("provider: qemu\n").unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

// =============================================================================
// Exit codes
// =============================================================================

#[tokio::test]
async fn destroy_without_state_or_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().to_str().unwrap();
    let cli = parse(&["destroy", "--yes", "-w", workspace]);

    let err = cli.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn iam_destroy_on_qemu_is_rejected() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().to_str().unwrap();
    let cli = parse(&["iam", "destroy", "--provider", "qemu", "--yes", "-w", workspace]);

    let err = cli.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn upgrade_without_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().to_str().unwrap();
    let cli = parse(&["upgrade", "apply", "-w", workspace]);

    let err = cli.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
