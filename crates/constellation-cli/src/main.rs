//! Constellation CLI
//!
//! Creates, upgrades, and destroys confidential Kubernetes clusters.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use constellation_cli::Cli;
use constellation_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut telemetry = if cli.global.debug {
        TelemetryConfig::debug()
    } else {
        TelemetryConfig::default()
    };
    telemetry.json = cli.global.log_json;
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the running operation");
            on_interrupt.cancel();
        }
    });

    match cli.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = ?e.kind(), "{}", e);
            if let Some((first, rest)) = e.members().split_first() {
                eprintln!("Error: {}", first);
                for other in rest {
                    eprintln!("  also: {}", other);
                }
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
