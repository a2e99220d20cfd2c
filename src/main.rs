//! athenz-sidecar entry point

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use athenz_sidecar::{CONFIG_VERSION, cli::Cli, config::Config, daemon::Daemon, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.show_version {
        println!("athenz-sidecar version -> {}", env!("CARGO_PKG_VERSION"));
        println!("athenz-sidecar config version -> {CONFIG_VERSION}");
        return ExitCode::SUCCESS;
    }

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_tracing(&cfg.log.level, cfg.log.color) {
        eprintln!("failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = cfg.check_version() {
        error!(error = %e, found = %cfg.version, expected = %CONFIG_VERSION, "refusing to start");
        return ExitCode::FAILURE;
    }

    let daemon = match Daemon::new(cfg) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize sidecar");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run().await {
        Ok(()) => {
            info!("sidecar shutdown success");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "sidecar terminated with error");
            ExitCode::FAILURE
        }
    }
}
