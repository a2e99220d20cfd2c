//! Command-line interface definitions for `athenz-sidecar`.

use std::path::PathBuf;

use clap::Parser;

/// Athenz client sidecar - credential broker for a co-located application
///
/// Acquires, caches and refreshes N-Tokens, role tokens, access tokens and
/// the service certificate from Athenz, and serves them over a loopback
/// HTTP(S) API.
#[derive(Parser, Debug)]
#[command(name = "athenz-sidecar", disable_version_flag = true)]
pub struct Cli {
    /// Path to the sidecar configuration file (YAML)
    #[arg(
        short = 'f',
        long = "config",
        default_value = "/etc/athenz/client/config.yaml"
    )]
    pub config: PathBuf,

    /// Print the build version and config-schema version, then exit
    #[arg(long = "version")]
    pub show_version: bool,
}
