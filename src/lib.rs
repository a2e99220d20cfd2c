//! Athenz Client Sidecar
//!
//! Out-of-process authentication sidecar that brokers an application's
//! access to an Athenz identity provider. It acquires, caches, refreshes
//! and serves four kinds of credentials over a loopback HTTP(S) API:
//!
//! - **N-Token**: a self-signed, time-bounded principal assertion
//! - **Role tokens**: short-lived bearer credentials scoped to roles
//! - **Access tokens**: OAuth2-style bearer credentials
//! - **Service certificate**: an X.509 leaf issued against a CSR
//!
//! A credential-injecting reverse proxy can additionally forward
//! arbitrary requests with a freshly minted principal or role token
//! attached.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod proxy;
pub mod server;
pub mod singleflight;
pub mod svccert;
pub mod tls;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration schema version understood by this build
pub const CONFIG_VERSION: &str = "v2.0.0";

/// Setup tracing/logging
///
/// An empty `level` disables log output entirely, mirroring the
/// configuration contract of `log.level`.
pub fn setup_tracing(level: &str, color: bool) -> Result<()> {
    let directive = if level.is_empty() { "off" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(color))
        .init();

    Ok(())
}
