//! Configuration management
//!
//! Loads the sidecar YAML configuration and resolves `_NAME_`-style
//! environment indirection. Every recognized key deserializes into the
//! structs below; unknown keys are ignored so configs can carry
//! deployment-tool annotations.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Configuration schema version (must match the build's schema version)
    pub version: String,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// N-Token provider configuration
    pub ntoken: NTokenConfig,
    /// Access-token cache configuration
    pub access_token: AccessTokenConfig,
    /// Role-token cache configuration
    pub role_token: RoleTokenConfig,
    /// Service-certificate manager configuration
    pub service_cert: ServiceCertConfig,
    /// Reverse-proxy configuration
    pub proxy: ProxyConfig,
    /// Logging configuration
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not deserialize
    /// into the recognized schema.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        Figment::new()
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Verify the loaded schema version matches this build.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfigVersion` on mismatch.
    pub fn check_version(&self) -> Result<()> {
        if self.version == crate::CONFIG_VERSION {
            Ok(())
        } else {
            Err(Error::InvalidConfigVersion)
        }
    }
}

/// Resolve `_NAME_`-style values from the environment.
///
/// A value of the exact form `_NAME_` is replaced by the contents of the
/// environment variable `NAME` (empty when unset). Anything else is
/// returned unchanged, so the function is idempotent for plain values.
#[must_use]
pub fn actual_value(value: &str) -> String {
    if value.len() > 2 && value.starts_with('_') && value.ends_with('_') {
        env::var(&value[1..value.len() - 1]).unwrap_or_default()
    } else {
        value.to_string()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,
    /// Port to listen on
    pub port: u16,
    /// Per-handler timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Delay before graceful shutdown begins (lets LB health checks drain)
    #[serde(with = "duration_serde")]
    pub shutdown_delay: Duration,
    /// Graceful shutdown deadline
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
    /// Server TLS configuration
    pub tls: TlsConfig,
    /// Health-check server configuration
    pub health_check: HealthCheckConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8081,
            timeout: Duration::from_secs(10),
            shutdown_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            tls: TlsConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Server TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
    /// Serve the API over TLS
    pub enable: bool,
    /// Server certificate path (PEM)
    pub cert_path: String,
    /// Server key path (PEM)
    pub key_path: String,
    /// Client CA bundle path; when set, client certificates are required
    pub ca_path: String,
}

/// Health-check server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Address to bind the health-check server to
    pub address: String,
    /// Health-check port (separate from the API port)
    pub port: u16,
    /// Health-check endpoint path
    pub endpoint: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 6082,
            endpoint: "/healthz".to_string(),
        }
    }
}

/// N-Token provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NTokenConfig {
    /// Enable the N-Token provider (required by every other credential)
    pub enable: bool,
    /// Athenz domain of the principal
    pub athenz_domain: String,
    /// Service name of the principal
    pub service_name: String,
    /// Path to the service private key (PEM)
    pub private_key_path: String,
    /// Key version registered with the IDP
    pub key_version: String,
    /// Verify each freshly signed token before publishing it
    pub validate: bool,
    /// Re-sign cadence
    #[serde(with = "duration_serde")]
    pub refresh_period: Duration,
    /// When set, read the token from this file instead of signing
    pub existing_token_path: String,
}

impl Default for NTokenConfig {
    fn default() -> Self {
        Self {
            enable: false,
            athenz_domain: String::new(),
            service_name: String::new(),
            private_key_path: String::new(),
            key_version: "v1.0".to_string(),
            validate: false,
            refresh_period: Duration::from_secs(30 * 60),
            existing_token_path: String::new(),
        }
    }
}

/// Retry policy for upstream credential fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum attempts per fetch (minimum 1)
    pub attempts: u32,
    /// Fixed delay between attempts
    #[serde(with = "duration_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Access-token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessTokenConfig {
    /// Enable the access-token endpoint and refresher
    pub enable: bool,
    /// Base URL of the IDP token API
    #[serde(rename = "athenzURL")]
    pub athenz_url: String,
    /// Client certificate presented to the IDP (mTLS mode, optional)
    pub cert_path: String,
    /// CA bundle used to verify the IDP (optional)
    #[serde(rename = "athenzCAPath")]
    pub athenz_ca_path: String,
    /// Proactive refresh cadence
    #[serde(with = "duration_serde")]
    pub refresh_period: Duration,
    /// Default requested token lifetime
    #[serde(with = "duration_serde")]
    pub expiry: Duration,
    /// Retry policy
    pub retry: RetryConfig,
}

impl Default for AccessTokenConfig {
    fn default() -> Self {
        Self {
            enable: false,
            athenz_url: String::new(),
            cert_path: String::new(),
            athenz_ca_path: String::new(),
            refresh_period: Duration::from_secs(30 * 60),
            expiry: Duration::ZERO,
            retry: RetryConfig::default(),
        }
    }
}

/// Role-token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoleTokenConfig {
    /// Enable the role-token endpoint and refresher
    pub enable: bool,
    /// Base URL of the IDP role-token API
    #[serde(rename = "athenzURL")]
    pub athenz_url: String,
    /// CA bundle used to verify the IDP (optional)
    #[serde(rename = "athenzCAPath")]
    pub athenz_ca_path: String,
    /// Proactive refresh cadence
    #[serde(with = "duration_serde")]
    pub refresh_period: Duration,
    /// Default requested token lifetime
    #[serde(with = "duration_serde")]
    pub expiry: Duration,
    /// Retry policy
    pub retry: RetryConfig,
}

impl Default for RoleTokenConfig {
    fn default() -> Self {
        Self {
            enable: false,
            athenz_url: String::new(),
            athenz_ca_path: String::new(),
            refresh_period: Duration::from_secs(30 * 60),
            expiry: Duration::ZERO,
            retry: RetryConfig::default(),
        }
    }
}

/// Service-certificate manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceCertConfig {
    /// Enable the service-certificate endpoint and refresher
    pub enable: bool,
    /// Base URL of the IDP instance API
    #[serde(rename = "athenzURL")]
    pub athenz_url: String,
    /// CA bundle used to verify the IDP (optional)
    #[serde(rename = "athenzCAPath")]
    pub athenz_ca_path: String,
    /// DNS suffix for the certificate SAN
    pub dns_suffix: String,
    /// Proactive refresh cadence
    #[serde(with = "duration_serde")]
    pub refresh_period: Duration,
    /// Requested certificate lifetime (sent to the IDP in minutes)
    #[serde(with = "duration_serde")]
    pub expiry: Duration,
    /// Margin before `NotAfter` at which the cached cert counts as expiring
    #[serde(with = "duration_serde")]
    pub expiry_margin: Duration,
    /// Append the CA bundle to the served PEM
    pub intermediate_cert: bool,
    /// Add a SPIFFE URI SAN to the CSR
    pub spiffe: bool,
    /// CSR subject fields
    pub subject: SubjectConfig,
    /// Header carrying the N-Token toward the IDP
    pub principal_auth_header: String,
}

impl Default for ServiceCertConfig {
    fn default() -> Self {
        Self {
            enable: false,
            athenz_url: String::new(),
            athenz_ca_path: String::new(),
            dns_suffix: String::new(),
            refresh_period: Duration::from_secs(60 * 60),
            expiry: Duration::ZERO,
            expiry_margin: Duration::from_secs(60 * 60),
            intermediate_cert: false,
            spiffe: false,
            subject: SubjectConfig::default(),
            principal_auth_header: "Athenz-Principal-Auth".to_string(),
        }
    }
}

/// CSR subject fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubjectConfig {
    /// Country (C)
    pub country: String,
    /// Province (ST)
    pub province: String,
    /// Organization (O)
    pub organization: String,
    /// Organizational unit (OU)
    pub organizational_unit: String,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            province: String::new(),
            organization: String::new(),
            organizational_unit: "Athenz".to_string(),
        }
    }
}

/// Reverse-proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Enable the proxy endpoints
    pub enable: bool,
    /// Header carrying the N-Token on forwarded requests
    pub principal_auth_header: String,
    /// Header carrying the role token on forwarded requests
    pub role_auth_header: String,
    /// Streaming copy buffer size in bytes
    pub buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            principal_auth_header: "Athenz-Principal-Auth".to_string(),
            role_auth_header: "Athenz-Role-Auth".to_string(),
            buffer_size: 4096,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Minimum log level (empty disables logging)
    pub level: String,
    /// Colorize log output
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            color: false,
        }
    }
}

/// Human-readable duration serde (`100ms`, `10s`, `30m`, `1000h`, `10d`)
pub mod duration_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a duration as integer seconds with an `s` suffix
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a duration string; a bare number means seconds
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a human-readable duration string
    pub fn parse(s: &str) -> Result<Duration, String> {
        let parse_u64 =
            |v: &str| v.parse::<u64>().map_err(|e| format!("invalid duration '{s}': {e}"));

        // "ms" must be tried before the single-letter suffixes: stripping
        // 's' from "100ms" would leave "100m".
        if let Some(ms) = s.strip_suffix("ms") {
            parse_u64(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse_u64(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse_u64(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse_u64(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            parse_u64(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            parse_u64(s).map(Duration::from_secs)
        }
    }
}
