//! N-Token provider
//!
//! Builds and periodically re-signs the sidecar's principal token: a
//! three-part `header.claims.signature` string signed with the service's
//! private key. The current token lives in an atomically swappable cell
//! so readers never block the refresher.
//!
//! Two modes exist: signing mode (the default, requires
//! `ntoken.privateKeyPath`) and existing-token mode
//! (`ntoken.existingTokenPath`), where an externally managed token file
//! is re-read on each refresh instead.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair as _, RsaKeyPair};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::TokenProvider;
use crate::config::{NTokenConfig, actual_value};
use crate::{Error, Result};

/// Claims carried by a signed N-Token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NTokenClaims {
    /// Athenz domain
    pub d: String,
    /// Service name
    pub n: String,
    /// Key version
    pub k: String,
    /// Hostname of the signer
    pub h: String,
    /// IP address of the signer
    pub i: String,
    /// Random salt, unique per signing
    pub a: String,
    /// Issue time (Unix seconds)
    pub iat: u64,
    /// Expiration time (Unix seconds)
    pub exp: u64,
}

/// A published token and its expiration instant
#[derive(Debug, Clone)]
pub struct NTokenEntry {
    /// The signed token string
    pub token: String,
    /// Expiration instant of the claims
    pub expiry: SystemTime,
}

enum Mode {
    Sign(Signer),
    File(PathBuf),
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sign(_) => f.write_str("Mode::Sign(..)"),
            Self::File(path) => f.debug_tuple("Mode::File").field(path).finish(),
        }
    }
}

enum Signer {
    Rsa(RsaKeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl Signer {
    /// Parse a PEM private key (PKCS#8 or PKCS#1), RSA or ECDSA P-256.
    fn from_pem(pem: &[u8]) -> Result<Self> {
        let key = rustls_pemfile::private_key(&mut &*pem)
            .map_err(|e| Error::LoadPrivateKey(e.to_string()))?
            .ok_or_else(|| Error::LoadPrivateKey("no private key found".to_string()))?;

        match key {
            rustls::pki_types::PrivateKeyDer::Pkcs8(der) => {
                if let Ok(rsa) = RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()) {
                    return Ok(Self::Rsa(rsa));
                }
                EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                    der.secret_pkcs8_der(),
                    &SystemRandom::new(),
                )
                .map(Self::Ecdsa)
                .map_err(|e| Error::LoadPrivateKey(e.to_string()))
            }
            rustls::pki_types::PrivateKeyDer::Pkcs1(der) => {
                RsaKeyPair::from_der(der.secret_pkcs1_der())
                    .map(Self::Rsa)
                    .map_err(|e| Error::LoadPrivateKey(e.to_string()))
            }
            _ => Err(Error::LoadPrivateKey(
                "unsupported key encoding (use PKCS#8 or PKCS#1)".to_string(),
            )),
        }
    }

    fn alg(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RS256",
            Self::Ecdsa(_) => "ES256",
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        match self {
            Self::Rsa(key) => {
                let mut sig = vec![0u8; key.public().modulus_len()];
                key.sign(&signature::RSA_PKCS1_SHA256, &rng, message, &mut sig)
                    .map_err(|e| Error::Internal(format!("RSA signing failed: {e}")))?;
                Ok(sig)
            }
            Self::Ecdsa(key) => key
                .sign(&rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|e| Error::Internal(format!("ECDSA signing failed: {e}"))),
        }
    }

    fn verify(&self, message: &[u8], sig: &[u8]) -> Result<()> {
        let result = match self {
            Self::Rsa(key) => signature::UnparsedPublicKey::new(
                &signature::RSA_PKCS1_2048_8192_SHA256,
                key.public_key().as_ref(),
            )
            .verify(message, sig),
            Self::Ecdsa(key) => signature::UnparsedPublicKey::new(
                &signature::ECDSA_P256_SHA256_ASN1,
                key.public_key().as_ref(),
            )
            .verify(message, sig),
        };
        result.map_err(|_| Error::Internal("N-Token signature verification failed".to_string()))
    }
}

/// N-Token provider (C1): one writer, many readers.
#[derive(Debug)]
pub struct NTokenProvider {
    domain: String,
    service: String,
    key_version: String,
    validate: bool,
    refresh_period: Duration,
    hostname: String,
    ip: String,
    mode: Mode,
    current: ArcSwapOption<NTokenEntry>,
}

impl NTokenProvider {
    /// Create the provider and sign (or read) the initial token.
    ///
    /// # Errors
    ///
    /// `Error::Disabled` when `ntoken.enable` is off,
    /// `Error::LoadPrivateKey` when the signing key is unreadable,
    /// `Error::InvalidParameter` when domain or service is missing.
    pub fn new(cfg: &NTokenConfig) -> Result<Arc<Self>> {
        if !cfg.enable {
            return Err(Error::Disabled("ntoken"));
        }

        let existing = actual_value(&cfg.existing_token_path);
        let mode = if existing.is_empty() {
            let key_path = actual_value(&cfg.private_key_path);
            let pem = std::fs::read(&key_path)
                .map_err(|e| Error::LoadPrivateKey(format!("{key_path}: {e}")))?;
            Mode::Sign(Signer::from_pem(&pem)?)
        } else {
            Mode::File(PathBuf::from(existing))
        };

        let domain = actual_value(&cfg.athenz_domain);
        let service = actual_value(&cfg.service_name);
        if matches!(mode, Mode::Sign(_)) && (domain.is_empty() || service.is_empty()) {
            return Err(Error::InvalidParameter(
                "ntoken requires athenzDomain and serviceName".to_string(),
            ));
        }

        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let ip = resolve_ip(&hostname);

        let provider = Arc::new(Self {
            domain,
            service,
            key_version: actual_value(&cfg.key_version),
            validate: cfg.validate,
            refresh_period: cfg.refresh_period,
            hostname,
            ip,
            mode,
            current: ArcSwapOption::empty(),
        });

        provider.update()?;
        info!(domain = %provider.domain, service = %provider.service, "N-Token provider initialized");
        Ok(provider)
    }

    /// Current valid N-Token
    ///
    /// # Errors
    ///
    /// `Error::NoToken` until the first successful signing.
    pub fn token(&self) -> Result<String> {
        self.current
            .load()
            .as_ref()
            .map(|e| e.token.clone())
            .ok_or(Error::NoToken)
    }

    /// Expiration instant of the current token, if one is published
    #[must_use]
    pub fn expiry(&self) -> Option<SystemTime> {
        self.current.load().as_ref().map(|e| e.expiry)
    }

    /// Hand out a token-provider closure for the other credential fetchers
    #[must_use]
    pub fn provider(self: &Arc<Self>) -> TokenProvider {
        let me = Arc::clone(self);
        Arc::new(move || me.token())
    }

    /// Re-sign (or re-read) and publish the token.
    ///
    /// On failure the previously published token is retained.
    pub fn update(&self) -> Result<()> {
        let entry = match &self.mode {
            Mode::Sign(signer) => self.sign_token(signer)?,
            Mode::File(path) => {
                let token = std::fs::read_to_string(path)?.trim().to_string();
                if token.is_empty() {
                    return Err(Error::FailedToInitialize(format!(
                        "existing token file {} is empty",
                        path.display()
                    )));
                }
                NTokenEntry {
                    token,
                    // Lifetime of an externally managed token is unknown;
                    // assume it outlives two refresh periods like our own.
                    expiry: SystemTime::now() + self.refresh_period * 2,
                }
            }
        };

        debug!(expiry = ?entry.expiry, "published new N-Token");
        self.current.store(Some(Arc::new(entry)));
        Ok(())
    }

    /// Background re-sign loop; exits on shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        err_tx: mpsc::Sender<Error>,
    ) {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.refresh_period,
            self.refresh_period,
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.update() {
                        warn!(error = %e, "N-Token refresh failed, keeping previous token");
                        let _ = err_tx.send(e).await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("N-Token refresher stopped");
                    break;
                }
            }
        }
    }

    fn sign_token(&self, signer: &Signer) -> Result<NTokenEntry> {
        let now = unix_now();
        let exp = now + self.refresh_period.as_secs() * 2;

        let salt_bytes: [u8; 16] = rand::rng().random();
        let claims = NTokenClaims {
            d: self.domain.clone(),
            n: self.service.clone(),
            k: self.key_version.clone(),
            h: self.hostname.clone(),
            i: self.ip.clone(),
            a: URL_SAFE_NO_PAD.encode(salt_bytes),
            iat: now,
            exp,
        };

        let header = serde_json::json!({
            "alg": signer.alg(),
            "typ": "JWT",
            "kid": self.key_version,
        });

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?),
        );
        let sig = signer.sign(signing_input.as_bytes())?;
        let token = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig));

        if self.validate {
            let verified = self.verify(&token)?;
            if verified != claims {
                return Err(Error::Internal(
                    "freshly signed N-Token failed claim round-trip".to_string(),
                ));
            }
        }

        Ok(NTokenEntry {
            token,
            expiry: UNIX_EPOCH + Duration::from_secs(exp),
        })
    }

    /// Verify a token against this provider's key and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed tokens, bad signatures, or when the
    /// provider runs in existing-token mode (no key to verify with).
    pub fn verify(&self, token: &str) -> Result<NTokenClaims> {
        let Mode::Sign(signer) = &self.mode else {
            return Err(Error::Internal(
                "cannot verify tokens in existing-token mode".to_string(),
            ));
        };

        let mut parts = token.rsplitn(2, '.');
        let sig_b64 = parts
            .next()
            .ok_or_else(|| Error::BadRequest("malformed token".to_string()))?;
        let signing_input = parts
            .next()
            .ok_or_else(|| Error::BadRequest("malformed token".to_string()))?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| Error::BadRequest(format!("malformed token signature: {e}")))?;
        signer.verify(signing_input.as_bytes(), &sig)?;

        let claims_b64 = signing_input
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::BadRequest("malformed token claims".to_string()))?;
        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| Error::BadRequest(format!("malformed token claims: {e}")))?;
        Ok(serde_json::from_slice(&claims_json)?)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolve the host's first address, falling back to loopback.
fn resolve_ip(hostname: &str) -> String {
    (hostname, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map_or_else(|| "127.0.0.1".to_string(), |a| a.ip().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> NTokenConfig {
        // rcgen generates a PKCS#8 ECDSA P-256 key, which the signer accepts.
        let key = rcgen::KeyPair::generate().unwrap();
        let key_path = dir.path().join("service.key.pem");
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        NTokenConfig {
            enable: true,
            athenz_domain: "sports".to_string(),
            service_name: "api".to_string(),
            private_key_path: key_path.to_string_lossy().into_owned(),
            key_version: "v1.1".to_string(),
            validate: true,
            refresh_period: Duration::from_secs(1800),
            existing_token_path: String::new(),
        }
    }

    #[test]
    fn disabled_config_is_rejected() {
        let cfg = NTokenConfig::default();
        let err = NTokenProvider::new(&cfg).unwrap_err();
        assert!(matches!(err, Error::Disabled("ntoken")));
    }

    #[test]
    fn missing_key_file_fails_with_load_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.private_key_path = "/nonexistent/key.pem".to_string();
        let err = NTokenProvider::new(&cfg).unwrap_err();
        assert!(matches!(err, Error::LoadPrivateKey(_)));
    }

    #[test]
    fn garbage_key_file_fails_with_load_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("bad.pem");
        std::fs::write(&key_path, "not a pem").unwrap();

        let mut cfg = test_config(&dir);
        cfg.private_key_path = key_path.to_string_lossy().into_owned();
        let err = NTokenProvider::new(&cfg).unwrap_err();
        assert!(matches!(err, Error::LoadPrivateKey(_)));
    }

    #[test]
    fn missing_domain_is_invalid_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&dir);
        cfg.athenz_domain = String::new();
        let err = NTokenProvider::new(&cfg).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn initial_token_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NTokenProvider::new(&test_config(&dir)).unwrap();

        let token = provider.token().unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert!(provider.expiry().unwrap() > SystemTime::now());
    }

    #[test]
    fn sign_verify_round_trips_claims() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NTokenProvider::new(&test_config(&dir)).unwrap();

        let token = provider.token().unwrap();
        let claims = provider.verify(&token).unwrap();
        assert_eq!(claims.d, "sports");
        assert_eq!(claims.n, "api");
        assert_eq!(claims.k, "v1.1");
        assert!(claims.exp > claims.iat);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn tampered_token_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NTokenProvider::new(&test_config(&dir)).unwrap();

        let token = provider.token().unwrap();
        let mut tampered = token.clone();
        tampered.replace_range(..1, "X");
        assert!(provider.verify(&tampered).is_err());
    }

    #[test]
    fn update_replaces_the_published_token() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NTokenProvider::new(&test_config(&dir)).unwrap();

        let first = provider.token().unwrap();
        provider.update().unwrap();
        let second = provider.token().unwrap();
        // The random salt makes every signing unique.
        assert_ne!(first, second);
    }

    #[test]
    fn existing_token_mode_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut token_file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        writeln!(token_file, "v=S1;d=sports;s=signature").unwrap();

        let cfg = NTokenConfig {
            enable: true,
            existing_token_path: token_file.path().to_string_lossy().into_owned(),
            ..NTokenConfig::default()
        };

        let provider = NTokenProvider::new(&cfg).unwrap();
        assert_eq!(provider.token().unwrap(), "v=S1;d=sports;s=signature");
        assert!(provider.verify("anything").is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn existing_token_mode_resolves_env_indirection() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        write!(token_file, "file-token").unwrap();
        unsafe {
            std::env::set_var(
                "NTOKEN_TEST_PATH",
                token_file.path().to_string_lossy().into_owned(),
            );
        }

        let cfg = NTokenConfig {
            enable: true,
            existing_token_path: "_NTOKEN_TEST_PATH_".to_string(),
            ..NTokenConfig::default()
        };
        let provider = NTokenProvider::new(&cfg).unwrap();
        assert_eq!(provider.token().unwrap(), "file-token");

        unsafe { std::env::remove_var("NTOKEN_TEST_PATH") };
    }
}
