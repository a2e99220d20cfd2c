//! TLS material loading
//!
//! Builds the rustls server config for the API listener (optionally with
//! mutual TLS when a client CA is configured) and the reqwest clients used
//! toward the IDP and proxied origins.
//!
//! All certificate and key files are expected in **PEM format**.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::debug;

use crate::config::{TlsConfig, actual_value};
use crate::{Error, Result};

/// Idle connections kept per origin host in the shared client pool
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Build a `rustls::ServerConfig` for the API listener.
///
/// When `ca_path` is set, clients must present a certificate signed by
/// that CA; otherwise no client authentication is requested.
///
/// # Errors
///
/// `Error::TlsCertOrKeyNotFound` when the cert or key path is not
/// configured; `Error::Config` when a file cannot be read or parsed.
pub fn new_tls_config(cfg: &TlsConfig) -> Result<ServerConfig> {
    let cert_path = actual_value(&cfg.cert_path);
    let key_path = actual_value(&cfg.key_path);
    let ca_path = actual_value(&cfg.ca_path);

    if cert_path.is_empty() || key_path.is_empty() {
        return Err(Error::TlsCertOrKeyNotFound);
    }

    let certs = load_certs(&cert_path)?;
    let key = load_private_key(&key_path)?;

    let builder = if ca_path.is_empty() {
        ServerConfig::builder().with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        for cert in load_certs(&ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build client verifier: {e}")))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    };

    let mut tls_cfg = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %cert_path, mutual = !ca_path.is_empty(), "server TLS config built");
    Ok(tls_cfg)
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))
}

/// Build a reqwest client for upstream calls.
///
/// `ca_path` adds extra roots for verifying the IDP; `identity_path`
/// points at a PEM bundle (key + cert) presented as the client identity.
/// The pool keeps at most 32 idle connections per host and every request
/// is bounded by `timeout`.
///
/// # Errors
///
/// Returns an error when TLS material cannot be read or the client
/// cannot be constructed.
pub fn new_http_client(
    ca_path: &str,
    identity_path: &str,
    timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .timeout(timeout)
        .use_rustls_tls();

    let ca = actual_value(ca_path);
    if !ca.is_empty() {
        for cert in load_certs(&ca)? {
            let cert = reqwest::Certificate::from_der(cert.as_ref())
                .map_err(|e| Error::Config(format!("Invalid CA cert in '{ca}': {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    let identity = actual_value(identity_path);
    if !identity.is_empty() {
        let pem = read_file(&identity)?;
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Config(format!("Invalid client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(Error::Http)
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

#[cfg(test)]
mod tests {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    use super::*;

    /// Write a self-signed cert and its key under `dir`, returning the paths.
    fn write_cert_pair(dir: &tempfile::TempDir, stem: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "sidecar.test");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key).unwrap();

        let cert_path = dir.path().join(format!("{stem}.crt"));
        let key_path = dir.path().join(format!("{stem}.key"));
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn missing_cert_or_key_path_is_a_dedicated_error() {
        let cfg = TlsConfig {
            enable: true,
            ..TlsConfig::default()
        };
        let err = new_tls_config(&cfg).unwrap_err();
        assert!(matches!(err, Error::TlsCertOrKeyNotFound));
        assert_eq!(err.to_string(), "Cert/Key path not found");
    }

    #[test]
    fn server_config_builds_from_generated_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_cert_pair(&dir, "server");

        let cfg = TlsConfig {
            enable: true,
            cert_path,
            key_path,
            ca_path: String::new(),
        };
        let tls = new_tls_config(&cfg).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn ca_path_enables_client_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_cert_pair(&dir, "server");
        let (ca_path, _) = write_cert_pair(&dir, "ca");

        let cfg = TlsConfig {
            enable: true,
            cert_path,
            key_path,
            ca_path,
        };
        assert!(new_tls_config(&cfg).is_ok());
    }

    #[test]
    fn unreadable_cert_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key_path) = write_cert_pair(&dir, "server");
        let cfg = TlsConfig {
            enable: true,
            cert_path: "/nonexistent/server.crt".to_string(),
            key_path,
            ca_path: String::new(),
        };
        let err = new_tls_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }

    #[test]
    fn load_certs_rejects_empty_pem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.crt");
        fs::write(&path, b"").unwrap();
        assert!(load_certs(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn load_private_key_rejects_cert_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = write_cert_pair(&dir, "server");
        assert!(load_private_key(&cert_path).is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn tls_paths_resolve_env_indirection() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_cert_pair(&dir, "server");
        unsafe {
            std::env::set_var("SIDECAR_TLS_TEST_CERT", &cert_path);
            std::env::set_var("SIDECAR_TLS_TEST_KEY", &key_path);
        }

        let cfg = TlsConfig {
            enable: true,
            cert_path: "_SIDECAR_TLS_TEST_CERT_".to_string(),
            key_path: "_SIDECAR_TLS_TEST_KEY_".to_string(),
            ca_path: String::new(),
        };
        assert!(new_tls_config(&cfg).is_ok());

        unsafe {
            std::env::remove_var("SIDECAR_TLS_TEST_CERT");
            std::env::remove_var("SIDECAR_TLS_TEST_KEY");
        }
    }

    #[test]
    fn http_client_builds_with_custom_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (ca_path, _) = write_cert_pair(&dir, "ca");
        assert!(new_http_client(&ca_path, "", Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn http_client_builds_without_tls_material() {
        assert!(new_http_client("", "", Duration::from_secs(5)).is_ok());
    }
}
