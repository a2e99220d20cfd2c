//! Service-certificate manager
//!
//! Holds the one X.509 identity certificate of this service principal.
//! The certificate is fetched lazily (the first caller triggers it),
//! refreshed against the configured expiry margin, and served stale while
//! its `NotAfter` is still in the future when the IDP is unreachable.
//!
//! A refresh POSTs an instance-refresh request carrying a CSR signed with
//! the service private key to `/instance/<domain>/<service>/refresh`.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{NTokenConfig, ServiceCertConfig, actual_value};
use crate::token::TokenProvider;
use crate::{Error, Result};

/// Valid Athenz domain names
static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_0-9][A-Za-z0-9._-]*$").unwrap());

/// Largest certificate lifetime forwarded to the IDP, in minutes.
/// Anything beyond falls back to 0, which selects the server default.
const MAX_EXPIRY_MINUTES: u64 = 2_557_920 * 60;

/// The cached certificate
#[derive(Debug)]
pub struct SvcCertEntry {
    /// Served PEM bytes (leaf, optionally followed by the CA bundle)
    pub pem: Vec<u8>,
    /// `NotAfter` of the leaf certificate
    pub not_after: SystemTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRefreshRequest {
    csr: String,
    expiry_time: i32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    spiffe: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRefreshResponse {
    certificate: String,
    #[serde(default)]
    ca_cert_bundle: Option<String>,
}

/// Service-certificate manager (C4)
pub struct SvcCertService {
    cfg: ServiceCertConfig,
    athenz_url: String,
    domain: String,
    service: String,
    key_pem: String,
    expiry_minutes: i32,
    client: reqwest::Client,
    token_provider: TokenProvider,
    cell: ArcSwapOption<SvcCertEntry>,
    // Serializes decide-to-refresh / perform-refresh / store.
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for SvcCertService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcCertService")
            .field("cfg", &self.cfg)
            .field("athenz_url", &self.athenz_url)
            .field("domain", &self.domain)
            .field("service", &self.service)
            .field("expiry_minutes", &self.expiry_minutes)
            .field("client", &self.client)
            .field("token_provider", &"..")
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}

impl SvcCertService {
    /// Create the manager. No certificate is fetched yet; the first
    /// caller of [`get`](Self::get) triggers the initial refresh.
    ///
    /// # Errors
    ///
    /// `Error::Disabled` when the section is off,
    /// `Error::InvalidParameter` when the domain fails validation,
    /// `Error::LoadPrivateKey` when the CSR signing key is unusable,
    /// `Error::FailedToInitialize` when required settings are missing.
    pub fn new(
        cfg: &ServiceCertConfig,
        ntoken_cfg: &NTokenConfig,
        client: reqwest::Client,
        token_provider: TokenProvider,
    ) -> Result<Arc<Self>> {
        if !cfg.enable {
            return Err(Error::Disabled("serviceCert"));
        }

        let domain = actual_value(&ntoken_cfg.athenz_domain);
        let service = actual_value(&ntoken_cfg.service_name);
        if !is_valid_domain(&domain) {
            return Err(Error::InvalidParameter(format!(
                "invalid athenz domain: {domain:?}"
            )));
        }
        if service.is_empty() {
            return Err(Error::FailedToInitialize(
                "service certificate service: serviceName must be set".to_string(),
            ));
        }

        let athenz_url = actual_value(&cfg.athenz_url)
            .trim_end_matches('/')
            .to_string();
        if athenz_url.is_empty() {
            return Err(Error::FailedToInitialize(
                "service certificate service: athenzURL must be set".to_string(),
            ));
        }

        let key_path = actual_value(&ntoken_cfg.private_key_path);
        let key_pem = std::fs::read_to_string(&key_path)
            .map_err(|e| Error::LoadPrivateKey(format!("{key_path}: {e}")))?;
        // Parse once up front so a broken key fails initialization, not
        // the first refresh.
        KeyPair::from_pem(&key_pem).map_err(|e| Error::LoadPrivateKey(e.to_string()))?;

        let minutes = cfg.expiry.as_secs() / 60;
        let expiry_minutes = if minutes > MAX_EXPIRY_MINUTES {
            warn!(
                hours = cfg.expiry.as_secs() / 3600,
                "serviceCert.expiry exceeds the representable window, requesting server default"
            );
            0
        } else {
            minutes as i32
        };

        info!(domain = %domain, service = %service, "service-certificate manager initialized");
        Ok(Arc::new(Self {
            cfg: cfg.clone(),
            athenz_url,
            domain,
            service,
            key_pem,
            expiry_minutes,
            client,
            token_provider,
            cell: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
        }))
    }

    /// Lifetime forwarded to the IDP, in minutes (0 selects the server default)
    #[must_use]
    pub fn expiry_minutes(&self) -> i32 {
        self.expiry_minutes
    }

    /// Current certificate PEM.
    ///
    /// Served from the cache while `now + expiryMargin < NotAfter`;
    /// otherwise a refresh is attempted. When the refresh fails and the
    /// cached leaf has not yet expired, the stale PEM is returned.
    ///
    /// # Errors
    ///
    /// Propagates the refresh error when no usable certificate exists.
    pub async fn get(&self) -> Result<Vec<u8>> {
        if let Some(entry) = self.cell.load_full() {
            if self.within_margin(&entry) {
                return Ok(entry.pem.clone());
            }
        }

        match self.refresh().await {
            Ok(entry) => Ok(entry.pem.clone()),
            Err(err) => {
                if let Some(entry) = self.cell.load_full() {
                    if entry.not_after > SystemTime::now() {
                        warn!(error = %err, "serving stale service certificate, refresh failed");
                        return Ok(entry.pem.clone());
                    }
                }
                Err(err)
            }
        }
    }

    /// Fetch a fresh certificate and replace the cached one.
    ///
    /// Callers racing on a cold or expiring cache serialize here; the
    /// losers observe the winner's result instead of fetching again.
    ///
    /// # Errors
    ///
    /// `Error::NoToken` without an N-Token, `Error::Upstream` on IDP
    /// refusal, `Error::InvalidCert` when the returned leaf is unusable.
    pub async fn refresh(&self) -> Result<Arc<SvcCertEntry>> {
        let _guard = self.refresh_lock.lock().await;

        // Someone else refreshed while we waited for the lock.
        if let Some(entry) = self.cell.load_full() {
            if self.within_margin(&entry) {
                return Ok(entry);
            }
        }

        let token = (self.token_provider)()?;
        let csr = self.build_csr()?;
        let request = InstanceRefreshRequest {
            csr,
            expiry_time: self.expiry_minutes,
            spiffe: self.cfg.spiffe,
        };

        let response = self
            .client
            .post(format!(
                "{}/instance/{}/{}/refresh",
                self.athenz_url, self.domain, self.service
            ))
            .header(self.cfg.principal_auth_header.as_str(), token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let identity: InstanceRefreshResponse = response.json().await?;
        let not_after = parse_not_after(identity.certificate.as_bytes())?;

        let mut pem = identity.certificate.into_bytes();
        if self.cfg.intermediate_cert {
            if let Some(bundle) = identity.ca_cert_bundle {
                pem.extend_from_slice(bundle.as_bytes());
            }
        }

        let entry = Arc::new(SvcCertEntry { pem, not_after });
        self.cell.store(Some(Arc::clone(&entry)));
        debug!(not_after = ?not_after, "service certificate refreshed");
        Ok(entry)
    }

    /// Background refresh loop; fetches whenever the margin is crossed.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        err_tx: mpsc::Sender<Error>,
    ) {
        let period = self.cfg.refresh_period;
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(period = ?period, "service-certificate refresher started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Nothing to keep fresh before the first caller.
                    if self.cell.load().is_none() {
                        continue;
                    }
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "service-certificate refresh failed, keeping cached entry");
                        let _ = err_tx.send(e).await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("service-certificate refresher stopped");
                    break;
                }
            }
        }
    }

    fn within_margin(&self, entry: &SvcCertEntry) -> bool {
        SystemTime::now() + self.cfg.expiry_margin < entry.not_after
    }

    fn build_csr(&self) -> Result<String> {
        let key_pair =
            KeyPair::from_pem(&self.key_pem).map_err(|e| Error::LoadPrivateKey(e.to_string()))?;

        let subject = &self.cfg.subject;
        let mut dn = DistinguishedName::new();
        if !subject.country.is_empty() {
            dn.push(DnType::CountryName, subject.country.as_str());
        }
        if !subject.province.is_empty() {
            dn.push(DnType::StateOrProvinceName, subject.province.as_str());
        }
        if !subject.organization.is_empty() {
            dn.push(DnType::OrganizationName, subject.organization.as_str());
        }
        if !subject.organizational_unit.is_empty() {
            dn.push(
                DnType::OrganizationalUnitName,
                subject.organizational_unit.as_str(),
            );
        }
        dn.push(DnType::CommonName, format!("{}.{}", self.domain, self.service));

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;

        let dns_san = format!(
            "{}.{}.{}",
            self.service,
            self.domain.replace('.', "-"),
            actual_value(&self.cfg.dns_suffix)
        );
        let mut sans = vec![SanType::DnsName(
            Ia5String::try_from(dns_san.as_str())
                .map_err(|e| Error::InvalidParameter(format!("invalid DNS SAN '{dns_san}': {e}")))?,
        )];
        if self.cfg.spiffe {
            let uri = format!("spiffe://{}/sa/{}", self.domain, self.service);
            sans.push(SanType::URI(Ia5String::try_from(uri.as_str()).map_err(
                |e| Error::InvalidParameter(format!("invalid SPIFFE SAN '{uri}': {e}")),
            )?));
        }
        params.subject_alt_names = sans;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Internal(format!("CSR generation failed: {e}")))?;
        csr.pem()
            .map_err(|e| Error::Internal(format!("CSR encoding failed: {e}")))
    }
}

/// Whether `domain` is a well-formed Athenz domain name
#[must_use]
pub fn is_valid_domain(domain: &str) -> bool {
    DOMAIN_RE.is_match(domain)
}

/// Extract `NotAfter` from the first certificate in a PEM block
fn parse_not_after(pem: &[u8]) -> Result<SystemTime> {
    let (_, parsed) =
        x509_parser::pem::parse_x509_pem(pem).map_err(|e| Error::InvalidCert(e.to_string()))?;
    let cert = parsed
        .parse_x509()
        .map_err(|e| Error::InvalidCert(e.to_string()))?;

    let ts = cert.validity().not_after.timestamp();
    u64::try_from(ts)
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
        .map_err(|_| Error::InvalidCert("NotAfter predates the epoch".to_string()))
}
