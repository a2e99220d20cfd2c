//! Role-token cache and fetcher
//!
//! Same engine shape as the access-token service, but against the IDP's
//! role-token endpoint: `GET /domain/<domain>/token` with the role set,
//! expiry window and optional proxy principal as query parameters.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{PRINCIPAL_AUTH_HEADER, TokenProvider, truncate, with_retry};
use crate::config::{RoleTokenConfig, actual_value};
use crate::error::FetchError;
use crate::singleflight::Group;
use crate::{Error, Result};

/// Cache key: one entry per role set and expiry window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RoleTokenKey {
    domain: String,
    roles: String,
    proxy_for_principal: String,
    min_expiry: u64,
    max_expiry: u64,
}

/// A cached role token
#[derive(Debug, Clone, Serialize)]
pub struct RoleTokenEntry {
    /// The opaque role token
    pub token: String,
    /// Expiration time (Unix seconds), as reported by the IDP
    #[serde(rename = "expiryTime")]
    pub expiry_time: i64,
    /// Instant the sidecar stored this entry
    #[serde(skip)]
    pub issued_at: SystemTime,
}

impl RoleTokenEntry {
    fn is_valid(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.expiry_time > now
    }
}

/// IDP role-token response
#[derive(Debug, Deserialize)]
struct RoleTokenResponse {
    token: String,
    #[serde(rename = "expiryTime")]
    expiry_time: i64,
}

/// Role-token cache+fetcher (C3)
pub struct RoleTokenService {
    cfg: RoleTokenConfig,
    athenz_url: String,
    client: reqwest::Client,
    token_provider: TokenProvider,
    cache: DashMap<RoleTokenKey, RoleTokenEntry>,
    group: Group<RoleTokenKey, std::result::Result<RoleTokenEntry, FetchError>>,
}

impl std::fmt::Debug for RoleTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleTokenService")
            .field("cfg", &self.cfg)
            .field("athenz_url", &self.athenz_url)
            .field("client", &self.client)
            .field("token_provider", &"..")
            .field("cache", &self.cache)
            .field("group", &self.group)
            .finish()
    }
}

impl RoleTokenService {
    /// Create the service.
    ///
    /// # Errors
    ///
    /// `Error::Disabled` when the section is off, `Error::InvalidParameter`
    /// when no IDP URL is configured.
    pub fn new(
        cfg: &RoleTokenConfig,
        client: reqwest::Client,
        token_provider: TokenProvider,
    ) -> Result<Arc<Self>> {
        if !cfg.enable {
            return Err(Error::Disabled("roleToken"));
        }

        let athenz_url = actual_value(&cfg.athenz_url)
            .trim_end_matches('/')
            .to_string();
        if athenz_url.is_empty() {
            return Err(Error::InvalidParameter(
                "roleToken.athenzURL must be set".to_string(),
            ));
        }

        Ok(Arc::new(Self {
            cfg: cfg.clone(),
            athenz_url,
            client,
            token_provider,
            cache: DashMap::new(),
            group: Group::new(),
        }))
    }

    /// Number of resident cache entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Get a token for the role set.
    ///
    /// An empty `roles` string requests a token covering every role the
    /// principal holds in the domain. Cached entries are served until
    /// their expiry; misses coalesce per key; a failed fetch falls back
    /// to the cached entry when one exists.
    ///
    /// # Errors
    ///
    /// `Error::NoToken` when no N-Token is available, `Error::Upstream`
    /// when the IDP refuses and no cached entry can cover for it.
    pub async fn get(
        &self,
        domain: &str,
        roles: &str,
        proxy_for_principal: &str,
        min_expiry: Option<u64>,
        max_expiry: Option<u64>,
    ) -> Result<RoleTokenEntry> {
        if domain.is_empty() {
            return Err(Error::BadRequest("domain must not be empty".to_string()));
        }

        let key = RoleTokenKey {
            domain: domain.to_string(),
            roles: canonicalize_roles(roles),
            proxy_for_principal: proxy_for_principal.to_string(),
            min_expiry: min_expiry.unwrap_or(0),
            max_expiry: max_expiry.unwrap_or(0),
        };

        if let Some(entry) = self.cache.get(&key) {
            if entry.is_valid() {
                return Ok(entry.clone());
            }
        }

        let result = self.group.run(&key, || self.fetch(&key)).await;

        match result {
            Ok(entry) => Ok(entry),
            Err(e) => match self.cache.get(&key) {
                Some(entry) => {
                    warn!(domain = %key.domain, error = %e, "serving cached role token, refresh failed");
                    Ok(entry.clone())
                }
                None => Err(e.into()),
            },
        }
    }

    async fn fetch(
        &self,
        key: &RoleTokenKey,
    ) -> std::result::Result<RoleTokenEntry, FetchError> {
        let entry = with_retry(&self.cfg.retry, || self.fetch_once(key)).await?;
        self.cache.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    async fn fetch_once(
        &self,
        key: &RoleTokenKey,
    ) -> std::result::Result<RoleTokenEntry, FetchError> {
        let token = (self.token_provider)().map_err(|_| FetchError::NoToken)?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if !key.roles.is_empty() {
            query.push(("role", key.roles.clone()));
        }
        let min_expiry = if key.min_expiry > 0 {
            key.min_expiry
        } else {
            self.cfg.expiry.as_secs()
        };
        if min_expiry > 0 {
            query.push(("minExpiryTime", min_expiry.to_string()));
        }
        if key.max_expiry > 0 {
            query.push(("maxExpiryTime", key.max_expiry.to_string()));
        }
        if !key.proxy_for_principal.is_empty() {
            query.push(("proxyForPrincipal", key.proxy_for_principal.clone()));
        }

        let response = self
            .client
            .get(format!("{}/domain/{}/token", self.athenz_url, key.domain))
            .header(PRINCIPAL_AUTH_HEADER, token)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        let parsed: RoleTokenResponse = response.json().await?;
        let entry = RoleTokenEntry {
            token: parsed.token,
            expiry_time: parsed.expiry_time,
            issued_at: SystemTime::now(),
        };

        debug!(domain = %key.domain, roles = %key.roles, expiry = entry.expiry_time, "fetched role token");
        Ok(entry)
    }

    /// Background refresh loop over the resident key set.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        err_tx: mpsc::Sender<Error>,
    ) {
        let period = self.cfg.refresh_period;
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(period = ?period, "role-token refresher started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let keys: Vec<RoleTokenKey> =
                        self.cache.iter().map(|e| e.key().clone()).collect();
                    for key in keys {
                        if let Err(e) = self.group.run(&key, || self.fetch(&key)).await {
                            warn!(domain = %key.domain, roles = %key.roles, error = %e,
                                "role-token refresh failed, keeping cached entry");
                            let _ = err_tx.send(e.into()).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("role-token refresher stopped");
                    break;
                }
            }
        }
    }
}

/// Trim whitespace around each role name and drop empty segments.
fn canonicalize_roles(roles: &str) -> String {
    roles
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider() -> TokenProvider {
        Arc::new(|| Ok("test-ntoken".to_string()))
    }

    fn config(url: &str) -> RoleTokenConfig {
        RoleTokenConfig {
            enable: true,
            athenz_url: url.to_string(),
            retry: crate::config::RetryConfig {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            ..RoleTokenConfig::default()
        }
    }

    fn future_expiry(secs_from_now: i64) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + secs_from_now
    }

    fn token_body(token: &str, expiry: i64) -> serde_json::Value {
        serde_json::json!({ "token": token, "expiryTime": expiry })
    }

    #[test]
    fn canonicalize_trims_and_drops_empty_segments() {
        assert_eq!(canonicalize_roles("admin, writer ,reader"), "admin,writer,reader");
        assert_eq!(canonicalize_roles(""), "");
        assert_eq!(canonicalize_roles(" , ,"), "");
        assert_eq!(canonicalize_roles("single"), "single");
    }

    #[test]
    fn disabled_config_is_rejected() {
        let cfg = RoleTokenConfig::default();
        let err = RoleTokenService::new(&cfg, reqwest::Client::new(), provider()).unwrap_err();
        assert!(matches!(err, Error::Disabled("roleToken")));
    }

    #[tokio::test]
    async fn fetches_with_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .and(header(PRINCIPAL_AUTH_HEADER, "test-ntoken"))
            .and(query_param("role", "admin,writer"))
            .and(query_param("minExpiryTime", "600"))
            .and(query_param("maxExpiryTime", "7200"))
            .and(query_param("proxyForPrincipal", "user.jdoe"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("rt-1", future_expiry(3600))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();
        let entry = svc
            .get("sports", "admin, writer", "user.jdoe", Some(600), Some(7200))
            .await
            .unwrap();
        assert_eq!(entry.token, "rt-1");
    }

    #[tokio::test]
    async fn empty_role_list_omits_role_parameter() {
        let server = MockServer::start().await;
        // wiremock matches mounted mocks in order; an explicit `role`
        // param would fail the query_param matcher below.
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("rt-any", future_expiry(60))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();
        let entry = svc.get("sports", "", "", None, None).await.unwrap();
        assert_eq!(entry.token, "rt-any");

        let requests = server.received_requests().await.unwrap();
        assert!(!requests[0].url.query().unwrap_or("").contains("role="));
    }

    #[tokio::test]
    async fn cached_entry_is_served_until_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("rt-1", future_expiry(3600))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();
        for _ in 0..5 {
            let entry = svc.get("sports", "admin", "", None, None).await.unwrap();
            assert_eq!(entry.token, "rt-1");
        }
        assert_eq!(svc.len(), 1);
    }

    #[tokio::test]
    async fn distinct_expiry_windows_are_distinct_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("rt", future_expiry(3600))),
            )
            .expect(2)
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();
        svc.get("sports", "admin", "", Some(60), None).await.unwrap();
        svc.get("sports", "admin", "", Some(120), None).await.unwrap();
        assert_eq!(svc.len(), 2);
    }

    #[tokio::test]
    async fn stale_entry_is_served_when_upstream_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("rt-old", future_expiry(-1))),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(ResponseTemplate::new(500).set_body_string("request error"))
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();

        let primed = svc.get("sports", "admin", "", None, None).await.unwrap();
        assert_eq!(primed.token, "rt-old");

        let stale = svc.get("sports", "admin", "", None, None).await.unwrap();
        assert_eq!(stale.token, "rt-old");
    }

    #[tokio::test]
    async fn upstream_failure_without_cache_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/domain/sports/token"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let svc = RoleTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
            .unwrap();
        let err = svc.get("sports", "admin", "", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 403, .. }));
    }
}
