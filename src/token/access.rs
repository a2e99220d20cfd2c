//! Access-token cache and fetcher
//!
//! Maintains a keyed cache of OAuth2-style access tokens obtained from
//! the IDP's `/oauth2/token` endpoint. Cache misses coalesce through a
//! per-key single-flight group; a background loop re-fetches every
//! resident key on a fixed period. Entries are only ever replaced, never
//! evicted, and a stale entry is still served when the IDP is down.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{PRINCIPAL_AUTH_HEADER, TokenProvider, truncate, with_retry};
use crate::config::{AccessTokenConfig, actual_value};
use crate::error::FetchError;
use crate::singleflight::Group;
use crate::{Error, Result};

/// Cache key: one entry per requested principal scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccessTokenKey {
    domain: String,
    services: String,
    proxy_for_principal: String,
}

/// A cached access token
#[derive(Debug, Clone, Serialize)]
pub struct AccessTokenEntry {
    /// The opaque bearer token
    pub access_token: String,
    /// Token type (usually "Bearer")
    pub token_type: String,
    /// Lifetime in seconds relative to the moment of issue
    pub expires_in: i64,
    /// Granted scope, as reported by the IDP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Wall-clock expiration instant
    #[serde(skip)]
    pub expiry: SystemTime,
}

impl AccessTokenEntry {
    fn is_valid(&self) -> bool {
        self.expiry > SystemTime::now()
    }
}

/// IDP token response
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Access-token cache+fetcher (C2)
pub struct AccessTokenService {
    cfg: AccessTokenConfig,
    athenz_url: String,
    client: reqwest::Client,
    token_provider: TokenProvider,
    cache: DashMap<AccessTokenKey, AccessTokenEntry>,
    group: Group<AccessTokenKey, std::result::Result<AccessTokenEntry, FetchError>>,
}

impl std::fmt::Debug for AccessTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenService")
            .field("cfg", &self.cfg)
            .field("athenz_url", &self.athenz_url)
            .field("client", &self.client)
            .field("token_provider", &"..")
            .field("cache", &self.cache)
            .field("group", &self.group)
            .finish()
    }
}

impl AccessTokenService {
    /// Create the service.
    ///
    /// # Errors
    ///
    /// `Error::Disabled` when the section is off, `Error::InvalidParameter`
    /// when no IDP URL is configured.
    pub fn new(
        cfg: &AccessTokenConfig,
        client: reqwest::Client,
        token_provider: TokenProvider,
    ) -> Result<Arc<Self>> {
        if !cfg.enable {
            return Err(Error::Disabled("accessToken"));
        }

        let athenz_url = actual_value(&cfg.athenz_url)
            .trim_end_matches('/')
            .to_string();
        if athenz_url.is_empty() {
            return Err(Error::InvalidParameter(
                "accessToken.athenzURL must be set".to_string(),
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

    /// Get a token for `(domain, services, proxy_for_principal)`.
    ///
    /// Returns the cached entry when it has not expired; otherwise fetches
    /// from the IDP, coalescing with any in-flight fetch for the same key.
    /// When the fetch fails but a cached entry exists, the cached entry is
    /// returned instead of the error.
    ///
    /// # Errors
    ///
    /// `Error::NoToken` when no N-Token is available, `Error::Upstream`
    /// when the IDP refuses and no cached entry can cover for it.
    pub async fn get(
        &self,
        domain: &str,
        services: &str,
        proxy_for_principal: &str,
        expiry: Option<u64>,
    ) -> Result<AccessTokenEntry> {
        if domain.is_empty() {
            return Err(Error::BadRequest("domain must not be empty".to_string()));
        }

        let key = AccessTokenKey {
            domain: domain.to_string(),
            services: services.to_string(),
            proxy_for_principal: proxy_for_principal.to_string(),
        };

        if let Some(entry) = self.cache.get(&key) {
            if entry.is_valid() {
                return Ok(entry.clone());
            }
        }

        let expiry_secs = expiry.unwrap_or(self.cfg.expiry.as_secs());
        let result = self
            .group
            .run(&key, || self.fetch(&key, expiry_secs))
            .await;

        match result {
            Ok(entry) => Ok(entry),
            Err(e) => match self.cache.get(&key) {
                // A stale hit is still a success; the refresher will
                // replace it once the IDP recovers.
                Some(entry) => {
                    warn!(domain = %key.domain, error = %e, "serving cached access token, refresh failed");
                    Ok(entry.clone())
                }
                None => Err(e.into()),
            },
        }
    }

    /// Fetch one token with the configured retry budget and store it.
    async fn fetch(
        &self,
        key: &AccessTokenKey,
        expiry_secs: u64,
    ) -> std::result::Result<AccessTokenEntry, FetchError> {
        let entry = with_retry(&self.cfg.retry, || self.fetch_once(key, expiry_secs)).await?;
        self.cache.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    async fn fetch_once(
        &self,
        key: &AccessTokenKey,
        expiry_secs: u64,
    ) -> std::result::Result<AccessTokenEntry, FetchError> {
        let token = (self.token_provider)().map_err(|_| FetchError::NoToken)?;

        let scope = if key.services.is_empty() {
            format!("{}:domain", key.domain)
        } else {
            key.services
                .split(',')
                .map(|s| format!("{}:role.{}", key.domain, s.trim()))
                .collect::<Vec<_>>()
                .join(" ")
        };

        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("scope".to_string(), scope),
        ];
        if expiry_secs > 0 {
            form.push(("expires_in".to_string(), expiry_secs.to_string()));
        }
        if !key.proxy_for_principal.is_empty() {
            form.push((
                "proxy_for_principal".to_string(),
                key.proxy_for_principal.clone(),
            ));
        }

        let response = self
            .client
            .post(format!("{}/oauth2/token", self.athenz_url))
            .header(PRINCIPAL_AUTH_HEADER, token)
            .form(&form)
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

        let parsed: AccessTokenResponse = response.json().await?;
        let expires_in = parsed.expires_in.unwrap_or(0);
        let entry = AccessTokenEntry {
            access_token: parsed.access_token,
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in,
            scope: parsed.scope,
            expiry: SystemTime::now() + Duration::from_secs(expires_in.max(0) as u64),
        };

        debug!(domain = %key.domain, services = %key.services, expires_in, "fetched access token");
        Ok(entry)
    }

    /// Background refresh loop: re-fetch every resident key each period.
    ///
    /// Per-entry failures are logged and reported on the error channel but
    /// never terminate the loop, and never evict the stale entry.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        err_tx: mpsc::Sender<Error>,
    ) {
        let period = self.cfg.refresh_period;
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(period = ?period, "access-token refresher started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let keys: Vec<AccessTokenKey> =
                        self.cache.iter().map(|e| e.key().clone()).collect();
                    for key in keys {
                        let expiry_secs = self.cfg.expiry.as_secs();
                        if let Err(e) = self.group.run(&key, || self.fetch(&key, expiry_secs)).await {
                            warn!(domain = %key.domain, services = %key.services, error = %e,
                                "access-token refresh failed, keeping cached entry");
                            let _ = err_tx.send(e.into()).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("access-token refresher stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider() -> TokenProvider {
        Arc::new(|| Ok("test-ntoken".to_string()))
    }

    fn no_token_provider() -> TokenProvider {
        Arc::new(|| Err(Error::NoToken))
    }

    fn config(url: &str) -> AccessTokenConfig {
        AccessTokenConfig {
            enable: true,
            athenz_url: url.to_string(),
            retry: crate::config::RetryConfig {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            ..AccessTokenConfig::default()
        }
    }

    fn token_body(token: &str, expires_in: i64) -> serde_json::Value {
        serde_json::json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": expires_in,
            "scope": "sports:role.api"
        })
    }

    #[test]
    fn disabled_config_is_rejected() {
        let cfg = AccessTokenConfig::default();
        let err = AccessTokenService::new(&cfg, reqwest::Client::new(), provider()).unwrap_err();
        assert!(matches!(err, Error::Disabled("accessToken")));
    }

    #[test]
    fn missing_url_is_invalid_parameter() {
        let mut cfg = config("");
        cfg.enable = true;
        let err = AccessTokenService::new(&cfg, reqwest::Client::new(), provider()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn fetches_and_caches_on_miss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(header(PRINCIPAL_AUTH_HEADER, "test-ntoken"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();

        let first = svc.get("sports", "api", "", None).await.unwrap();
        assert_eq!(first.access_token, "at-1");
        assert_eq!(first.expires_in, 3600);

        // Second call is a cache hit; the mock's expect(1) would fail
        // otherwise when the server verifies on drop.
        let second = svc.get("sports", "api", "", None).await.unwrap();
        assert_eq!(second.access_token, "at-1");
        assert_eq!(svc.len(), 1);
    }

    #[tokio::test]
    async fn empty_service_list_requests_domain_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("scope=sports%3Adomain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-d", 600)))
            .expect(1)
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();
        let entry = svc.get("sports", "", "", None).await.unwrap();
        assert_eq!(entry.access_token, "at-d");
    }

    #[tokio::test]
    async fn proxy_principal_and_expiry_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("proxy_for_principal=user.jdoe"))
            .and(body_string_contains("expires_in=900"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-p", 900)))
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();
        let entry = svc
            .get("sports", "api", "user.jdoe", Some(900))
            .await
            .unwrap();
        assert_eq!(entry.access_token, "at-p");
    }

    #[tokio::test]
    async fn concurrent_cold_gets_issue_one_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("at-1", 3600))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();

        let ok = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let svc = Arc::clone(&svc);
            let ok = Arc::clone(&ok);
            handles.push(tokio::spawn(async move {
                let entry = svc.get("d", "s", "", None).await.unwrap();
                assert_eq!(entry.access_token, "at-1");
                ok.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ok.load(Ordering::SeqCst), 100);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_without_cache_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(500).set_body_string("request error"))
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();
        let err = svc.get("sports", "api", "", None).await.unwrap_err();
        match err {
            Error::Upstream { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("request error"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stale_entry_is_served_when_upstream_fails() {
        let server = MockServer::start().await;
        // First call succeeds with an immediately expiring token.
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at-stale", 0)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // Everything after that fails.
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let svc =
            AccessTokenService::new(&config(&server.uri()), reqwest::Client::new(), provider())
                .unwrap();

        let primed = svc.get("sports", "api", "", None).await.unwrap();
        assert_eq!(primed.access_token, "at-stale");

        // Entry expired instantly, so this is a miss; the fetch fails and
        // the stale entry is returned as a success.
        let stale = svc.get("sports", "api", "", None).await.unwrap();
        assert_eq!(stale.access_token, "at-stale");
    }

    #[tokio::test]
    async fn missing_ntoken_skips_the_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("at", 60)))
            .expect(0)
            .mount(&server)
            .await;

        let svc = AccessTokenService::new(
            &config(&server.uri()),
            reqwest::Client::new(),
            no_token_provider(),
        )
        .unwrap();
        let err = svc.get("sports", "api", "", None).await.unwrap_err();
        assert!(matches!(err, Error::NoToken));
    }

    #[tokio::test]
    async fn empty_domain_is_a_bad_request() {
        let svc = AccessTokenService::new(
            &config("http://localhost:1"),
            reqwest::Client::new(),
            provider(),
        )
        .unwrap();
        let err = svc.get("", "api", "", None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
