//! Credential-injecting reverse proxy
//!
//! Forwards an application's request to the destination named in the
//! `Athenz-Destination` header, replacing the configured auth header with
//! a freshly minted credential:
//!
//! - `/proxy/ntoken`: clears any inbound principal header and attaches
//!   the current N-Token.
//! - `/proxy/roletoken`: reads the domain / role / expiry-window headers,
//!   obtains a role token, and attaches it under the role-auth header.
//!
//! Request and response bodies are streamed; chunks are re-split at the
//! configured buffer size so a large origin response is never buffered
//! whole.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Response as HttpResponse};
use axum::response::Response;
use futures::StreamExt;
use tracing::debug;
use url::Url;

use crate::config::ProxyConfig;
use crate::token::{RoleTokenService, TokenProvider};
use crate::{Error, Result};

/// Header naming the forward target (full URL)
pub const DESTINATION_HEADER: &str = "Athenz-Destination";

/// Role-token proxy control headers
const DOMAIN_HEADER: &str = "Athenz-Domain";
const ROLE_HEADER: &str = "Athenz-Role";
const PROXY_PRINCIPAL_HEADER: &str = "Athenz-Proxy-Principal";
const MIN_EXPIRY_HEADER: &str = "Athenz-Min-Expiry";
const MAX_EXPIRY_HEADER: &str = "Athenz-Max-Expiry";

/// Headers that must not travel across the proxy hop
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Credential-injecting reverse proxy (C6)
pub struct CredentialProxy {
    cfg: ProxyConfig,
    client: reqwest::Client,
    token_provider: TokenProvider,
    role_service: Option<Arc<RoleTokenService>>,
}

impl std::fmt::Debug for CredentialProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProxy")
            .field("cfg", &self.cfg)
            .field("client", &self.client)
            .field("token_provider", &"..")
            .field("role_service", &self.role_service)
            .finish()
    }
}

impl CredentialProxy {
    /// Create the proxy.
    ///
    /// # Errors
    ///
    /// `Error::Disabled` when the proxy section is off.
    pub fn new(
        cfg: &ProxyConfig,
        client: reqwest::Client,
        token_provider: TokenProvider,
        role_service: Option<Arc<RoleTokenService>>,
    ) -> Result<Arc<Self>> {
        if !cfg.enable {
            return Err(Error::Disabled("proxy"));
        }
        Ok(Arc::new(Self {
            cfg: cfg.clone(),
            client,
            token_provider,
            role_service,
        }))
    }

    /// Forward with a fresh N-Token in the principal-auth header.
    ///
    /// # Errors
    ///
    /// `Error::NoToken` without a token, `Error::BadRequest` without a
    /// destination, `Error::Http` when the origin is unreachable.
    pub async fn forward_ntoken(&self, mut req: Request<Body>) -> Result<Response> {
        let token = (self.token_provider)()?;
        set_credential(
            req.headers_mut(),
            &self.cfg.principal_auth_header,
            &token,
        )?;
        self.forward(req).await
    }

    /// Forward with a freshly minted role token in the role-auth header.
    ///
    /// # Errors
    ///
    /// As [`forward_ntoken`](Self::forward_ntoken), plus role-token fetch
    /// failures and malformed expiry headers.
    pub async fn forward_role_token(&self, mut req: Request<Body>) -> Result<Response> {
        let role_service = self
            .role_service
            .as_ref()
            .ok_or(Error::Disabled("roleToken"))?;

        let headers = req.headers();
        let domain = required_header(headers, DOMAIN_HEADER)?;
        let role = optional_header(headers, ROLE_HEADER);
        let proxy_for = optional_header(headers, PROXY_PRINCIPAL_HEADER);
        let min_expiry = expiry_header(headers, MIN_EXPIRY_HEADER)?;
        let max_expiry = expiry_header(headers, MAX_EXPIRY_HEADER)?;

        let entry = role_service
            .get(&domain, &role, &proxy_for, min_expiry, max_expiry)
            .await?;

        let headers = req.headers_mut();
        for name in [
            DOMAIN_HEADER,
            ROLE_HEADER,
            PROXY_PRINCIPAL_HEADER,
            MIN_EXPIRY_HEADER,
            MAX_EXPIRY_HEADER,
        ] {
            headers.remove(name);
        }
        set_credential(headers, &self.cfg.role_auth_header, &entry.token)?;
        self.forward(req).await
    }

    /// Stream the request to its destination and the response back.
    async fn forward(&self, req: Request<Body>) -> Result<Response> {
        let destination = required_header(req.headers(), DESTINATION_HEADER)?;
        let url = Url::parse(&destination)
            .map_err(|e| Error::BadRequest(format!("invalid destination '{destination}': {e}")))?;

        let method = req.method().clone();
        let mut headers = req.headers().clone();
        headers.remove(DESTINATION_HEADER);
        for name in HOP_HEADERS {
            headers.remove(*name);
        }

        debug!(method = %method, url = %url, "proxying request");
        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()))
            .send()
            .await?;

        let mut builder = HttpResponse::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if !HOP_HEADERS.contains(&name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let buffer_size = self.cfg.buffer_size.max(1);
        let body = Body::from_stream(upstream.bytes_stream().flat_map(move |chunk| {
            let pieces: Vec<std::result::Result<Bytes, reqwest::Error>> = match chunk {
                Ok(mut bytes) => {
                    let mut out = Vec::with_capacity(bytes.len() / buffer_size + 1);
                    while bytes.len() > buffer_size {
                        out.push(Ok(bytes.split_to(buffer_size)));
                    }
                    out.push(Ok(bytes));
                    out
                }
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(pieces)
        }));

        builder
            .body(body)
            .map_err(|e| Error::Internal(format!("failed to build proxy response: {e}")))
    }
}

fn set_credential(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::try_from(name)
        .map_err(|e| Error::InvalidParameter(format!("invalid auth header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("credential not header-safe: {e}")))?;
    headers.remove(&name);
    headers.insert(name, value);
    Ok(())
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::BadRequest(format!("missing {name} header")))
}

fn optional_header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn expiry_header(headers: &HeaderMap, name: &str) -> Result<Option<u64>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| Error::BadRequest(format!("invalid {name} header"))),
    }
}
