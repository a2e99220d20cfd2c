//! HTTP handler surface
//!
//! Exposes the credential endpoints over axum. Routes are registered only
//! for credentials the configuration enables. Every route runs under the
//! same per-handler guard: a method allow-list (`"*"` matches any
//! method), the configured handler timeout, and translation of handler
//! errors into the documented status codes.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::ServerConfig;
use crate::proxy::CredentialProxy;
use crate::svccert::SvcCertService;
use crate::token::{AccessTokenService, NTokenProvider, RoleTokenService};
use crate::{Error, Result};

pub mod handlers;

/// Shared application state
#[derive(Debug)]
pub struct AppState {
    /// N-Token provider, when enabled
    pub ntoken: Option<Arc<NTokenProvider>>,
    /// Access-token service, when enabled
    pub access: Option<Arc<AccessTokenService>>,
    /// Role-token service, when enabled
    pub role: Option<Arc<RoleTokenService>>,
    /// Service-certificate manager, when enabled
    pub svccert: Option<Arc<SvcCertService>>,
    /// Credential-injecting proxy, when enabled
    pub proxy: Option<Arc<CredentialProxy>>,
}

/// Build the API router from the enabled credential services.
pub fn build_router(cfg: &ServerConfig, state: Arc<AppState>) -> Router {
    let timeout = cfg.timeout;
    let mut router = Router::new();

    if state.ntoken.is_some() {
        router = router.route(
            "/ntoken",
            guard(&["GET"], "/ntoken", timeout, Arc::clone(&state), handlers::ntoken),
        );
    }
    if state.access.is_some() {
        router = router.route(
            "/accesstoken",
            guard(
                &["POST"],
                "/accesstoken",
                timeout,
                Arc::clone(&state),
                handlers::access_token,
            ),
        );
    }
    if state.role.is_some() {
        router = router.route(
            "/roletoken",
            guard(
                &["POST"],
                "/roletoken",
                timeout,
                Arc::clone(&state),
                handlers::role_token,
            ),
        );
    }
    if state.svccert.is_some() {
        router = router.route(
            "/svccert",
            guard(&["GET"], "/svccert", timeout, Arc::clone(&state), handlers::svccert),
        );
    }
    if state.proxy.is_some() {
        router = router
            .route(
                "/proxy/roletoken",
                guard(
                    &["*"],
                    "/proxy/roletoken",
                    timeout,
                    Arc::clone(&state),
                    handlers::role_token_proxy,
                ),
            )
            .route(
                "/proxy/ntoken",
                guard(
                    &["*"],
                    "/proxy/ntoken",
                    timeout,
                    Arc::clone(&state),
                    handlers::ntoken_proxy,
                ),
            );
    }

    router.layer(TraceLayer::new_for_http())
}

/// Build the health-check router.
///
/// Responds `200 OK` with an empty plain-text body on the configured
/// endpoint path.
pub fn health_router(endpoint: &str) -> Router {
    let path = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };
    Router::new().route(
        &path,
        axum::routing::get(|| async {
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain;charset=UTF-8")],
                "",
            )
        }),
    )
}

/// Wrap a handler with the per-route guard: method allow-list, handler
/// timeout, and error translation.
fn guard<F, Fut>(
    methods: &'static [&'static str],
    path: &'static str,
    timeout: Duration,
    state: Arc<AppState>,
    handler: F,
) -> axum::routing::MethodRouter
where
    F: Fn(Arc<AppState>, Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    any(move |req: Request<Body>| {
        let state = Arc::clone(&state);
        let handler = handler.clone();
        async move {
            let m = req.method().as_str().to_owned();
            if !methods.iter().any(|&allowed| allowed == "*" || allowed == m) {
                return error_response(&Error::MethodNotAllowed(m));
            }

            match tokio::time::timeout(timeout, handler(state, req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => error_response(&err),
                Err(_) => {
                    error!("Handler Time Out: {path}");
                    error_response(&Error::HandlerTimeout(path.to_string()))
                }
            }
        }
    })
}

/// Translate a handler error into its documented response shape.
///
/// Method mismatches and 500s answer with tab-separated text bodies;
/// other statuses carry a JSON envelope `{message, status}`.
fn error_response(err: &Error) -> Response {
    let status = err.status();
    if let Error::MethodNotAllowed(m) = err {
        return (
            status,
            [(header::CONTENT_TYPE, "text/plain;charset=UTF-8")],
            format!("Method: {m}\tMethod Not Allowed\n"),
        )
            .into_response();
    }
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        let text = status.canonical_reason().unwrap_or("Internal Server Error");
        return (
            status,
            [(header::CONTENT_TYPE, "text/plain;charset=UTF-8")],
            format!("Error: {err}\t{text}\n"),
        )
            .into_response();
    }

    (
        status,
        axum::Json(serde_json::json!({
            "message": err.to_string(),
            "status": status.as_u16(),
        })),
    )
        .into_response()
}
