//! Endpoint handlers
//!
//! Handlers parse the request, call into the credential services, and
//! shape the documented response bodies. Error translation and timeouts
//! happen in the surrounding route guard.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::{Error, Result};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct AccessTokenRequest {
    domain: String,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    proxy_for_principal: Option<String>,
    #[serde(default)]
    expiry: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RoleTokenRequest {
    domain: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    proxy_for_principal: Option<String>,
    #[serde(default)]
    min_expiry: Option<u64>,
    #[serde(default)]
    max_expiry: Option<u64>,
}

/// GET /ntoken
pub(crate) async fn ntoken(state: Arc<AppState>, _req: Request<Body>) -> Result<Response> {
    let provider = state.ntoken.as_ref().ok_or(Error::Disabled("ntoken"))?;
    let token = provider.token()?;
    Ok(Json(json!({ "token": token })).into_response())
}

/// POST /accesstoken
pub(crate) async fn access_token(state: Arc<AppState>, req: Request<Body>) -> Result<Response> {
    let service = state.access.as_ref().ok_or(Error::Disabled("accessToken"))?;
    let body: AccessTokenRequest = parse_body(req).await?;

    let entry = service
        .get(
            &body.domain,
            body.service.as_deref().unwrap_or(""),
            body.proxy_for_principal.as_deref().unwrap_or(""),
            body.expiry,
        )
        .await?;
    Ok(Json(entry).into_response())
}

/// POST /roletoken
pub(crate) async fn role_token(state: Arc<AppState>, req: Request<Body>) -> Result<Response> {
    let service = state.role.as_ref().ok_or(Error::Disabled("roleToken"))?;
    let body: RoleTokenRequest = parse_body(req).await?;

    let entry = service
        .get(
            &body.domain,
            body.role.as_deref().unwrap_or(""),
            body.proxy_for_principal.as_deref().unwrap_or(""),
            body.min_expiry,
            body.max_expiry,
        )
        .await?;
    Ok(Json(entry).into_response())
}

/// GET /svccert
pub(crate) async fn svccert(state: Arc<AppState>, _req: Request<Body>) -> Result<Response> {
    let service = state.svccert.as_ref().ok_or(Error::Disabled("serviceCert"))?;
    let pem = service.get().await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        pem,
    )
        .into_response())
}

/// ANY /proxy/ntoken
pub(crate) async fn ntoken_proxy(state: Arc<AppState>, req: Request<Body>) -> Result<Response> {
    let proxy = state.proxy.as_ref().ok_or(Error::Disabled("proxy"))?;
    proxy.forward_ntoken(req).await
}

/// ANY /proxy/roletoken
pub(crate) async fn role_token_proxy(state: Arc<AppState>, req: Request<Body>) -> Result<Response> {
    let proxy = state.proxy.as_ref().ok_or(Error::Disabled("proxy"))?;
    proxy.forward_role_token(req).await
}

/// Read and deserialize a JSON request body; malformed input is a 400.
async fn parse_body<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::BadRequest(e.to_string()))
}
