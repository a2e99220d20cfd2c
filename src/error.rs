//! Error types for the Athenz sidecar

use std::io;
use std::sync::Arc;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the sidecar
pub type Result<T> = std::result::Result<T, Error>;

/// Sidecar errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration value failed validation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration schema version does not match this build
    #[error("invalid sidecar configuration version")]
    InvalidConfigVersion,

    /// TLS cert or key is missing from the configured paths
    #[error("Cert/Key path not found")]
    TlsCertOrKeyNotFound,

    /// Private key could not be read or parsed
    #[error("Failed to load private key: {0}")]
    LoadPrivateKey(String),

    /// A component could not be initialized
    #[error("Failed to initialize {0}")]
    FailedToInitialize(String),

    /// The requested credential is turned off by configuration
    #[error("{0} is disabled by configuration")]
    Disabled(&'static str),

    /// The IDP answered with a non-2xx status
    #[error("request error: status {status}, body {body}")]
    Upstream {
        /// HTTP status returned by the IDP
        status: u16,
        /// Response body (truncated at read time)
        body: String,
    },

    /// No N-Token is available to authenticate the upstream call
    #[error("N-Token is not available")]
    NoToken,

    /// The IDP returned a certificate that could not be parsed
    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    /// An inbound handler exceeded its configured deadline
    #[error("Handler Time Out: {0}")]
    HandlerTimeout(String),

    /// Request method is not in the route's allow-list
    #[error("Method Not Allowed")]
    MethodNotAllowed(String),

    /// Malformed request body or missing required field
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Cancellation marker emitted by background tasks during shutdown
    #[error("sidecar shutdown")]
    Shutdown,
}

impl Error {
    /// HTTP status this error translates to on the handler surface
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Upstream { .. } | Self::Http(_) | Self::InvalidCert(_) => StatusCode::BAD_GATEWAY,
            Self::NoToken | Self::HandlerTimeout(_) | Self::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is the shutdown cancellation marker
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Upstream-fetch failure that can be broadcast through the single-flight
/// group (the crate-wide [`Error`] is not `Clone`).
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// No N-Token was available; the upstream call was not attempted
    #[error("N-Token is not available")]
    NoToken,

    /// Non-2xx answer from the IDP
    #[error("request error: status {status}, body {body}")]
    Upstream {
        /// HTTP status returned by the IDP
        status: u16,
        /// Response body
        body: String,
    },

    /// Transport-level failure (connect, timeout, TLS)
    #[error("request error: {0}")]
    Network(Arc<str>),
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NoToken => Self::NoToken,
            FetchError::Upstream { status, body } => Self::Upstream { status, body },
            // Transport failures surface like any other upstream failure.
            FetchError::Network(msg) => Self::Upstream {
                status: 502,
                body: msg.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(Arc::from(e.to_string()))
    }
}
