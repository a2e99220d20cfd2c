//! Credential acquisition and caching
//!
//! - [`ntoken`]: the self-signed principal token every other credential
//!   fetch authenticates with
//! - [`access`]: OAuth2-style access tokens, cached per scope
//! - [`role`]: role tokens, cached per role set

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::time::sleep;
use tracing::debug;

use crate::config::RetryConfig;
use crate::error::FetchError;

pub mod access;
pub mod ntoken;
pub mod role;

pub use access::{AccessTokenEntry, AccessTokenService};
pub use ntoken::NTokenProvider;
pub use role::{RoleTokenEntry, RoleTokenService};

/// Header carrying the N-Token on requests to the IDP token APIs
pub const PRINCIPAL_AUTH_HEADER: &str = "Athenz-Principal-Auth";

/// Function handing out the current N-Token.
///
/// The N-Token provider is initialized first and every other credential
/// fetcher receives one of these instead of a reference to the provider
/// itself, which keeps the fetchers independently testable.
pub type TokenProvider = Arc<dyn Fn() -> crate::Result<String> + Send + Sync>;

/// Run `f` under the configured fixed-delay retry budget.
///
/// `attempts` bounds the total number of tries; a missing N-Token is not
/// retried because no upstream call was made.
pub(crate) async fn with_retry<T, F, Fut>(retry: &RetryConfig, f: F) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = retry.attempts.max(1);
    let mut backoff = fixed_backoff(retry.delay);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(FetchError::NoToken) => return Err(FetchError::NoToken),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "upstream fetch failed, retrying");
                let delay = backoff.next_backoff().unwrap_or(retry.delay);
                sleep(delay).await;
            }
        }
    }
}

/// Cap stored upstream error bodies so a misbehaving IDP cannot bloat logs
pub(crate) fn truncate(mut body: String) -> String {
    const MAX: usize = 4096;
    if body.len() > MAX {
        body.truncate(MAX);
    }
    body
}

/// Fixed-delay backoff (multiplier 1, no jitter, no elapsed-time cap)
fn fixed_backoff(delay: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: delay,
        initial_interval: delay,
        max_interval: delay,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let calls = AtomicU32::new(0);
        let got = with_retry(&retry(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FetchError>(7u32)
        })
        .await
        .unwrap();
        assert_eq!(got, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&retry(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(FetchError::Upstream {
                status: 500,
                body: "boom".to_string(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Upstream { status: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_mid_budget() {
        let calls = AtomicU32::new(0);
        let got = with_retry(&retry(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(FetchError::Upstream {
                        status: 503,
                        body: String::new(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_token_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&retry(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(FetchError::NoToken)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::NoToken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = with_retry(&retry(0), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FetchError>(())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
