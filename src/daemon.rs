//! Daemon supervisor
//!
//! Composes the credential services, starts their background refreshers
//! and the HTTP servers, fans every background error into one channel,
//! and tears the whole thing down on a shutdown signal.
//!
//! Initialization order matters: the N-Token provider comes first because
//! every other credential fetch authenticates with it.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt as _;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::CredentialProxy;
use crate::server::{self, AppState};
use crate::svccert::SvcCertService;
use crate::tls;
use crate::token::{AccessTokenService, NTokenProvider, RoleTokenService, TokenProvider};
use crate::{Error, Result};

/// The assembled sidecar (C7)
#[derive(Debug)]
pub struct Daemon {
    cfg: Config,
    state: Arc<AppState>,
    tls_config: Option<rustls::ServerConfig>,
}

impl Daemon {
    /// Build every enabled component.
    ///
    /// # Errors
    ///
    /// Configuration and initialization errors are fatal and surface
    /// here; nothing has been spawned yet when this returns an error.
    pub fn new(cfg: Config) -> Result<Self> {
        let ntoken = if cfg.ntoken.enable {
            Some(NTokenProvider::new(&cfg.ntoken)?)
        } else {
            None
        };

        let dependents = cfg.access_token.enable
            || cfg.role_token.enable
            || cfg.service_cert.enable
            || cfg.proxy.enable;
        if ntoken.is_none() && dependents {
            return Err(Error::FailedToInitialize(
                "sidecar: ntoken must be enabled when any other credential is".to_string(),
            ));
        }

        let token_provider: TokenProvider = match &ntoken {
            Some(provider) => provider.provider(),
            None => Arc::new(|| Err(Error::NoToken)),
        };
        let timeout = cfg.server.timeout;

        let access = if cfg.access_token.enable {
            let client = tls::new_http_client(
                &cfg.access_token.athenz_ca_path,
                &cfg.access_token.cert_path,
                timeout,
            )?;
            Some(AccessTokenService::new(
                &cfg.access_token,
                client,
                Arc::clone(&token_provider),
            )?)
        } else {
            None
        };

        let role = if cfg.role_token.enable {
            let client = tls::new_http_client(&cfg.role_token.athenz_ca_path, "", timeout)?;
            Some(RoleTokenService::new(
                &cfg.role_token,
                client,
                Arc::clone(&token_provider),
            )?)
        } else {
            None
        };

        let svccert = if cfg.service_cert.enable {
            let client = tls::new_http_client(&cfg.service_cert.athenz_ca_path, "", timeout)?;
            Some(SvcCertService::new(
                &cfg.service_cert,
                &cfg.ntoken,
                client,
                Arc::clone(&token_provider),
            )?)
        } else {
            None
        };

        let proxy = if cfg.proxy.enable {
            let client = tls::new_http_client("", "", timeout)?;
            Some(CredentialProxy::new(
                &cfg.proxy,
                client,
                Arc::clone(&token_provider),
                role.clone(),
            )?)
        } else {
            None
        };

        let tls_config = if cfg.server.tls.enable {
            Some(tls::new_tls_config(&cfg.server.tls)?)
        } else {
            None
        };

        let state = Arc::new(AppState {
            ntoken,
            access,
            role,
            svccert,
            proxy,
        });

        Ok(Self {
            cfg,
            state,
            tls_config,
        })
    }

    /// Spawn refreshers and servers; background errors arrive on the
    /// returned channel. Each server task emits `Error::Shutdown` once it
    /// has drained.
    pub fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> mpsc::Receiver<Error> {
        let (err_tx, err_rx) = mpsc::channel(64);

        if let Some(ntoken) = &self.state.ntoken {
            tokio::spawn(Arc::clone(ntoken).run(shutdown_tx.subscribe(), err_tx.clone()));
        }
        if let Some(access) = &self.state.access {
            tokio::spawn(Arc::clone(access).run(shutdown_tx.subscribe(), err_tx.clone()));
        }
        if let Some(role) = &self.state.role {
            tokio::spawn(Arc::clone(role).run(shutdown_tx.subscribe(), err_tx.clone()));
        }
        if let Some(svccert) = &self.state.svccert {
            tokio::spawn(Arc::clone(svccert).run(shutdown_tx.subscribe(), err_tx.clone()));
        }

        let router = server::build_router(&self.cfg.server, Arc::clone(&self.state));
        let api_addr = format!("{}:{}", self.cfg.server.address, self.cfg.server.port);
        match &self.tls_config {
            Some(tls_config) => {
                tokio::spawn(serve_tls(
                    api_addr,
                    router,
                    tls_config.clone(),
                    shutdown_tx.subscribe(),
                    err_tx.clone(),
                ));
            }
            None => {
                tokio::spawn(serve_plain(
                    api_addr,
                    router,
                    self.cfg.server.shutdown_delay,
                    shutdown_tx.subscribe(),
                    err_tx.clone(),
                ));
            }
        }

        let health = &self.cfg.server.health_check;
        if health.port > 0 {
            let health_addr = format!("{}:{}", health.address, health.port);
            tokio::spawn(serve_plain(
                health_addr,
                server::health_router(&health.endpoint),
                Duration::ZERO,
                shutdown_tx.subscribe(),
                err_tx.clone(),
            ));
        }

        err_rx
    }

    /// Number of server tasks [`start`](Self::start) spawns; used to wait
    /// for their shutdown markers during teardown.
    fn server_count(&self) -> usize {
        1 + usize::from(self.cfg.server.health_check.port > 0)
    }

    /// Run until a termination signal or a fatal background error.
    ///
    /// Refresh errors are logged and absorbed; shutdown markers are
    /// filtered unconditionally, so a signal-triggered teardown reports
    /// clean exit even when several tasks observe the cancellation.
    ///
    /// # Errors
    ///
    /// Returns the first fatal background error (server bind/serve
    /// failure).
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let err_rx = self.start(&shutdown_tx);

        tokio::spawn(watch_signals(shutdown_tx.clone()));

        let drain = self.cfg.server.shutdown_delay + self.cfg.server.shutdown_timeout;
        supervise(err_rx, shutdown_tx, self.server_count(), drain).await
    }
}

/// Fan-in loop: absorb refresh errors, stop on shutdown or fatal error,
/// then wait (bounded) for the servers to drain.
async fn supervise(
    mut err_rx: mpsc::Receiver<Error>,
    shutdown_tx: broadcast::Sender<()>,
    mut servers_running: usize,
    drain_deadline: Duration,
) -> Result<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    let failure = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break None,
            maybe = err_rx.recv() => match maybe {
                None => return Ok(()),
                Some(err) if err.is_shutdown() => {
                    servers_running = servers_running.saturating_sub(1);
                    if servers_running == 0 {
                        return Ok(());
                    }
                }
                Some(err) if is_fatal(&err) => {
                    error!(error = %err, "fatal background error, shutting down");
                    let _ = shutdown_tx.send(());
                    break Some(err);
                }
                Some(err) => warn!(error = %err, "credential refresh error"),
            },
        }
    };

    // Shutdown in progress: wait for every server to report back.
    let drain = async {
        while servers_running > 0 {
            match err_rx.recv().await {
                None => break,
                Some(err) if err.is_shutdown() => servers_running -= 1,
                Some(err) => debug!(error = %err, "error during shutdown"),
            }
        }
    };
    if tokio::time::timeout(drain_deadline, drain).await.is_err() {
        warn!("graceful shutdown deadline exceeded");
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Whether a background error should take the daemon down
fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::FailedToInitialize(_) | Error::Internal(_) | Error::Io(_) | Error::Config(_)
    )
}

/// Serve a router over cleartext HTTP with graceful shutdown.
async fn serve_plain(
    addr: String,
    router: Router,
    shutdown_delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
    err_tx: mpsc::Sender<Error>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = err_tx
                .send(Error::FailedToInitialize(format!("server bind {addr}: {e}")))
                .await;
            return;
        }
    };
    info!(addr = %addr, "server listening");

    let graceful = async move {
        let _ = shutdown.recv().await;
        // Let the load balancer observe the dying health check first.
        tokio::time::sleep(shutdown_delay).await;
    };

    match axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        Ok(()) => {
            let _ = err_tx.send(Error::Shutdown).await;
        }
        Err(e) => {
            let _ = err_tx
                .send(Error::Internal(format!("server {addr} failed: {e}")))
                .await;
        }
    }
}

/// Serve a router over TLS: accept loop, handshake per connection, hyper
/// connection driver.
async fn serve_tls(
    addr: String,
    router: Router,
    tls_config: rustls::ServerConfig,
    mut shutdown: broadcast::Receiver<()>,
    err_tx: mpsc::Sender<Error>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = err_tx
                .send(Error::FailedToInitialize(format!("server bind {addr}: {e}")))
                .await;
            return;
        }
    };
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    info!(addr = %addr, "server listening (TLS)");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                        router.clone().oneshot(request.map(Body::new))
                    });
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }

    let _ = err_tx.send(Error::Shutdown).await;
}

/// Resolve on SIGTERM or Ctrl+C and broadcast the shutdown.
async fn watch_signals(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received interrupt signal"),
        () = terminate => info!("received termination signal"),
    }

    let _ = shutdown_tx.send(());
}
