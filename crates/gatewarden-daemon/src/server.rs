//! Provider server lifecycle.
//!
//! The server binds one listener and serves the provider endpoints over
//! plain TCP or, when a cert directory is configured, over TLS with the key
//! pair re-read per handshake. `SIGTERM` or `SIGINT` stops the accept loop;
//! connections already open get a graceful drain window to finish their
//! in-flight exchanges and are closed forcibly when the drain deadline
//! elapses. Requesting shutdown more than once is harmless.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use gatewarden_core::executor::GetExecutor;
use gatewarden_core::provider::ProviderHandler;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::metrics::RequestMetrics;
use crate::tls::{self, TlsConfigError};

/// How long in-flight connections get to finish after shutdown is
/// requested.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TTL for the verification result cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Store the mutate endpoint resolves digests through unless configured
/// otherwise.
pub const DEFAULT_MUTATION_STORE: &str = "oras";

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The requested address.
        address: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The TLS configuration could not be built.
    #[error(transparent)]
    Tls(#[from] TlsConfigError),
}

/// Construction parameters for [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the provider endpoints listen on.
    pub address: SocketAddr,
    /// Directory holding `tls.crt`/`tls.key`; enables TLS when set.
    pub cert_dir: Option<PathBuf>,
    /// CA bundle for required client certificate verification.
    pub ca_cert_file: Option<PathBuf>,
    /// TTL for the verification result cache; zero disables caching.
    pub cache_ttl: Duration,
    /// Name of the store the mutate endpoint uses.
    pub mutation_store_name: String,
    /// Drain window for in-flight connections on shutdown.
    pub drain_timeout: Duration,
}

impl ServerConfig {
    /// Creates a config for `address` with the stock defaults.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            cert_dir: None,
            ca_cert_file: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            mutation_store_name: DEFAULT_MUTATION_STORE.to_string(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// The provider HTTP server.
pub struct Server {
    config: ServerConfig,
    get_executor: GetExecutor,
    request_metrics: Option<Arc<RequestMetrics>>,
}

impl Server {
    /// Creates a server over the given executor factory.
    #[must_use]
    pub fn new(config: ServerConfig, get_executor: GetExecutor) -> Self {
        Self {
            config,
            get_executor,
            request_metrics: None,
        }
    }

    /// Attaches request metrics recording.
    #[must_use]
    pub fn with_request_metrics(mut self, metrics: Arc<RequestMetrics>) -> Self {
        self.request_metrics = Some(metrics);
        self
    }

    /// Builds the router for the provider endpoints, with metrics
    /// middleware when configured.
    #[must_use]
    pub fn router(&self) -> Router {
        let provider = ProviderHandler::new(
            Arc::clone(&self.get_executor),
            self.config.cache_ttl,
            self.config.mutation_store_name.clone(),
        );
        let mut router = provider.router();
        if let Some(metrics) = &self.request_metrics {
            router = router.layer(middleware::from_fn_with_state(
                Arc::clone(metrics),
                record_request,
            ));
        }
        router
    }

    /// Binds the configured address and serves until a termination signal
    /// arrives, then drains.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound and
    /// [`ServerError::Tls`] when the TLS configuration is unusable.
    pub async fn run(self) -> Result<(), ServerError> {
        let address = self.config.address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind { address, source })?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves, then
    /// drains in-flight connections within the configured window.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] when the TLS configuration is unusable.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let app = self.router();
        let tls_acceptor = match &self.config.cert_dir {
            Some(cert_dir) => {
                let server_config =
                    tls::build_server_config(cert_dir, self.config.ca_cert_file.as_deref())?;
                Some(TlsAcceptor::from(Arc::new(server_config)))
            }
            None => None,
        };

        info!(
            address = ?listener.local_addr().ok(),
            tls = tls_acceptor.is_some(),
            client_auth = self.config.ca_cert_file.is_some(),
            cache_ttl_secs = self.config.cache_ttl.as_secs(),
            "provider server listening"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        });

        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let app = app.clone();
                            let conn_shutdown = shutdown_rx.clone();
                            match tls_acceptor.clone() {
                                Some(acceptor) => {
                                    connections.spawn(serve_tls_connection(
                                        stream, peer, acceptor, app, conn_shutdown,
                                    ));
                                }
                                None => {
                                    connections.spawn(serve_connection(
                                        stream, app, conn_shutdown,
                                    ));
                                }
                            }
                        }
                        Err(error) => warn!(error = %error, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!(in_flight = connections.len(), "shutdown requested, draining connections");
                    break;
                }
                // Reap finished connection tasks so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // New connections are refused from here on.
        drop(listener);

        let drain_started = Instant::now();
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        match drained {
            Ok(()) => info!(
                drain_ms = u64::try_from(drain_started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "connections drained"
            ),
            Err(_) => {
                warn!(
                    drain_secs = self.config.drain_timeout.as_secs(),
                    remaining = connections.len(),
                    "drain deadline elapsed, closing remaining connections"
                );
                connections.shutdown().await;
            }
        }
        info!("provider server stopped");
        Ok(())
    }
}

/// Resolves when the process receives `SIGTERM` or `SIGINT`.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

/// Serves one connection, finishing its in-flight exchange before closing
/// when shutdown fires.
async fn serve_connection<I>(io: I, app: Router, mut shutdown: watch::Receiver<bool>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app);
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    let mut conn = std::pin::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(error) = result {
                debug!(error = %error, "connection ended with error");
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = conn.as_mut().await {
                debug!(error = %error, "connection ended during drain");
            }
        }
    }
}

async fn serve_tls_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: watch::Receiver<bool>,
) {
    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => serve_connection(tls_stream, app, shutdown).await,
        Ok(Err(error)) => warn!(%peer, error = %error, "TLS handshake failed"),
        Err(_) => warn!(%peer, "TLS handshake timed out"),
    }
}

/// Middleware recording latency and status per endpoint.
async fn record_request(
    State(metrics): State<Arc<RequestMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = request.uri().path().to_owned();
    let started = Instant::now();
    let response = next.run(request).await;
    metrics.observe(
        &endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
mod tests {
    use gatewarden_core::executor::core::CoreExecutor;
    use gatewarden_core::executor::Executor;

    use super::*;

    fn noop_executor() -> GetExecutor {
        let executor: Arc<dyn Executor> = Arc::new(CoreExecutor::builder().build());
        Arc::new(move || Arc::clone(&executor))
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::new("127.0.0.1:6001".parse().unwrap());
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(config.mutation_store_name, DEFAULT_MUTATION_STORE);
        assert!(config.cert_dir.is_none());
        assert!(config.ca_cert_file.is_none());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = occupied.local_addr().unwrap();

        let server = Server::new(ServerConfig::new(address), noop_executor());
        let error = server.run().await.unwrap_err();
        assert!(matches!(error, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn unusable_cert_dir_fails_before_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ServerConfig::new(listener.local_addr().unwrap());
        config.cert_dir = Some(PathBuf::from("/nonexistent/certs"));

        let server = Server::new(config, noop_executor());
        let error = server
            .serve_with_shutdown(listener, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(error, ServerError::Tls(_)));
    }

    #[test]
    fn router_builds_with_and_without_metrics() {
        let server = Server::new(
            ServerConfig::new("127.0.0.1:6001".parse().unwrap()),
            noop_executor(),
        );
        let _plain = server.router();

        let registry = crate::metrics::MetricsRegistry::new().unwrap();
        let server = server.with_request_metrics(registry.request_metrics());
        let _with_metrics = server.router();
    }
}
