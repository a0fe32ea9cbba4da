//! gatewarden-daemon — external-data provider for Kubernetes admission
//! control.
//!
//! The daemon serves the verify/mutate/healthz endpoints consumed by the
//! policy controller, optionally over TLS with certificates reloaded from
//! disk on every handshake, and exposes Prometheus metrics on a separate
//! localhost port. `SIGTERM`/`SIGINT` trigger a graceful shutdown with a
//! bounded drain of in-flight requests; the process exits 0 on a clean
//! shutdown and non-zero when startup fails.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use gatewarden_core::executor::config::ExecutorConfig;
use gatewarden_core::executor::core::CoreExecutor;
use gatewarden_core::executor::{Executor, GetExecutor};
use gatewarden_daemon::metrics::{MetricsBackend, MetricsRegistry};
use gatewarden_daemon::server::{Server, ServerConfig, DEFAULT_MUTATION_STORE};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// gatewarden daemon - external-data verification provider
#[derive(Parser, Debug)]
#[command(name = "gatewarden-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address the provider HTTP server binds
    #[arg(long = "http", default_value = "127.0.0.1:6001")]
    http: SocketAddr,

    /// Directory holding tls.crt and tls.key; enables TLS when set
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// CA bundle used to require and verify client certificates
    #[arg(long)]
    ca_cert_file: Option<PathBuf>,

    /// How long verification results stay cached; 0 disables caching
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    cache_ttl: Duration,

    /// Metrics backend to expose
    #[arg(long, default_value = "prometheus")]
    metrics_backend: String,

    /// Port for the metrics endpoint (bound to localhost)
    #[arg(long, default_value_t = 8888)]
    metrics_port: u16,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Executor configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Install the rustls crypto provider before any TLS configuration is
    // built; rustls panics on its first handshake otherwise.
    rustls::crypto::ring::default_provider().install_default().ok();

    let executor_config = match &args.config {
        Some(path) => ExecutorConfig::from_file(path).with_context(|| {
            format!("failed to load executor config from {}", path.display())
        })?,
        None => {
            info!("no executor config file given, using defaults");
            ExecutorConfig::default()
        }
    };
    let mutation_store_name = executor_config
        .mutation_store
        .clone()
        .unwrap_or_else(|| DEFAULT_MUTATION_STORE.to_string());

    let executor: Arc<dyn Executor> = Arc::new(
        CoreExecutor::builder().config(executor_config).build(),
    );
    let get_executor: GetExecutor = Arc::new(move || Arc::clone(&executor));

    let mut server_config = ServerConfig::new(args.http);
    server_config.cert_dir = args.cert_dir.clone();
    server_config.ca_cert_file = args.ca_cert_file.clone();
    server_config.cache_ttl = args.cache_ttl;
    server_config.mutation_store_name = mutation_store_name;

    let mut server = Server::new(server_config, get_executor);

    if args.no_metrics {
        info!("metrics endpoint disabled");
    } else {
        let backend: MetricsBackend = args
            .metrics_backend
            .parse()
            .context("unsupported metrics backend")?;
        let registry =
            Arc::new(MetricsRegistry::new().context("failed to initialize metrics registry")?);
        server = server.with_request_metrics(registry.request_metrics());

        let metrics_addr: SocketAddr = ([127, 0, 0, 1], args.metrics_port).into();
        info!(backend = %backend, addr = %metrics_addr, "starting metrics server");
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(registry, metrics_addr).await {
                error!(error = %err, "metrics server error");
            }
        });
    }

    info!(
        addr = %args.http,
        pid = std::process::id(),
        "gatewarden daemon started"
    );
    server.run().await.context("provider server failed")?;

    info!("daemon shutdown complete");
    Ok(())
}

/// Serves the Prometheus text exposition on localhost.
async fn run_metrics_server(registry: Arc<MetricsRegistry>, addr: SocketAddr) -> Result<()> {
    let metrics_handler = {
        let registry = Arc::clone(&registry);
        move || {
            let registry = Arc::clone(&registry);
            async move {
                match registry.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(err) => {
                        error!(error = %err, "failed to encode metrics");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("failed to encode metrics: {err}"),
                        )
                            .into_response()
                    }
                }
            }
        }
    };

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;
    axum::serve(listener, app)
        .await
        .context("metrics server error")?;
    Ok(())
}
