//! Volume Pool Operator
//!
//! Reconciles VolumePools against Rook/Ceph block pools and publishes the
//! storage classes, credentials and VolumeClasses of every available pool.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     volume-pool-operator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  event sources ──► work queue ──► VolumePoolReconciler        │
//! │        │                                                      │
//! │        └──► VolumeClassRegistry ──► REST API (:8090)          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  health (:8081)                            metrics (:8080)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_pool_operator::announcer::announce_pool;
use volume_pool_operator::api::{run_rest_server, OperatorInfoResponse};
use volume_pool_operator::{
    Backends, ConfigOverrides, Error, MemoryBackend, Metrics, Operator, OperatorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Pool Operator - VolumePools backed by Rook/Ceph block pools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags override its values
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Provider scheme handled by this operator (e.g. `ceph`)
    #[arg(long, env = "PROVIDER")]
    provider: Option<String>,

    /// Cluster id prefixed to backend pool names
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Namespace of the Rook resources
    #[arg(long, env = "ROOK_NAMESPACE")]
    rook_namespace: Option<String>,

    /// CSI driver named by the published classes
    #[arg(long, env = "CSI_DRIVER_NAME")]
    csi_driver_name: Option<String>,

    /// Label selector (`k=v,k2=v2`) of advertised VolumeClasses
    #[arg(long, env = "VOLUME_CLASS_SELECTOR")]
    volume_class_selector: Option<String>,

    /// Enable RBD statistics on created block pools
    #[arg(long, env = "ENABLE_RBD_STATS")]
    enable_rbd_stats: Option<bool>,

    /// Full relist period (e.g. `30s`, `5m`, `1h`)
    #[arg(long, env = "RESYNC_INTERVAL")]
    resync_interval: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Announce this VolumePool at startup
    #[arg(long, env = "ANNOUNCE_POOL")]
    announce_pool: Option<String>,

    /// Replication of the announced VolumePool
    #[arg(long, env = "ANNOUNCE_REPLICATION")]
    announce_replication: Option<u32>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against in-memory stores (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            provider: self.provider.clone(),
            cluster_id: self.cluster_id.clone(),
            rook_namespace: self.rook_namespace.clone(),
            csi_driver_name: self.csi_driver_name.clone(),
            volume_class_selector: self.volume_class_selector.clone(),
            enable_rbd_stats: self.enable_rbd_stats,
            resync_interval: self.resync_interval.clone(),
            workers: self.workers,
            announce_pool: self.announce_pool.clone(),
            announce_replication: self.announce_replication,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    }
    .with_overrides(args.overrides());
    let settings = config.settings()?;

    info!("Starting Volume Pool Operator");
    info!("  Version: {}", volume_pool_operator::VERSION);
    info!("  Provider: {}", config.provider);
    info!("  Cluster ID: {}", config.cluster_id);
    info!("  Rook namespace: {}", config.rook_namespace);
    info!("  Standalone mode: {}", args.standalone);

    let metrics = Arc::new(Metrics::new(prometheus::default_registry())?);

    let backends = if args.standalone {
        warn!("Running against in-memory stores, nothing is written to a cluster");
        MemoryBackend::new(&config.rook_namespace).backends()
    } else {
        let client = kube::Client::try_default().await?;
        info!("Connected to Kubernetes API");
        Backends::kubernetes(client, &config.rook_namespace)
    };

    if let Some(pool) = &config.announce_pool {
        announce_pool(
            backends.stores.volume_pools.as_ref(),
            &config.provider,
            pool,
            config.announce_replication,
        )
        .await?;
    }

    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let operator = Operator::new(settings, backends, Some(metrics));

    // Start REST API
    let api_addr = parse_addr(&args.api_addr, "REST API")?;
    let info = OperatorInfoResponse {
        name: volume_pool_operator::NAME.to_string(),
        version: volume_pool_operator::VERSION.to_string(),
        provider: config.provider.clone(),
        cluster_id: config.cluster_id.clone(),
        rook_namespace: config.rook_namespace.clone(),
        csi_driver_name: config.csi_driver_name.clone(),
        volume_class_selector: config.volume_class_selector.clone(),
    };
    let api = tokio::spawn(run_rest_server(api_addr, operator.registry(), info, cancel.clone()));

    // Stop on Ctrl-C
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_cancel.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    let result = operator.run(cancel.clone()).await;
    ready.store(false, Ordering::SeqCst);
    cancel.cancel();

    match api.await {
        Ok(Err(e)) => error!("REST API error: {}", e),
        Err(e) => error!("REST API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Operator shutdown complete");
    result
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {:?}: {}", what, addr, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info", "axum=info"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", directive, e)))?,
        );
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let mut response = Response::new(Body::empty());
            match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, content_type);
                            }
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            *response.body_mut() = Body::from(e.to_string());
                        }
                    }
                }
                _ => {
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    *response.body_mut() = Body::from("not found");
                }
            }
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
