//! LensCache Service
//!
//! Runs an analysis cache over in-memory tiers with its background sweeper
//! and the operational endpoints around it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        LensCache Service                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ AnalysisCache│───▶│ExpirySweeper │    │   Metrics    │       │
//! │  │ (tiers, LSH, │    │ (tombstones) │    │  /metrics    │       │
//! │  │ single-flight│    └──────────────┘    │  /healthz    │       │
//! │  └──────────────┘                        └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lenscache::adapters::LoggingEventPublisher;
use lenscache::cache::{AnalysisCache, ExpirySweeper, InMemoryDurableStore, InMemoryVolatileStore};
use lenscache::config::{parse_duration, CacheConfig};
use lenscache::error::{Error, Result};
use lenscache::exporter::MetricsExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// LensCache - perceptual-fingerprint analysis cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML)
    #[arg(long, short, env = "LENSCACHE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override the similarity threshold (bits)
    #[arg(long, env = "SIMILARITY_THRESHOLD_BITS", global = true)]
    similarity_threshold_bits: Option<u32>,

    /// Override the durable record lifetime ("30d", "12h", ...)
    #[arg(long, env = "DURABLE_TTL", global = true)]
    durable_ttl: Option<String>,

    /// Override the volatile copy lifetime
    #[arg(long, env = "VOLATILE_TTL", global = true)]
    volatile_ttl: Option<String>,

    /// Run with the durable tier only
    #[arg(long, env = "DISABLE_VOLATILE_TIER", global = true)]
    disable_volatile_tier: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache service
    Serve(ServeArgs),
    /// Print the effective configuration and exit
    CheckConfig,
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = effective_config(&args)?;

    match &args.command {
        Command::CheckConfig => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
            Ok(())
        }
        Command::Serve(serve_args) => serve(config, serve_args).await,
    }
}

/// File (or defaults) with command-line overrides applied, validated
fn effective_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };

    if let Some(bits) = args.similarity_threshold_bits {
        config.similarity_threshold_bits = bits;
    }
    if let Some(ttl) = &args.durable_ttl {
        config.durable_ttl = parse_duration(ttl)?;
    }
    if let Some(ttl) = &args.volatile_ttl {
        config.volatile_ttl = parse_duration(ttl)?;
    }
    if args.disable_volatile_tier {
        config.enable_volatile_tier = false;
    }

    config.validate()?;
    Ok(config)
}

async fn serve(config: CacheConfig, args: &ServeArgs) -> Result<()> {
    info!("Starting LensCache");
    info!("  Similarity threshold: {} bits", config.similarity_threshold_bits);
    info!("  Durable TTL: {:?}", config.durable_ttl);
    info!("  Volatile TTL: {:?}", config.volatile_ttl);
    info!("  Volatile tier enabled: {}", config.enable_volatile_tier);

    let volatile = Arc::new(InMemoryVolatileStore::new());
    let cache = AnalysisCache::builder(config.clone())
        .durable(Arc::new(InMemoryDurableStore::new(config.similarity_bands)))
        .volatile(volatile.clone())
        .events(Arc::new(LoggingEventPublisher::new()))
        .build()?;

    let exporter = Arc::new(MetricsExporter::new()?);
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let sweeper = ExpirySweeper::new(cache.clone(), shutdown.child_token());
    tasks.push(tokio::spawn(async move {
        sweeper.run().await;
    }));

    if config.enable_volatile_tier {
        let token = shutdown.child_token();
        let period = config.volatile_ttl.min(config.sweep_interval);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let purged = volatile.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired volatile entries");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        }));
    }

    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    let health_token = shutdown.child_token();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache, health_token).await {
            error!("Health server error: {}", e);
        }
    }));

    let metrics_addr = args.metrics_addr.clone();
    let metrics_cache = cache.clone();
    let metrics_token = shutdown.child_token();
    tasks.push(tokio::spawn(async move {
        if let Err(e) =
            run_metrics_server(&metrics_addr, metrics_cache, exporter, metrics_token).await
        {
            error!("Metrics server error: {}", e);
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    let snapshot = cache.metrics();
    info!(
        hits = snapshot.hits(),
        misses = snapshot.misses,
        computes = snapshot.computes,
        "LensCache shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
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
}

// =============================================================================
// HTTP helpers
// =============================================================================

mod http {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    pub type Body = Full<Bytes>;

    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    pub fn with_content_type(mut response: Response<Body>, content_type: &str) -> Response<Body> {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: &str,
    cache: AnalysisCache,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
        cache: AnalysisCache,
    ) -> std::result::Result<Response<http::Body>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" => http::text(StatusCode::OK, "ok"),
            "/readyz" => {
                let health = cache.health().await;
                if health.is_ready() {
                    http::text(StatusCode::OK, "ok")
                } else {
                    http::text(StatusCode::SERVICE_UNAVAILABLE, "durable tier unavailable")
                }
            }
            _ => http::text(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let io = TokioIo::new(stream);
        let cache = cache.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, cache.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    cache: AnalysisCache,
    exporter: Arc<MetricsExporter>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        cache: AnalysisCache,
        exporter: Arc<MetricsExporter>,
    ) -> std::result::Result<Response<http::Body>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                exporter.update_tiers(&cache.durable_stats(), cache.volatile_stats().as_ref());
                match exporter.render(&cache.metrics()) {
                    Ok(buffer) => http::with_content_type(
                        http::text(StatusCode::OK, buffer),
                        &exporter.content_type(),
                    ),
                    Err(e) => {
                        tracing::error!("Failed to encode metrics: {}", e);
                        http::text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                    }
                }
            }
            _ => http::text(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service =
                service_fn(move |req| metrics_handler(req, cache.clone(), Arc::clone(&exporter)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
