//! Binary entrypoint: load settings, wire the components, serve.
//!
//! Exit codes: 0 after a graceful SIGTERM/Ctrl-C shutdown, 2 on fatal
//! configuration errors, 1 on other startup failures.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mindgate::audit::{AuditSink, JsonlAuditSink, NullAuditSink};
use mindgate::cache::SemanticCache;
use mindgate::classify::{Classifier, ClassifierMode};
use mindgate::control::MetaControl;
use mindgate::embedding::EmbeddingService;
use mindgate::health::{HealthMonitor, SysinfoSource};
use mindgate::http::{self, AppState};
use mindgate::metrics::Metrics;
use mindgate::orchestrator::Orchestrator;
use mindgate::pool::ModelPool;
use mindgate::pool::prefetch::Prefetcher;
use mindgate::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "mindgate", version, about = "Local inference router")]
struct Args {
    /// Settings file (default: ~/.mindgate/config.toml).
    #[arg(long, env = "MINDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long, env = "MINDGATE_HOST")]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long, env = "MINDGATE_PORT")]
    port: Option<u16>,

    /// Override any setting by dotted path (repeatable), e.g.
    /// --set memory.max_ram_bytes=8589934592.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();
    init_tracing(args.log_json);

    let config_path = args.config.clone().unwrap_or_else(Settings::default_path);
    let mut settings = match Settings::load_from(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("mindgate: {e}");
            std::process::exit(2);
        }
    };
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    for pair in &args.overrides {
        let Some((path, value)) = pair.split_once('=') else {
            eprintln!("mindgate: --set expects PATH=VALUE, got '{pair}'");
            std::process::exit(2);
        };
        if let Err(e) = settings.set(path, value) {
            eprintln!("mindgate: --set {path}: {e}");
            std::process::exit(2);
        }
    }
    if !args.overrides.is_empty() {
        if let Err(e) = settings.validate() {
            eprintln!("mindgate: {e}");
            std::process::exit(2);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.runtime.worker_threads)
        .enable_all()
        .build()
        .context("building the async runtime")?;
    runtime.block_on(run(Arc::new(settings)))
}

async fn run(settings: Arc<Settings>) -> anyhow::Result<()> {
    let state_dir = settings.state_dir();
    let metrics = Arc::new(Metrics::new());

    let cache = Arc::new(SemanticCache::new(&settings.cache));
    let cache_path = state_dir.join("semantic_cache.jsonl");
    cache.load(&cache_path);

    let control = Arc::new(MetaControl::new(Some(state_dir.join("meta_phase.json"))));
    let embeddings = Arc::new(EmbeddingService::initialize(&settings.embedding).await);
    let classifier = Arc::new(Classifier::new(ClassifierMode::Cold));
    let pool = ModelPool::from_settings(&settings, Arc::clone(&metrics));
    let health = HealthMonitor::new(
        &settings.health,
        settings.memory.max_ram_bytes,
        Arc::clone(&metrics),
    );
    let audit: Arc<dyn AuditSink> = if settings.audit.enabled {
        let path = settings
            .audit
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join("audit.jsonl"));
        Arc::new(JsonlAuditSink::spawn(path))
    } else {
        Arc::new(NullAuditSink)
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&settings),
        Arc::clone(&embeddings),
        Arc::clone(&classifier),
        Arc::clone(&cache),
        Arc::clone(&control),
        Arc::clone(&pool),
        Arc::clone(&health),
        Arc::clone(&metrics),
        audit,
    ));

    // Background workers, all stopped through one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&health).run_sampler(
        Box::new(SysinfoSource::new()),
        Duration::from_millis(settings.health.sample_period_ms),
        shutdown_rx.clone(),
    ));
    tokio::spawn(
        Arc::clone(&pool).run_ttl_sweeper(Duration::from_secs(30), shutdown_rx.clone()),
    );
    let prefetcher = Prefetcher::spawn(
        Arc::clone(&pool),
        Arc::clone(&classifier),
        Arc::clone(&settings),
        shutdown_rx,
    );

    let state = AppState {
        orchestrator,
        health,
        pool: Arc::clone(&pool),
        embeddings,
        metrics,
        prefetcher,
    };

    http::serve(
        state,
        &settings.server.host,
        settings.server.port,
        wait_for_termination(),
    )
    .await
    .context("http surface failed")?;

    // Graceful drain: stop workers, drain the pool, persist state.
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    if let Err(e) = cache.save(&cache_path) {
        tracing::warn!(error = %e, "failed to persist semantic cache");
    }
    control.persist();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "sigterm handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mindgate=info,tower_http=warn"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
