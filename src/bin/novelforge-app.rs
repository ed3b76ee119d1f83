use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use novelforge::adapter::AdapterSet;
use novelforge::aggregate::Aggregator;
use novelforge::app::http::{AppState, router};
use novelforge::app::registry::TaskRegistry;
use novelforge::cache::Cache;
use novelforge::config::Config;
use novelforge::http::HttpClient;
use novelforge::rules::RuleSet;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Directory of book-source rule files (*.json).
    #[arg(long, default_value = "rules")]
    rules_dir: PathBuf,

    /// Final artifacts are written here.
    #[arg(long, default_value = "downloads")]
    download_dir: PathBuf,

    /// Two-tier blob cache root.
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Concurrent download workers.
    #[arg(long, default_value_t = 2)]
    max_workers: usize,

    /// Cap on in-flight outbound HTTP requests.
    #[arg(long, default_value_t = 5)]
    max_requests: usize,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novelforge::logging::init().context("init logging")?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting novelforge-app");

    let config = Arc::new(Config {
        rules_dir: args.rules_dir.clone(),
        download_dir: args.download_dir.clone(),
        cache_dir: args.cache_dir.clone(),
        max_concurrent_requests: args.max_requests,
        ..Config::default()
    });

    let rules = Arc::new(RuleSet::load_dir(&config.rules_dir).context("load rules")?);
    if rules.enabled_count() == 0 {
        tracing::warn!("no enabled sources; search and download will return empty results");
    }

    let http = Arc::new(HttpClient::new(config.max_concurrent_requests).context("build http client")?);
    let cache = Arc::new(Cache::new(&config.cache_dir, config.cache_memory_entries));
    let adapters = Arc::new(AdapterSet::new(
        &rules,
        Arc::clone(&http),
        Arc::clone(&cache),
        Arc::clone(&config),
    ));
    let aggregator = Arc::new(Aggregator::new(
        adapters.enabled(),
        config.search_timeout,
        config.search_deadline,
    ));
    let registry = Arc::new(TaskRegistry::new(
        Arc::clone(&adapters),
        Arc::clone(&config),
        args.max_workers,
    ));
    registry.spawn_gc();

    let state = AppState {
        rules,
        adapters,
        aggregator,
        registry: Arc::clone(&registry),
        cache,
        config,
    };

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown order: stop accepting (above), drain workers, then the
    // HTTP pool and cache drop with the process. Disk cache entries are
    // durable per put, so no flush step is needed.
    registry.cancel_all();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
