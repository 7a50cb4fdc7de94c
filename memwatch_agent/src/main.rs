//! memwatch_agent: samples memory/CPU telemetry on a fixed tick and serves
//! the rolling series over HTTP.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use memwatch_agent::aggregator::{Aggregator, Sources};
use memwatch_agent::api::router;
use memwatch_agent::config::{AgentConfig, ParseOutcome, USAGE};
use memwatch_agent::fleet::{FleetCollector, HttpFleetControl};
use memwatch_agent::hotspots::{HotspotTracker, SamplingAllocator};
use memwatch_agent::process::ProcessSampler;
use memwatch_agent::state::AppState;
use memwatch_agent::system::SystemSampler;

#[global_allocator]
static GLOBAL: SamplingAllocator = SamplingAllocator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match AgentConfig::load(|k| std::env::var(k).ok(), std::env::args())? {
        ParseOutcome::Run(cfg) => cfg,
        ParseOutcome::Help => {
            println!("{USAGE}");
            return Ok(());
        }
    };

    let tracker = Arc::new(HotspotTracker::install(&cfg.profiler));
    if cfg.profiler.enabled {
        tracker.start();
    }

    let fleet = match cfg.fleet_url.as_deref() {
        Some(url) => {
            info!("worker fleet control plane at {url}");
            FleetCollector::new(Arc::new(HttpFleetControl::new(url, cfg.fleet_timeout)?))
        }
        None => {
            info!("no fleet url configured; workers will report as unavailable");
            FleetCollector::disabled()
        }
    };

    let sources = Sources {
        processes: Arc::new(ProcessSampler::new()),
        system: Arc::new(SystemSampler::new()),
        fleet: Arc::new(fleet),
        hotspots: tracker.clone(),
    };
    let (aggregator, query) = Aggregator::new(sources, cfg.aggregator_config()?);

    let cancel = CancellationToken::new();
    let sampler = tokio::spawn(aggregator.run(cancel.child_token()));

    let profiler = cfg.profiler.enabled.then(|| Arc::clone(&tracker));
    let app = router(AppState::new(query, profiler));
    let addr = cfg.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("memwatch agent listening on http://{}", listener.local_addr()?);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = sampler.await;
    tracker.stop();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
}
