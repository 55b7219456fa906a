//! ChainPulse streaming server.
//!
//! Seeds the on-chain baseline, ingests the mempool and new blocks over the
//! node's ZMQ topics, keeps a rolling three-hour price window, and fans live
//! updates out to WebSocket subscribers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainpulse_backend::{
    api::{build_router, AppState, ConnectionManager},
    auth::JwtHandler,
    chain::{rpc::BitcoinRpc, zmq_listener::ZmqListener},
    engine::{
        analyzer::RollingAnalyzer,
        baseline::BaselineCalculator,
        orchestrator::{Orchestrator, PipelineCounters},
        storage::{PriceHistoryStore, PriceSnapshot},
    },
    middleware::{RateLimitConfig, RateLimiter},
    models::Config,
    oracle::stencil,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    info!("🚀 ChainPulse server starting");

    // A corrupted constant table would skew every price; refuse to run.
    if !stencil::verify_integrity() {
        bail!("stencil constants failed the integrity check");
    }

    let rpc = BitcoinRpc::new(
        config.rpc_url.clone(),
        config.rpc_user.clone(),
        config.rpc_password.clone(),
    )?;
    let storage = Arc::new(PriceHistoryStore::new(&config.database_path)?);
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    let manager = Arc::new(ConnectionManager::new(config.max_subscribers));

    let started_at = now_seconds();
    let counters = Arc::new(PipelineCounters::new(started_at));

    // Baseline first: streaming starts with a reference price when the node
    // cooperates, and without one otherwise.
    let mut baseline_calc = BaselineCalculator::new(config.baseline_blocks);
    baseline_calc.seed_from_node(&rpc).await;
    counters
        .total_blocks
        .store(baseline_calc.block_count() as u64, Ordering::Relaxed);
    if let Some(height) = baseline_calc.last_block_height() {
        counters.last_block_height.store(height, Ordering::Relaxed);
    }

    let initial_baseline = baseline_calc.recompute(now_seconds());
    let analyzer = Arc::new(Mutex::new(RollingAnalyzer::new(config.window_seconds())));

    match &initial_baseline {
        Some(baseline) => {
            info!(
                price = baseline.price,
                confidence = baseline.confidence,
                blocks = baseline_calc.block_count(),
                "📊 Initial baseline ready"
            );
            analyzer.lock().set_baseline(baseline.price);
            if let Err(e) = storage.append(&PriceSnapshot {
                ts: now_seconds() as i64,
                source: "baseline".to_string(),
                price: baseline.price,
                confidence: baseline.confidence,
                tx_count: baseline.num_outputs as u64,
                block_height: baseline.block_height,
            }) {
                error!(error = %e, "Failed to persist initial baseline");
            }
        }
        None => warn!("Starting without a baseline; estimator fallback in effect"),
    }
    let current_baseline = Arc::new(ArcSwapOption::from(initial_baseline.map(Arc::new)));

    // Streaming pipeline.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = ZmqListener::spawn(
        config.zmq_tx_endpoint.clone(),
        Some(config.zmq_block_endpoint.clone()),
        shutdown_rx.clone(),
    );

    let orchestrator = Arc::new(Orchestrator {
        analyzer: analyzer.clone(),
        baseline_calc: Arc::new(Mutex::new(baseline_calc)),
        current_baseline: current_baseline.clone(),
        manager: manager.clone(),
        storage: storage.clone(),
        counters: counters.clone(),
        broadcast_interval: Duration::from_secs_f64(config.min_broadcast_interval_secs),
    });
    let tasks = orchestrator.spawn(listener, shutdown_rx.clone());

    // Housekeeping: heartbeat sweep and rate-limit bucket aging.
    let housekeeping = {
        let manager = manager.clone();
        let rate_limiter = rate_limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let closed = manager.heartbeat_sweep(now_seconds());
                if closed > 0 {
                    info!(closed, "Heartbeat sweep closed subscribers");
                }
                rate_limiter.cleanup();
            }
        })
    };

    // HTTP/WS surface.
    let state = AppState {
        analyzer,
        current_baseline,
        manager: manager.clone(),
        jwt,
        rate_limiter,
        storage,
        counters,
        config: Arc::new(config.clone()),
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "🎯 API server listening");

    axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Ordered shutdown: refuse new subscribers, stop ingestion, stop the
    // periodic tasks, then drain and close the fan-out.
    info!("Shutting down pipeline");
    manager.stop_accepting();
    let _ = shutdown_tx.send(true);

    for handle in tasks.ingest {
        let _ = handle.await;
    }
    for handle in tasks.periodic {
        let _ = handle.await;
    }
    let _ = housekeeping.await;

    manager.close_all("server shutdown");
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
