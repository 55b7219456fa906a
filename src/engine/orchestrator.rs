//! Streaming pipeline orchestration.
//!
//! Four tasks share the analyzer and baseline behind short non-suspending
//! critical sections: mempool ingestion, block ingestion, window expiry, and
//! the broadcast tick. Broadcast ticks that fall behind are skipped, never
//! queued, so subscribers only ever see fresh snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, trace, warn};

use crate::api::{ConnectionManager, ServerPayload, PRICE_CHANNEL};
use crate::chain::parser;
use crate::chain::zmq_listener::{RawMessage, ZmqListener};
use crate::engine::analyzer::RollingAnalyzer;
use crate::engine::baseline::{summarize_block, BaselineCalculator, BaselineResult};
use crate::engine::storage::{PriceHistoryStore, PriceSnapshot};
use crate::models::PipelineStats;
use crate::oracle::{FilterOutcome, TxSummary};

/// Window expiry cadence.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Broadcast ticks between persisted mempool snapshots.
const PERSIST_EVERY_TICKS: u64 = 60;

/// Shared pipeline counters. `last_block_height` of zero means unknown.
pub struct PipelineCounters {
    pub total_received: AtomicU64,
    pub total_processed: AtomicU64,
    pub total_filtered: AtomicU64,
    pub total_blocks: AtomicU64,
    pub last_block_height: AtomicU64,
    started_at: f64,
}

impl PipelineCounters {
    pub fn new(started_at: f64) -> Self {
        Self {
            total_received: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_filtered: AtomicU64::new(0),
            total_blocks: AtomicU64::new(0),
            last_block_height: AtomicU64::new(0),
            started_at,
        }
    }

    pub fn snapshot(&self, active_tx_count: usize, now: f64) -> PipelineStats {
        let height = self.last_block_height.load(Ordering::Relaxed);
        PipelineStats {
            total_received: self.total_received.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_filtered: self.total_filtered.load(Ordering::Relaxed),
            total_blocks: self.total_blocks.load(Ordering::Relaxed),
            active_tx_count: active_tx_count as u64,
            uptime_seconds: (now - self.started_at).max(0.0),
            last_block_height: if height == 0 { None } else { Some(height) },
        }
    }
}

/// Task handles grouped by their place in the shutdown order: ingestion
/// first, then the periodic tasks.
pub struct PipelineTasks {
    pub ingest: Vec<JoinHandle<()>>,
    pub periodic: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    pub analyzer: Arc<Mutex<RollingAnalyzer>>,
    pub baseline_calc: Arc<Mutex<BaselineCalculator>>,
    pub current_baseline: Arc<ArcSwapOption<BaselineResult>>,
    pub manager: Arc<ConnectionManager>,
    pub storage: Arc<PriceHistoryStore>,
    pub counters: Arc<PipelineCounters>,
    pub broadcast_interval: Duration,
}

impl Orchestrator {
    /// Spawn the pipeline against a listener's channels.
    pub fn spawn(self: Arc<Self>, listener: ZmqListener, shutdown: watch::Receiver<bool>) -> PipelineTasks {
        let mut ingest = Vec::new();
        let mut periodic = Vec::new();

        ingest.push(tokio::spawn(task_transactions(
            self.clone(),
            listener.transactions,
            shutdown.clone(),
        )));

        if let Some(blocks) = listener.blocks {
            ingest.push(tokio::spawn(task_blocks(
                self.clone(),
                blocks,
                shutdown.clone(),
            )));
        } else {
            warn!("Block topic disabled; baseline will not refresh");
        }

        periodic.push(tokio::spawn(task_gc(self.clone(), shutdown.clone())));
        periodic.push(tokio::spawn(task_broadcast(self, shutdown)));

        PipelineTasks { ingest, periodic }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// T-tx: mempool bytes -> parse -> filter -> window.
async fn task_transactions(
    orch: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<RawMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Mempool ingestion task started");

    loop {
        let raw = tokio::select! {
            _ = shutdown.changed() => break,
            raw = rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let received = orch.counters.total_received.fetch_add(1, Ordering::Relaxed) + 1;

        // Malformed mempool bytes are dropped without ceremony.
        let parsed = match parser::parse_transaction(&raw.bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "Dropped unparseable mempool transaction");
                orch.counters.total_filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let summary = parsed.to_summary();
        let outcome = orch.analyzer.lock().observe(&summary, raw.arrival_time);

        match outcome {
            FilterOutcome::Accept { .. } => {
                orch.counters.total_processed.fetch_add(1, Ordering::Relaxed);
            }
            FilterOutcome::Reject { .. } => {
                orch.counters.total_filtered.fetch_add(1, Ordering::Relaxed);
            }
        }

        if received % 100 == 0 {
            info!(
                received,
                processed = orch.counters.total_processed.load(Ordering::Relaxed),
                filtered = orch.counters.total_filtered.load(Ordering::Relaxed),
                "Mempool progress"
            );
        }
    }

    info!("Mempool ingestion task stopped");
}

/// T-blk: raw block -> per-tx filter -> baseline recompute -> atomic swap.
async fn task_blocks(
    orch: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<RawMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Block ingestion task started");

    loop {
        let raw = tokio::select! {
            _ = shutdown.changed() => break,
            raw = rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let block = match parser::parse_block(&raw.bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "Dropped unparseable block");
                continue;
            }
        };

        let height = block.height.unwrap_or_else(|| {
            orch.counters.last_block_height.load(Ordering::Relaxed) + 1
        });

        let summaries: Vec<TxSummary> = block
            .transactions
            .iter()
            .map(|tx| tx.to_summary())
            .collect();
        let outputs = summarize_block(height, block.timestamp as f64, &summaries);

        info!(
            height,
            txs = summaries.len(),
            accepted = outputs.accepted_txs,
            "New block ingested"
        );

        orch.counters.total_blocks.fetch_add(1, Ordering::Relaxed);
        orch.counters
            .last_block_height
            .store(height, Ordering::Relaxed);

        let now = now_seconds();
        let recomputed = {
            let mut calc = orch.baseline_calc.lock();
            calc.add_block(outputs);
            calc.recompute(now)
        };

        if let Some(result) = recomputed {
            if let Err(e) = orch.storage.append(&PriceSnapshot {
                ts: now as i64,
                source: "baseline".to_string(),
                price: result.price,
                confidence: result.confidence,
                tx_count: result.num_outputs as u64,
                block_height: result.block_height,
            }) {
                error!(error = %e, "Failed to persist baseline snapshot");
            }

            orch.analyzer.lock().set_baseline(result.price);
            // Swap last: readers see the old baseline or the new one, whole.
            orch.current_baseline.store(Some(Arc::new(result)));
        }
    }

    info!("Block ingestion task stopped");
}

/// T-gc: periodic window expiry.
async fn task_gc(orch: Arc<Orchestrator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let removed = orch.analyzer.lock().evict_expired(now_seconds());
        if removed > 0 {
            trace!(removed, "Expired window transactions");
        }
    }

    info!("Window expiry task stopped");
}

/// T-bcast: snapshot and fan out on every tick; missed ticks coalesce.
async fn task_broadcast(orch: Arc<Orchestrator>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(orch.broadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks: u64 = 0;

    info!(
        interval_ms = orch.broadcast_interval.as_millis() as u64,
        "Broadcast task started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let now = now_seconds();
        // One critical section: the snapshot is consistent by construction.
        let (snapshot, transactions) = {
            let mut analyzer = orch.analyzer.lock();
            (analyzer.snapshot_price(now), analyzer.recent_history())
        };

        let stats = orch.counters.snapshot(snapshot.active_tx_count, now);
        let baseline = orch.current_baseline.load_full();

        let payload = ServerPayload::Update {
            price: snapshot.price_usd,
            confidence: snapshot.confidence,
            transactions,
            stats,
            baseline: baseline.map(|b| b.summary()),
        };
        orch.manager.broadcast_to_channel(PRICE_CHANNEL, &payload);

        ticks += 1;
        if ticks % PERSIST_EVERY_TICKS == 0 {
            if let Err(e) = orch.storage.append(&PriceSnapshot {
                ts: now as i64,
                source: "mempool".to_string(),
                price: snapshot.price_usd,
                confidence: snapshot.confidence,
                tx_count: snapshot.active_tx_count as u64,
                block_height: None,
            }) {
                error!(error = %e, "Failed to persist mempool snapshot");
            }
        }
    }

    info!("Broadcast task stopped");
}
