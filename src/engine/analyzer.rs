//! Rolling mempool window analysis.
//!
//! Keeps a time-ordered deque of accepted transactions annotated with the
//! bin index of every binned output, plus a sparse running histogram that
//! always equals the sum of the deque's contributions. The chaining filter
//! set is pruned together with the window so it stays bounded.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use serde::Serialize;

use crate::models::confidence_from_population;
use crate::oracle::{
    estimator, FilterOutcome, RejectReason, TimedOutput, TxFilter, TxSummary, BIN_EDGES, NUM_BINS,
};

/// Price assumed before any baseline or estimate exists.
const DEFAULT_PRICE: f64 = 100_000.0;

/// Cap on the visualization scatter history.
const HISTORY_CAP: usize = 1200;

/// Scatter points returned per snapshot.
const HISTORY_SNAPSHOT: usize = 500;

/// One accepted transaction inside the window.
#[derive(Debug, Clone)]
struct TxRecord {
    txid: String,
    /// Binned output amounts and their bin indices, index-aligned.
    amounts: Vec<f64>,
    bins: Vec<usize>,
    timestamp: f64,
}

/// A scatter point for the live transaction feed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransactionPoint {
    pub timestamp: f64,
    pub price: f64,
    pub btc_amount: f64,
}

/// Result of one snapshot pass over the window.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub price_usd: f64,
    pub confidence: f64,
    pub active_tx_count: usize,
    /// False when the price is a baseline / last-estimate fallback.
    pub estimated: bool,
    pub deviation: f64,
}

pub struct RollingAnalyzer {
    window_seconds: f64,
    filter: TxFilter,
    records: VecDeque<TxRecord>,
    /// Sparse histogram: bin index -> cumulative BTC value.
    histogram: HashMap<usize, f64>,
    /// Every identifier that reached the chaining rule, with its arrival
    /// time, so the filter set expires with the window.
    txid_window: VecDeque<(String, f64)>,
    history: VecDeque<TransactionPoint>,
    baseline_price: Option<f64>,
    last_price_estimate: f64,
}

impl RollingAnalyzer {
    pub fn new(window_seconds: f64) -> Self {
        Self {
            window_seconds,
            filter: TxFilter::new(),
            records: VecDeque::new(),
            histogram: HashMap::new(),
            txid_window: VecDeque::new(),
            history: VecDeque::with_capacity(HISTORY_CAP),
            baseline_price: None,
            last_price_estimate: DEFAULT_PRICE,
        }
    }

    /// Run the filter against one transaction and ingest it on acceptance.
    /// Non-suspending: a broadcast never observes a half-applied ingest.
    pub fn observe(&mut self, tx: &TxSummary, now: f64) -> FilterOutcome {
        let outcome = self.filter.evaluate(tx);

        match &outcome {
            FilterOutcome::Accept { outputs } => {
                self.txid_window.push_back((tx.txid.clone(), now));
                self.ingest(&tx.txid, outputs, now);
            }
            FilterOutcome::Reject { reason }
                if matches!(reason, RejectReason::SameDay | RejectReason::Amount) =>
            {
                // These reached the chaining rule, so their ids entered the
                // filter set and must expire with the window.
                self.txid_window.push_back((tx.txid.clone(), now));
            }
            FilterOutcome::Reject { .. } => {}
        }

        outcome
    }

    fn ingest(&mut self, txid: &str, outputs: &[f64], now: f64) {
        let mut amounts = Vec::with_capacity(outputs.len());
        let mut bins = Vec::with_capacity(outputs.len());

        for amount in outputs {
            if let Some(bin) = BIN_EDGES.bin_of(*amount) {
                *self.histogram.entry(bin).or_insert(0.0) += amount;
                amounts.push(*amount);
                bins.push(bin);
            }
        }

        // Scatter the live feed around the current estimate so sparse
        // windows still render as a band rather than a line.
        let mut rng = rand::thread_rng();
        for amount in &amounts {
            let scatter = 0.92 + rng.gen::<f64>() * 0.16;
            if self.history.len() == HISTORY_CAP {
                self.history.pop_front();
            }
            self.history.push_back(TransactionPoint {
                timestamp: now,
                price: self.last_price_estimate * scatter,
                btc_amount: *amount,
            });
        }

        self.records.push_back(TxRecord {
            txid: txid.to_string(),
            amounts,
            bins,
            timestamp: now,
        });
    }

    /// Drop everything older than the window, subtracting histogram
    /// contributions and unchaining expired identifiers. Idempotent for a
    /// fixed `now`.
    pub fn evict_expired(&mut self, now: f64) -> usize {
        let cutoff = now - self.window_seconds;
        let mut removed = 0;

        while self
            .records
            .front()
            .map_or(false, |record| record.timestamp < cutoff)
        {
            if let Some(record) = self.records.pop_front() {
                for (amount, bin) in record.amounts.iter().zip(&record.bins) {
                    if let Some(weight) = self.histogram.get_mut(bin) {
                        *weight -= amount;
                        if *weight <= 0.0 {
                            self.histogram.remove(bin);
                        }
                    }
                }
                removed += 1;
            }
        }

        while self
            .txid_window
            .front()
            .map_or(false, |(_, timestamp)| *timestamp < cutoff)
        {
            if let Some((txid, _)) = self.txid_window.pop_front() {
                self.filter.forget(&txid);
            }
        }

        removed
    }

    /// Estimate the current price from the live window, falling back to the
    /// baseline (then the last estimate) when the window is too thin.
    pub fn snapshot_price(&mut self, now: f64) -> WindowSnapshot {
        self.evict_expired(now);

        let active = self.records.len();
        let mut dense = vec![0.0; NUM_BINS];
        for (bin, weight) in &self.histogram {
            dense[*bin] = *weight;
        }

        let outputs: Vec<TimedOutput> = self
            .records
            .iter()
            .flat_map(|record| {
                record.amounts.iter().map(|amount| TimedOutput {
                    amount_btc: *amount,
                    timestamp: record.timestamp,
                })
            })
            .collect();

        let outcome = estimator::estimate(dense, &outputs, active, None);
        match outcome.estimate() {
            Some(estimate) => {
                self.last_price_estimate = estimate.price_usd;
                WindowSnapshot {
                    price_usd: estimate.price_usd,
                    confidence: estimate.confidence,
                    active_tx_count: active,
                    estimated: true,
                    deviation: estimate.deviation,
                }
            }
            None => {
                let price = self.baseline_price.unwrap_or(self.last_price_estimate);
                WindowSnapshot {
                    price_usd: price,
                    confidence: confidence_from_population(active),
                    active_tx_count: active,
                    estimated: false,
                    deviation: 0.0,
                }
            }
        }
    }

    /// Adopt an externally computed reference price.
    pub fn set_baseline(&mut self, price: f64) {
        if price > 0.0 {
            self.baseline_price = Some(price);
            self.last_price_estimate = price;
        }
    }

    pub fn active_tx_count(&self) -> usize {
        self.records.len()
    }

    /// Most recent scatter points, oldest first.
    pub fn recent_history(&self) -> Vec<TransactionPoint> {
        let skip = self.history.len().saturating_sub(HISTORY_SNAPSHOT);
        self.history.iter().skip(skip).copied().collect()
    }

    /// True when the running histogram equals the deque's contributions.
    pub fn is_consistent(&self) -> bool {
        let mut expected: HashMap<usize, f64> = HashMap::new();
        for record in &self.records {
            for (amount, bin) in record.amounts.iter().zip(&record.bins) {
                *expected.entry(*bin).or_insert(0.0) += amount;
            }
        }
        if expected.len() != self.histogram.len() {
            return false;
        }
        expected.iter().all(|(bin, weight)| {
            self.histogram
                .get(bin)
                .map(|actual| (actual - weight).abs() < 1e-9)
                .unwrap_or(false)
        })
    }
}
