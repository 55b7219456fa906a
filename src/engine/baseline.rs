//! On-chain baseline price over the most recent confirmed blocks.
//!
//! A bounded FIFO of per-block accepted outputs. Each recompute runs the
//! full estimation pass over the concatenation and publishes the result as
//! an atomic swap, so readers always see either the old baseline or the new
//! one, never a torn struct.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{info, warn};

use crate::chain::rpc::BitcoinRpc;
use crate::oracle::{
    estimator, FilterOutcome, HeightSpan, IntradayPoint, TimedOutput, TxFilter, TxSummary,
};

/// Minimum ingested blocks before a baseline exists.
const MIN_BLOCKS: usize = 10;

/// Minimum accepted outputs across the window.
const MIN_OUTPUTS: usize = 100;

/// Published price band around the estimate.
const BAND: f64 = 0.05;

/// Intraday clouds are downsampled to this many points before publication.
const MAX_INTRADAY_POINTS: usize = 10_000;

/// A published baseline.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineResult {
    pub price: f64,
    pub price_min: f64,
    pub price_max: f64,
    pub confidence: f64,
    pub timestamp: f64,
    pub block_height: Option<u64>,
    pub num_outputs: usize,
    pub intraday_points: Vec<IntradayPoint>,
}

/// Compact form carried inside broadcast payloads.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineSummary {
    pub price: f64,
    pub price_min: f64,
    pub price_max: f64,
    pub confidence: f64,
    pub block_height: Option<u64>,
}

impl BaselineResult {
    pub fn summary(&self) -> BaselineSummary {
        BaselineSummary {
            price: self.price,
            price_min: self.price_min,
            price_max: self.price_max,
            confidence: self.confidence,
            block_height: self.block_height,
        }
    }
}

/// Accepted outputs of one block.
#[derive(Debug, Clone)]
pub struct BlockOutputs {
    pub height: u64,
    pub outputs: Vec<TimedOutput>,
    pub accepted_txs: usize,
}

/// Run the payment filter over one block's transactions with a fresh
/// chaining set scoped to that block.
pub fn summarize_block(height: u64, block_time: f64, txs: &[TxSummary]) -> BlockOutputs {
    let mut filter = TxFilter::new();
    let mut outputs = Vec::new();
    let mut accepted_txs = 0;

    for tx in txs {
        if let FilterOutcome::Accept { outputs: amounts } = filter.evaluate(tx) {
            accepted_txs += 1;
            for amount in amounts {
                outputs.push(TimedOutput {
                    amount_btc: amount,
                    timestamp: block_time,
                });
            }
        }
    }

    BlockOutputs {
        height,
        outputs,
        accepted_txs,
    }
}

pub struct BaselineCalculator {
    capacity: usize,
    blocks: VecDeque<BlockOutputs>,
    last_block_height: Option<u64>,
}

impl BaselineCalculator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: VecDeque::with_capacity(capacity),
            last_block_height: None,
        }
    }

    /// Push a block, evicting the oldest when full.
    pub fn add_block(&mut self, block: BlockOutputs) {
        self.last_block_height = Some(block.height);
        if self.blocks.len() == self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn last_block_height(&self) -> Option<u64> {
        self.last_block_height
    }

    /// Recompute the baseline over every queued block.
    pub fn recompute(&self, now: f64) -> Option<BaselineResult> {
        if self.blocks.len() < MIN_BLOCKS {
            warn!(
                blocks = self.blocks.len(),
                capacity = self.capacity,
                "Too few blocks for a baseline"
            );
            return None;
        }

        let mut outputs: Vec<TimedOutput> = Vec::new();
        let mut accepted_txs = 0;
        for block in &self.blocks {
            outputs.extend_from_slice(&block.outputs);
            accepted_txs += block.accepted_txs;
        }

        if outputs.len() < MIN_OUTPUTS {
            warn!(outputs = outputs.len(), "Too few outputs for a baseline");
            return None;
        }

        let amounts: Vec<f64> = outputs.iter().map(|o| o.amount_btc).collect();
        let histogram = estimator::count_histogram(&amounts);

        let span = self.blocks.front().map(|first| HeightSpan {
            start_height: first.height,
            block_count: self.blocks.len(),
        });

        let outcome = estimator::estimate(histogram, &outputs, accepted_txs, span);
        let estimate = outcome.estimate()?;

        let intraday_points = downsample(&estimate.cloud, MAX_INTRADAY_POINTS);

        info!(
            price = estimate.price_usd,
            confidence = estimate.confidence,
            blocks = self.blocks.len(),
            outputs = outputs.len(),
            cloud = estimate.cloud.len(),
            "Baseline recomputed"
        );

        Some(BaselineResult {
            price: estimate.price_usd,
            price_min: estimate.price_usd * (1.0 - BAND),
            price_max: estimate.price_usd * (1.0 + BAND),
            confidence: estimate.confidence,
            timestamp: now,
            block_height: self.last_block_height,
            num_outputs: outputs.len(),
            intraday_points,
        })
    }

    /// Seed the window from the node: the most recent `capacity` blocks,
    /// ingested synchronously before streaming starts. Individual fetch
    /// failures are logged and skipped.
    pub async fn seed_from_node(&mut self, rpc: &BitcoinRpc) {
        let tip = match rpc.get_block_count().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(error = %e, "Baseline seeding skipped: node unreachable");
                return;
            }
        };

        let start = tip.saturating_sub(self.capacity as u64 - 1);
        info!(start, tip, "Seeding baseline window from node");

        for height in start..=tip {
            let block = match fetch_block(rpc, height).await {
                Ok(block) => block,
                Err(e) => {
                    warn!(height, error = %e, "Skipping block during baseline seed");
                    continue;
                }
            };

            let summaries: Vec<TxSummary> = block.tx.iter().map(|tx| tx.to_summary()).collect();
            self.add_block(summarize_block(block.height, block.time as f64, &summaries));
        }

        info!(
            blocks = self.blocks.len(),
            outputs = self.blocks.iter().map(|b| b.outputs.len()).sum::<usize>(),
            "Baseline window seeded"
        );
    }
}

async fn fetch_block(
    rpc: &BitcoinRpc,
    height: u64,
) -> Result<crate::chain::rpc::VerboseBlock, crate::chain::rpc::RpcError> {
    let hash = rpc.get_block_hash(height).await?;
    rpc.get_block_verbose(&hash).await
}

/// Uniform-step downsampling that preserves the temporal spread.
fn downsample(points: &[IntradayPoint], cap: usize) -> Vec<IntradayPoint> {
    if points.len() <= cap {
        return points.to_vec();
    }
    let step = points.len() / cap;
    points.iter().step_by(step.max(1)).take(cap).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::filter::{InputSummary, OutputSummary};

    fn summary(txid: &str, values: &[f64]) -> TxSummary {
        TxSummary {
            txid: txid.to_string(),
            inputs: vec![InputSummary {
                prev_txid: format!("prev-{}", txid),
                coinbase: false,
                witness_lens: vec![],
            }],
            outputs: values
                .iter()
                .map(|v| OutputSummary {
                    value_btc: *v,
                    op_return: false,
                })
                .collect(),
        }
    }

    fn priced_block(height: u64, true_price: f64) -> BlockOutputs {
        let mut txs = Vec::new();
        for (i, usd) in [10.0, 20.0, 50.0, 100.0, 200.0, 500.0].iter().enumerate() {
            for j in 0..5 {
                let jitter = (j as f64 - 2.0) / 2.0 * 0.02;
                let amount = usd / true_price * (1.0 + jitter);
                txs.push(summary(&format!("b{}-{}-{}", height, i, j), &[amount, 3.0]));
            }
        }
        summarize_block(height, 1_700_000_000.0 + height as f64 * 600.0, &txs)
    }

    #[test]
    fn test_fifo_eviction() {
        let mut calc = BaselineCalculator::new(3);
        for height in 1..=5 {
            calc.add_block(BlockOutputs {
                height,
                outputs: vec![],
                accepted_txs: 0,
            });
        }
        assert_eq!(calc.block_count(), 3);
        assert_eq!(calc.last_block_height(), Some(5));
        assert_eq!(calc.blocks.front().map(|b| b.height), Some(3));
    }

    #[test]
    fn test_too_few_blocks_yields_none() {
        let mut calc = BaselineCalculator::new(144);
        for height in 0..9 {
            calc.add_block(priced_block(height, 110_000.0));
        }
        assert!(calc.recompute(0.0).is_none());
    }

    #[test]
    fn test_recompute_estimates_price() {
        let mut calc = BaselineCalculator::new(144);
        for height in 0..12 {
            calc.add_block(priced_block(850_000 + height, 110_000.0));
        }

        let baseline = calc.recompute(1_700_000_000.0).expect("baseline");
        assert!(
            (baseline.price - 110_000.0).abs() < 3_500.0,
            "price {}",
            baseline.price
        );
        assert_eq!(baseline.block_height, Some(850_011));
        assert!(baseline.price_min < baseline.price && baseline.price < baseline.price_max);
        assert!(!baseline.intraday_points.is_empty());
        // Cloud points carry fractional block positions inside the window.
        let first = baseline.intraday_points[0];
        assert!(first.position >= 850_000.0 && first.position <= 850_012.0);
    }

    #[test]
    fn test_downsample_uniform() {
        let points: Vec<IntradayPoint> = (0..25_000)
            .map(|i| IntradayPoint {
                price: i as f64,
                position: 0.0,
                timestamp: i as f64,
            })
            .collect();
        let sampled = downsample(&points, 10_000);
        assert!(sampled.len() <= 10_000);
        assert!(sampled.len() > 9_000);
        // Order and spread preserved.
        assert!(sampled[0].price < sampled[1].price);
        assert!(sampled.last().unwrap().price > 19_000.0);
    }
}
