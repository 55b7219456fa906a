//! Batch estimation over a day (or explicit range) of confirmed blocks.
//!
//! Resolves a UTC calendar day to its block-height range, fetches each block
//! with full transaction decoding, and runs the filter and estimator over
//! the whole day. Transport hiccups retry with backoff; a block the node
//! cannot produce aborts the batch.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::chain::rpc::{BitcoinRpc, VerboseBlock};
use crate::models::PriceResult;
use crate::oracle::{
    estimator, FilterDiagnostics, FilterOutcome, HeightSpan, TimedOutput, TxFilter, TxSummary,
    BIN_EDGES, NUM_BINS,
};

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_FETCH_ATTEMPTS: u32 = 3;

/// A completed batch run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub result: PriceResult,
    pub first_height: u64,
    pub last_height: u64,
}

/// Estimate the price for one UTC calendar day.
pub async fn run_for_date(rpc: &BitcoinRpc, date: NaiveDate) -> Result<BatchOutcome> {
    let (first, last) = resolve_day_range(rpc, date)
        .await
        .with_context(|| format!("Failed to resolve block range for {}", date))?;
    info!(%date, first, last, "Resolved day to block range");
    run_for_range(rpc, first, last).await
}

/// Estimate the price over an explicit block range, inclusive.
pub async fn run_for_range(rpc: &BitcoinRpc, first: u64, last: u64) -> Result<BatchOutcome> {
    if last < first {
        bail!("empty block range {}..{}", first, last);
    }

    let mut filter = TxFilter::new();
    let mut diagnostics = FilterDiagnostics::default();
    let mut histogram = vec![0.0; NUM_BINS];
    let mut outputs: Vec<TimedOutput> = Vec::new();

    for height in first..=last {
        let block = fetch_block_with_retry(rpc, height).await?;
        let block_time = block.time as f64;

        let summaries: Vec<TxSummary> = block.tx.par_iter().map(|tx| tx.to_summary()).collect();

        for summary in &summaries {
            let outcome = filter.evaluate(summary);
            diagnostics.record(&outcome);
            if let FilterOutcome::Accept {
                outputs: accepted_outputs,
            } = outcome
            {
                for amount in accepted_outputs {
                    if let Some(bin) = BIN_EDGES.bin_of(amount) {
                        histogram[bin] += 1.0;
                        outputs.push(TimedOutput {
                            amount_btc: amount,
                            timestamp: block_time,
                        });
                    }
                }
            }
        }

        if (height - first) % 20 == 0 {
            debug!(
                height,
                accepted = diagnostics.passed_filter,
                outputs = outputs.len(),
                "Batch progress"
            );
        }
    }

    let span = HeightSpan {
        start_height: first,
        block_count: (last - first + 1) as usize,
    };
    let accepted = diagnostics.passed_filter as usize;
    let output_count = outputs.len() as u64;

    let outcome = estimator::estimate(histogram, &outputs, accepted, Some(span));

    let result = PriceResult {
        price_usd: outcome.price(),
        confidence: outcome.confidence(),
        tx_count: diagnostics.passed_filter,
        output_count,
        intraday: outcome
            .estimate()
            .map(|e| e.cloud.clone())
            .unwrap_or_default(),
        diagnostics: Some(diagnostics),
    };

    Ok(BatchOutcome {
        result,
        first_height: first,
        last_height: last,
    })
}

/// Map a UTC day to [first block at or after 00:00, last block before 24:00].
async fn resolve_day_range(rpc: &BitcoinRpc, date: NaiveDate) -> Result<(u64, u64)> {
    let day_start = date
        .and_hms_opt(0, 0, 0)
        .context("invalid date")?
        .and_utc()
        .timestamp();
    let day_end = day_start + 86_400;

    let tip = rpc.get_block_count().await.context("getblockcount failed")?;

    let first = match lowest_height_at_or_after(rpc, tip, day_start).await? {
        Some(height) => height,
        None => bail!("the chain tip predates {}", date),
    };

    let last = match lowest_height_at_or_after(rpc, tip, day_end).await? {
        Some(0) => bail!("{} predates the chain", date),
        Some(height) => height - 1,
        None => tip,
    };

    if last < first {
        bail!("no blocks mined on {}", date);
    }

    Ok((first, last))
}

/// Lowest height whose block time is at or after `target`, by binary search.
/// Block times wobble a couple of hours around median time, which is the
/// same tolerance the day boundaries inherit.
async fn lowest_height_at_or_after(
    rpc: &BitcoinRpc,
    tip: u64,
    target: i64,
) -> Result<Option<u64>> {
    if fetch_block_with_retry(rpc, tip).await?.time < target {
        return Ok(None);
    }

    let mut low = 0u64;
    let mut high = tip;
    while low < high {
        let mid = low + (high - low) / 2;
        let time = fetch_block_with_retry(rpc, mid).await?.time;
        if time >= target {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(Some(low))
}

/// Fetch one block, retrying transport errors with exponential backoff. A
/// node-side error (unknown height, pruned block) is fatal immediately.
async fn fetch_block_with_retry(rpc: &BitcoinRpc, height: u64) -> Result<VerboseBlock> {
    let mut backoff = INITIAL_RETRY_BACKOFF;

    for attempt in 1..=MAX_FETCH_ATTEMPTS {
        let fetched = match rpc.get_block_hash(height).await {
            Ok(hash) => rpc.get_block_verbose(&hash).await,
            Err(e) => Err(e),
        };

        match fetched {
            Ok(block) => return Ok(block),
            Err(e) if e.is_transient() && attempt < MAX_FETCH_ATTEMPTS => {
                warn!(
                    height,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Block fetch failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to fetch block {}", height));
            }
        }
    }

    bail!("Failed to fetch block {} after retries", height)
}
