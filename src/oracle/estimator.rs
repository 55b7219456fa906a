//! Price estimation over the output histogram.
//!
//! The pipeline: normalise the histogram, slide the stencils to get a rough
//! price, refine against the best neighbouring slide, expand every accepted
//! output into implied round-USD price points, and converge on the geometric
//! median of the points near the rough estimate.
//!
//! Everything here is pure, synchronous `f64` arithmetic: identical inputs
//! must yield bit-identical results.

use lazy_static::lazy_static;

use crate::oracle::bins::{BIN_EDGES, NUM_BINS};
use crate::oracle::stencil::{SMOOTH_STENCIL, SPIKE_STENCIL, STENCIL_LEN};

/// Bin corresponding to 0.001 BTC; slide 0 therefore reads $100,000/BTC.
const CENTER_BIN: i32 = 601;

/// Half of the sliding window, rounded up.
const HALF_WINDOW: i32 = ((STENCIL_LEN + 1) / 2) as i32;

/// Slide bounds: -141 reaches ~$500k, +201 reaches ~$5k.
const MIN_SLIDE: i32 = -141;
const MAX_SLIDE: i32 = 201;

/// Smooth-stencil contribution for slides below this cutoff.
const SMOOTH_CUTOFF: i32 = 150;
const SMOOTH_WEIGHT: f64 = 0.65;

/// Normalised range of the histogram and its per-bin cap.
const NORM_LO: usize = 201;
const NORM_HI: usize = 1600;
const BIN_CAP: f64 = 0.008;

/// Bins holding round BTC amounts (1k sats .. 1 BTC); smoothed before
/// normalisation because round-BTC transfers carry no fiat signal.
const ROUND_BTC_BINS: [usize; 18] = [
    201, 401, 461, 496, 540, 601, 661, 696, 740, 801, 861, 896, 940, 1001, 1061, 1096, 1140, 1201,
];

/// Round USD amounts matched when expanding outputs into price points.
const USD_AMOUNTS: [f64; 14] = [
    5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 100.0, 150.0, 200.0, 300.0, 500.0, 1000.0,
];

/// Matching window around the expected BTC amount of a USD candidate.
const WIDE_RANGE: f64 = 0.25;

/// Tolerance for the micro-round BTC exclusion.
const MICRO_TOLERANCE: f64 = 0.0001;

/// Convergence bands around the rough and central prices.
const TIGHT_RANGE: f64 = 0.05;
const MEDIUM_RANGE: f64 = 0.10;

/// Minimum accepted transactions before an estimate is attempted.
pub const MIN_ACCEPTED_TXS: usize = 10;

lazy_static! {
    /// Micro-round BTC amounts (5k sats up to 1 BTC in coarsening steps);
    /// outputs this close to a round satoshi amount are not treated as fiat.
    static ref MICRO_ROUND_BTC: Vec<f64> = build_micro_round_list();
}

fn build_micro_round_list() -> Vec<f64> {
    let mut list = Vec::new();
    let mut i = 0.00005_f64;
    while i < 0.0001 {
        list.push(i);
        i += 0.00001;
    }
    let mut i = 0.0001_f64;
    while i < 0.001 {
        list.push(i);
        i += 0.00001;
    }
    let mut i = 0.001_f64;
    while i < 0.01 {
        list.push(i);
        i += 0.0001;
    }
    let mut i = 0.01_f64;
    while i < 0.1 {
        list.push(i);
        i += 0.001;
    }
    let mut i = 0.1_f64;
    while i < 1.0 {
        list.push(i);
        i += 0.01;
    }
    list
}

/// One accepted output amount with its arrival or block time.
#[derive(Debug, Clone, Copy)]
pub struct TimedOutput {
    pub amount_btc: f64,
    pub timestamp: f64,
}

/// One implied price point of the intraday cloud.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IntradayPoint {
    pub price: f64,
    /// Fractional block position when block context is known, else 0.
    pub position: f64,
    pub timestamp: f64,
}

/// Block context used to place cloud points on a fractional height axis.
#[derive(Debug, Clone, Copy)]
pub struct HeightSpan {
    pub start_height: u64,
    pub block_count: usize,
}

/// A successful estimate.
#[derive(Debug, Clone)]
pub struct PriceEstimate {
    /// Converged price, or the rough price when no cloud point survived.
    pub price_usd: f64,
    /// Neighbour-refined stencil price that seeded the convergence.
    pub rough_price: f64,
    pub confidence: f64,
    /// Histogram bin of the winning slide.
    pub peak_bin: usize,
    /// Median absolute deviation of the cloud as a fraction of the +-10% band.
    pub deviation: f64,
    pub cloud: Vec<IntradayPoint>,
}

/// Estimator outcome.
#[derive(Debug, Clone)]
pub enum EstimateOutcome {
    Ok(PriceEstimate),
    /// Too few transactions or an empty normalised histogram.
    InsufficientData,
    /// The weighted-neighbour step degenerated; the estimate carries the
    /// arithmetic mean of the two candidates instead.
    NumericDegenerate(PriceEstimate),
}

impl EstimateOutcome {
    pub fn estimate(&self) -> Option<&PriceEstimate> {
        match self {
            EstimateOutcome::Ok(e) | EstimateOutcome::NumericDegenerate(e) => Some(e),
            EstimateOutcome::InsufficientData => None,
        }
    }

    pub fn price(&self) -> Option<f64> {
        self.estimate().map(|e| e.price_usd)
    }

    pub fn confidence(&self) -> f64 {
        self.estimate().map(|e| e.confidence).unwrap_or(0.0)
    }
}

/// Build a dense count histogram (1.0 per binned output).
pub fn count_histogram(amounts: &[f64]) -> Vec<f64> {
    let mut histogram = vec![0.0; NUM_BINS];
    for amount in amounts {
        if let Some(bin) = BIN_EDGES.bin_of(*amount) {
            histogram[bin] += 1.0;
        }
    }
    histogram
}

/// Normalise the histogram in place: drop the extremes, smooth the round-BTC
/// bins, scale the analysis range to sum 1 and cap each bin.
///
/// Returns false when the analysis range sums to zero.
pub fn normalize_histogram(histogram: &mut [f64]) -> bool {
    for bin in histogram.iter_mut().take(NORM_LO) {
        *bin = 0.0;
    }
    for bin in histogram.iter_mut().skip(NORM_HI + 1) {
        *bin = 0.0;
    }

    for r in ROUND_BTC_BINS {
        histogram[r] = 0.5 * (histogram[r - 1] + histogram[r + 1]);
    }

    let sum: f64 = histogram[NORM_LO..=NORM_HI].iter().sum();
    if sum == 0.0 {
        return false;
    }

    for bin in &mut histogram[NORM_LO..=NORM_HI] {
        *bin /= sum;
        if *bin > BIN_CAP {
            *bin = BIN_CAP;
        }
    }

    true
}

struct SlideResult {
    best_slide: i32,
    best_score: f64,
    total_score: f64,
}

/// Slide both stencils across the normalised histogram and score each
/// candidate price position.
fn slide_stencils(histogram: &[f64]) -> SlideResult {
    let left = CENTER_BIN - HALF_WINDOW;

    let mut best_slide = 0;
    let mut best_score = 0.0;
    let mut total_score = 0.0;

    for slide in MIN_SLIDE..MAX_SLIDE {
        let start = (left + slide) as usize;
        let window = &histogram[start..start + STENCIL_LEN];

        let mut smooth_score = 0.0;
        let mut spike_score = 0.0;
        for k in 0..STENCIL_LEN {
            smooth_score += window[k] * SMOOTH_STENCIL[k];
            spike_score += window[k] * SPIKE_STENCIL[k];
        }

        // The broad Gaussian only helps in the low-slide (high-price) region.
        let combined = if slide < SMOOTH_CUTOFF {
            spike_score + SMOOTH_WEIGHT * smooth_score
        } else {
            spike_score
        };

        if combined > best_score {
            best_score = combined;
            best_slide = slide;
        }
        total_score += combined;
    }

    SlideResult {
        best_slide,
        best_score,
        total_score,
    }
}

/// Spike-only score of one slide; out-of-range window positions contribute
/// nothing.
fn spike_score_at(histogram: &[f64], slide: i32) -> f64 {
    let left = CENTER_BIN - HALF_WINDOW + slide;
    let mut score = 0.0;
    for k in 0..STENCIL_LEN {
        let index = left + k as i32;
        if index >= 0 && (index as usize) < histogram.len() {
            score += histogram[index as usize] * SPIKE_STENCIL[k];
        }
    }
    score
}

struct Refined {
    price: f64,
    confidence: f64,
    peak_bin: usize,
    degenerate: bool,
}

/// Blend the winning slide with its better-scoring neighbour.
fn refine_with_neighbour(histogram: &[f64], slide: &SlideResult) -> Refined {
    let peak_bin = (CENTER_BIN + slide.best_slide) as usize;
    let best_price = 100.0 / BIN_EDGES.edge(peak_bin);

    let score_up = spike_score_at(histogram, slide.best_slide + 1);
    let score_down = spike_score_at(histogram, slide.best_slide - 1);

    let (step, neighbour_score) = if score_down > score_up {
        (-1, score_down)
    } else {
        (1, score_up)
    };
    let neighbour_bin = (CENTER_BIN + slide.best_slide + step) as usize;
    let neighbour_price = 100.0 / BIN_EDGES.edge(neighbour_bin);

    let avg_score = slide.total_score / ((MAX_SLIDE - MIN_SLIDE) as f64);
    let w1 = slide.best_score - avg_score;
    let w2 = (neighbour_score - avg_score).abs();

    let confidence = if avg_score > 0.0 {
        (slide.best_score / (avg_score * 10.0)).min(1.0)
    } else {
        0.0
    };

    // Exact comparison: the degenerate branch is part of the contract.
    if w1 + w2 == 0.0 {
        return Refined {
            price: (best_price + neighbour_price) / 2.0,
            confidence,
            peak_bin,
            degenerate: true,
        };
    }

    Refined {
        price: (w1 * best_price + w2 * neighbour_price) / (w1 + w2),
        confidence,
        peak_bin,
        degenerate: false,
    }
}

/// Expand accepted outputs into implied round-USD price points.
///
/// An output within +-25% of the BTC equivalent of a round USD amount, and
/// not itself within +-0.01% of a micro-round BTC amount, contributes the
/// implied price `usd / amount`; the first matching USD amount wins.
pub fn intraday_cloud(
    outputs: &[TimedOutput],
    rough_price: f64,
    span: Option<HeightSpan>,
) -> Vec<IntradayPoint> {
    if outputs.is_empty() || rough_price <= 0.0 {
        return Vec::new();
    }

    let mut min_time = f64::INFINITY;
    let mut max_time = f64::NEG_INFINITY;
    for out in outputs {
        min_time = min_time.min(out.timestamp);
        max_time = max_time.max(out.timestamp);
    }
    let time_span = if max_time > min_time {
        max_time - min_time
    } else {
        1.0
    };

    let mut points = Vec::new();
    for out in outputs {
        let position = match span {
            Some(s) => {
                s.start_height as f64 + (out.timestamp - min_time) / time_span * s.block_count as f64
            }
            None => 0.0,
        };

        for usd in USD_AMOUNTS {
            let expected = usd / rough_price;
            let lower = expected - WIDE_RANGE * expected;
            let upper = expected + WIDE_RANGE * expected;
            if lower < out.amount_btc && out.amount_btc < upper {
                let micro_round = MICRO_ROUND_BTC.iter().any(|round| {
                    let rm_lower = round - MICRO_TOLERANCE * round;
                    let rm_upper = round + MICRO_TOLERANCE * round;
                    rm_lower < out.amount_btc && out.amount_btc < rm_upper
                });
                if !micro_round {
                    points.push(IntradayPoint {
                        price: usd / out.amount_btc,
                        position,
                        timestamp: out.timestamp,
                    });
                    break;
                }
            }
        }
    }
    points
}

/// Geometric median of the prices inside `(min, max)` via prefix-sum L1
/// distances, plus the median absolute deviation around it. The first
/// minimum wins ties.
pub fn find_central_price(prices: &[f64], min: f64, max: f64) -> Option<(f64, f64)> {
    let mut kept: Vec<f64> = prices
        .iter()
        .copied()
        .filter(|p| min < *p && *p < max)
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = kept.len();

    let mut prefix = Vec::with_capacity(n);
    let mut running = 0.0;
    for p in &kept {
        running += p;
        prefix.push(running);
    }
    let total = running;

    let mut best_index = 0;
    let mut best_dist = f64::INFINITY;
    for i in 0..n {
        let left_sum = if i == 0 { 0.0 } else { prefix[i - 1] };
        let right_sum = total - prefix[i];
        let dist = (kept[i] * i as f64 - left_sum) + (right_sum - kept[i] * (n - 1 - i) as f64);
        if dist < best_dist {
            best_dist = dist;
            best_index = i;
        }
    }
    let central = kept[best_index];

    let mut deviations: Vec<f64> = kept.iter().map(|p| (p - central).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let m = deviations.len();
    let mad = if m % 2 == 0 {
        (deviations[m / 2 - 1] + deviations[m / 2]) / 2.0
    } else {
        deviations[m / 2]
    };

    Some((central, mad))
}

/// Single-pass convergence: central price within +-5% of the rough estimate,
/// deviation measured over the +-10% band around it.
pub fn converge(prices: &[f64], rough_price: f64) -> Option<(f64, f64)> {
    let tight_up = rough_price + TIGHT_RANGE * rough_price;
    let tight_down = rough_price - TIGHT_RANGE * rough_price;
    let (central, _) = find_central_price(prices, tight_down, tight_up)?;

    let medium_up = central + MEDIUM_RANGE * central;
    let medium_down = central - MEDIUM_RANGE * central;
    let band = medium_up - medium_down;
    let deviation = match find_central_price(prices, medium_down, medium_up) {
        Some((_, mad)) if band > 0.0 => mad / band,
        _ => 0.0,
    };

    Some((central, deviation))
}

/// Full estimate over a dense histogram and the accepted outputs behind it.
///
/// `accepted_txs` gates the attempt: thin windows produce no price rather
/// than a noisy one.
pub fn estimate(
    mut histogram: Vec<f64>,
    outputs: &[TimedOutput],
    accepted_txs: usize,
    span: Option<HeightSpan>,
) -> EstimateOutcome {
    debug_assert_eq!(histogram.len(), NUM_BINS);

    if accepted_txs < MIN_ACCEPTED_TXS {
        return EstimateOutcome::InsufficientData;
    }
    if !normalize_histogram(&mut histogram) {
        return EstimateOutcome::InsufficientData;
    }

    let slide = slide_stencils(&histogram);
    if slide.best_score == 0.0 || slide.total_score == 0.0 {
        return EstimateOutcome::InsufficientData;
    }

    let refined = refine_with_neighbour(&histogram, &slide);

    let cloud = intraday_cloud(outputs, refined.price, span);
    let cloud_prices: Vec<f64> = cloud.iter().map(|p| p.price).collect();

    let (price_usd, deviation) = match converge(&cloud_prices, refined.price) {
        Some((central, deviation)) => (central, deviation),
        None => (refined.price, 0.0),
    };

    let result = PriceEstimate {
        price_usd,
        rough_price: refined.price,
        confidence: refined.confidence,
        peak_bin: refined.peak_bin,
        deviation,
        cloud,
    };

    if refined.degenerate {
        EstimateOutcome::NumericDegenerate(result)
    } else {
        EstimateOutcome::Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed(amounts: &[f64]) -> Vec<TimedOutput> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, a)| TimedOutput {
                amount_btc: *a,
                timestamp: 1_700_000_000.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn test_normalize_zeroes_extremes_and_caps() {
        let mut histogram = vec![0.0; NUM_BINS];
        histogram[50] = 100.0;
        histogram[1900] = 100.0;
        histogram[700] = 10_000.0;
        histogram[800] = 1.0;

        assert!(normalize_histogram(&mut histogram));
        assert_eq!(histogram[50], 0.0);
        assert_eq!(histogram[1900], 0.0);
        // The dominant bin hits the cap; the small one keeps its share.
        assert_eq!(histogram[700], 0.008);
        assert!(histogram[800] > 0.0 && histogram[800] < 0.008);
    }

    #[test]
    fn test_normalize_smooths_round_btc_bins() {
        let mut histogram = vec![0.0; NUM_BINS];
        histogram[601] = 50.0;
        histogram[600] = 4.0;
        histogram[602] = 6.0;
        histogram[700] = 1000.0;

        assert!(normalize_histogram(&mut histogram));
        // Bin 601 was replaced by the neighbour mean before scaling.
        let sum = 4.0 + 5.0 + 6.0 + 1000.0;
        assert!((histogram[601] - 5.0 / sum).abs() < 1e-15);
    }

    #[test]
    fn test_normalize_reports_empty_range() {
        let mut histogram = vec![0.0; NUM_BINS];
        histogram[100] = 5.0;
        assert!(!normalize_histogram(&mut histogram));
    }

    #[test]
    fn test_single_spike_bin_estimates_near_100k() {
        let mut histogram = vec![0.0; NUM_BINS];
        histogram[601] = BIN_CAP;

        let slide = slide_stencils(&histogram);
        let refined = refine_with_neighbour(&histogram, &slide);

        // 0.001 BTC carrying all the mass puts the price at the $100k
        // neighbourhood, within one bin step.
        assert!(refined.price > 95_000.0 && refined.price < 105_000.0);
        assert!(refined.confidence > 0.0 && refined.confidence <= 1.0);
        assert!(!refined.degenerate);
        let bin = refined.peak_bin as i32;
        assert!((bin - 601).abs() <= 1, "peak bin {}", bin);
    }

    #[test]
    fn test_estimator_purity() {
        let amounts: Vec<f64> = (0..200)
            .map(|i| 0.0009 + (i % 40) as f64 * 0.0000031)
            .collect();
        let outputs = timed(&amounts);

        let run = || {
            estimate(count_histogram(&amounts), &outputs, 50, None)
                .estimate()
                .map(|e| {
                    (
                        e.price_usd.to_bits(),
                        e.confidence.to_bits(),
                        e.peak_bin,
                        e.rough_price.to_bits(),
                    )
                })
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_recovers_synthetic_price() {
        // Payments at round USD amounts for a true price of $110,000, with a
        // deterministic +-2% jitter on each amount.
        let true_price = 110_000.0;
        let mut amounts = Vec::new();
        for usd in [10.0, 20.0, 50.0, 100.0, 200.0, 500.0] {
            for j in 0..41 {
                let jitter = (j as f64 - 20.0) / 20.0 * 0.02;
                amounts.push(usd / true_price * (1.0 + jitter));
            }
        }

        let outputs = timed(&amounts);
        let outcome = estimate(count_histogram(&amounts), &outputs, amounts.len() / 2, None);
        let estimate = outcome.estimate().expect("synthetic data must estimate");

        assert!(
            (estimate.price_usd - true_price).abs() < 2_500.0,
            "estimated {}",
            estimate.price_usd
        );
        assert!(!estimate.cloud.is_empty());
        assert!(estimate.confidence > 0.0);
    }

    #[test]
    fn test_too_few_transactions() {
        let amounts = vec![0.001; 30];
        let outputs = timed(&amounts);
        let outcome = estimate(count_histogram(&amounts), &outputs, 5, None);
        assert!(matches!(outcome, EstimateOutcome::InsufficientData));
        assert_eq!(outcome.price(), None);
        assert_eq!(outcome.confidence(), 0.0);
    }

    #[test]
    fn test_intraday_cloud_matches_and_excludes() {
        let rough = 100_000.0;

        // $100 at this price is 0.001 BTC; 0.000953 is within 25% and sits
        // between the micro-round satoshi steps.
        let outputs = timed(&[0.000953]);
        let cloud = intraday_cloud(&outputs, rough, None);
        assert_eq!(cloud.len(), 1);
        // First matching USD amount is $100 (smaller candidates are out of range).
        assert!((cloud[0].price - 100.0 / 0.000953).abs() < 1e-9);

        // 0.00095 is a round satoshi amount (95,000 sats): excluded.
        let outputs = timed(&[0.00095]);
        assert!(intraday_cloud(&outputs, rough, None).is_empty());

        // Exactly 0.001 BTC is a micro-round amount: excluded.
        let outputs = timed(&[0.001]);
        assert!(intraday_cloud(&outputs, rough, None).is_empty());

        // Far from every candidate: nothing emitted.
        let outputs = timed(&[0.3]);
        assert!(intraday_cloud(&outputs, rough, None).is_empty());
    }

    #[test]
    fn test_cloud_positions_follow_timestamps() {
        let outputs = vec![
            TimedOutput {
                amount_btc: 0.000953,
                timestamp: 1000.0,
            },
            TimedOutput {
                amount_btc: 0.000963,
                timestamp: 2000.0,
            },
        ];
        let span = HeightSpan {
            start_height: 850_000,
            block_count: 144,
        };
        let cloud = intraday_cloud(&outputs, 100_000.0, Some(span));
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud[0].position, 850_000.0);
        assert_eq!(cloud[1].position, 850_144.0);
    }

    #[test]
    fn test_find_central_price_first_minimum_wins() {
        // Symmetric distances tie between 99,900 and 100,000; the lower
        // index wins.
        let prices = [99_800.0, 99_900.0, 100_000.0, 100_100.0];
        let (central, mad) = find_central_price(&prices, 0.0, 1e9).unwrap();
        assert_eq!(central, 99_900.0);
        // Deviations sorted: [0, 100, 100, 200] -> median 100.
        assert_eq!(mad, 100.0);
    }

    #[test]
    fn test_converge_discards_outliers() {
        let prices = [99_800.0, 99_900.0, 100_000.0, 100_100.0, 110_000.0];
        let (central, deviation) = converge(&prices, 100_000.0).unwrap();
        // 110,000 falls outside the +-5% band and cannot be selected.
        assert_eq!(central, 99_900.0);
        assert!(deviation >= 0.0);
    }

    #[test]
    fn test_converge_empty_band() {
        let prices = [50_000.0, 51_000.0];
        assert!(converge(&prices, 100_000.0).is_none());
    }

    #[test]
    fn test_micro_round_list_shape() {
        assert_eq!(MICRO_ROUND_BTC.len(), 366);
        assert!((MICRO_ROUND_BTC[0] - 0.00005).abs() < 1e-12);
        assert!(*MICRO_ROUND_BTC.last().unwrap() < 1.0);
    }
}
