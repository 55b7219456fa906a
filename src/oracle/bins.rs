//! Logarithmic histogram bin layout.
//!
//! 2401 bin edges covering output amounts from zero to 10^6 BTC: edge 0 is
//! exactly zero satoshis, edges 1..=2400 are log-spaced with 200 bins per
//! decade from 10^-6 BTC upward. The layout is a process-lifetime constant
//! and the amount-to-bin mapping must be reproducible bit-exactly.

use lazy_static::lazy_static;

/// Number of bin edges (zero bin + 12 decades x 200).
pub const NUM_BINS: usize = 2401;

/// Bins per decade of the log layout.
pub const BINS_PER_DECADE: usize = 200;

/// First decade exponent (10^-6 BTC).
pub const FIRST_DECADE: i32 = -6;

/// Last decade exponent, exclusive (10^6 BTC is the top edge).
pub const LAST_DECADE: i32 = 6;

lazy_static! {
    /// The shared bin edge table, built once at first use.
    pub static ref BIN_EDGES: BinLayout = BinLayout::new();
}

/// The bin edge table plus the amount-to-index mapping.
pub struct BinLayout {
    edges: Vec<f64>,
}

impl BinLayout {
    pub fn new() -> Self {
        let mut edges = Vec::with_capacity(NUM_BINS);
        edges.push(0.0);
        for exponent in FIRST_DECADE..LAST_DECADE {
            for b in 0..BINS_PER_DECADE {
                edges.push(10f64.powf(exponent as f64 + b as f64 / BINS_PER_DECADE as f64));
            }
        }
        debug_assert_eq!(edges.len(), NUM_BINS);
        Self { edges }
    }

    /// Edge value of a bin index in BTC.
    #[inline]
    pub fn edge(&self, index: usize) -> f64 {
        self.edges[index]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Map a BTC amount to its bin index.
    ///
    /// Non-positive amounts map to the zero bin. Amounts outside the covered
    /// range (below 10^-6 or above 10^6 BTC) have no bin. Otherwise the
    /// result is the greatest index whose edge does not exceed the amount,
    /// found by binary search.
    pub fn bin_of(&self, amount_btc: f64) -> Option<usize> {
        if amount_btc <= 0.0 {
            return Some(0);
        }
        if amount_btc < self.edges[1] {
            return None;
        }
        if amount_btc > self.edges[NUM_BINS - 1] {
            return None;
        }
        // partition_point runs a binary search for the first edge above the
        // amount; the previous index is the containing bin.
        let idx = self.edges.partition_point(|edge| *edge <= amount_btc);
        Some(idx - 1)
    }
}

impl Default for BinLayout {
    fn default() -> Self {
        Self::new()
    }
}
