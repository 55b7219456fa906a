//! On-chain price inference core.
//!
//! Pure, synchronous kernels: the histogram bin layout, the detection
//! stencils, the payment selection rules, and the price estimator. Nothing
//! in here does I/O; the batch engine and the streaming pipeline both drive
//! these against their own transaction sources.

pub mod bins;
pub mod estimator;
pub mod filter;
pub mod stencil;

pub use bins::{BinLayout, BIN_EDGES, NUM_BINS};
pub use estimator::{
    estimate, EstimateOutcome, HeightSpan, IntradayPoint, PriceEstimate, TimedOutput,
};
pub use filter::{FilterDiagnostics, FilterOutcome, RejectReason, TxFilter, TxSummary};
