//! Estimation engines: batch over block ranges, the rolling mempool window,
//! the confirmed-block baseline, their orchestration, and price history
//! persistence.

pub mod analyzer;
pub mod baseline;
pub mod batch;
pub mod orchestrator;
pub mod storage;

pub use analyzer::RollingAnalyzer;
pub use baseline::{BaselineCalculator, BaselineResult};
pub use batch::{run_for_date, run_for_range, BatchOutcome};
pub use orchestrator::{Orchestrator, PipelineCounters, PipelineTasks};
pub use storage::PriceHistoryStore;
