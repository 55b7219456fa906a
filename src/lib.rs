//! ChainPulse backend library.
//!
//! BTC/USD price inference from the on-chain transaction graph: the pure
//! estimation core (`oracle`), node ingestion (`chain`), the batch and
//! streaming engines (`engine`), and the subscriber-facing surface (`api`).

pub mod api;
pub mod auth;
pub mod chain;
pub mod engine;
pub mod middleware;
pub mod models;
pub mod oracle;
