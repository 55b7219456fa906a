//! HTTP/WebSocket surface: shared state, routes, and the subscriber fan-out.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::auth::JwtHandler;
use crate::engine::analyzer::RollingAnalyzer;
use crate::engine::baseline::BaselineResult;
use crate::engine::orchestrator::PipelineCounters;
use crate::engine::storage::PriceHistoryStore;
use crate::middleware::RateLimiter;
use crate::models::Config;

pub use routes::build_router;
pub use ws::{ConnectionManager, ServerPayload, PRICE_CHANNEL};

/// State shared by every handler and the pipeline tasks.
#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Mutex<RollingAnalyzer>>,
    pub current_baseline: Arc<ArcSwapOption<BaselineResult>>,
    pub manager: Arc<ConnectionManager>,
    pub jwt: Arc<JwtHandler>,
    pub rate_limiter: Arc<RateLimiter>,
    pub storage: Arc<PriceHistoryStore>,
    pub counters: Arc<PipelineCounters>,
    pub config: Arc<Config>,
}
