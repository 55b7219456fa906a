//! Shared data models and configuration.

use serde::{Deserialize, Serialize};

use crate::oracle::{FilterDiagnostics, IntradayPoint};

/// Window population at which streaming confidence saturates.
const CONFIDENCE_SATURATION: usize = 200;

/// Result of one full estimation pass.
#[derive(Debug, Clone, Serialize)]
pub struct PriceResult {
    pub price_usd: Option<f64>,
    pub confidence: f64,
    pub tx_count: u64,
    pub output_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<FilterDiagnostics>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub intraday: Vec<IntradayPoint>,
}

impl PriceResult {
    pub fn empty() -> Self {
        Self {
            price_usd: None,
            confidence: 0.0,
            tx_count: 0,
            output_count: 0,
            diagnostics: None,
            intraday: Vec::new(),
        }
    }
}

/// Live counters surfaced in broadcast payloads and the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_received: u64,
    pub total_processed: u64,
    pub total_filtered: u64,
    pub total_blocks: u64,
    pub active_tx_count: u64,
    pub uptime_seconds: f64,
    pub last_block_height: Option<u64>,
}

/// Streaming confidence from window population alone, saturating at 200
/// accepted transactions.
pub fn confidence_from_population(active_count: usize) -> f64 {
    (active_count as f64 / CONFIDENCE_SATURATION as f64).min(1.0)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub zmq_tx_endpoint: String,
    pub zmq_block_endpoint: String,
    pub window_hours: f64,
    pub baseline_blocks: usize,
    pub min_broadcast_interval_secs: f64,
    pub database_path: String,
    pub jwt_secret: String,
    pub max_subscribers: usize,
    /// Allow the dev-only token issuance endpoint.
    pub dev_tokens: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let rpc_url = std::env::var("BITCOIN_RPC_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8332".to_string());
        let rpc_user = std::env::var("BITCOIN_RPC_USER").ok();
        let rpc_password = std::env::var("BITCOIN_RPC_PASSWORD").ok();

        let zmq_tx_endpoint = std::env::var("ZMQ_TX_ENDPOINT")
            .unwrap_or_else(|_| "tcp://127.0.0.1:28332".to_string());
        let zmq_block_endpoint = std::env::var("ZMQ_BLOCK_ENDPOINT")
            .unwrap_or_else(|_| "tcp://127.0.0.1:28333".to_string());

        let window_hours = std::env::var("WINDOW_HOURS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3.0);

        let baseline_blocks = std::env::var("BASELINE_BLOCKS")
            .unwrap_or_else(|_| "144".to_string())
            .parse()
            .unwrap_or(144);

        let min_broadcast_interval_secs = std::env::var("BROADCAST_INTERVAL")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse()
            .unwrap_or(0.5);

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./chainpulse.db".to_string());

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        let max_subscribers = std::env::var("MAX_SUBSCRIBERS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);

        let dev_tokens = std::env::var("AUTH_DEV_TOKENS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        Ok(Self {
            port,
            rpc_url,
            rpc_user,
            rpc_password,
            zmq_tx_endpoint,
            zmq_block_endpoint,
            window_hours,
            baseline_blocks,
            min_broadcast_interval_secs,
            database_path,
            jwt_secret,
            max_subscribers,
            dev_tokens,
        })
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_hours * 3600.0
    }
}
