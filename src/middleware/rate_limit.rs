//! Token-bucket rate limiting.
//!
//! Three budgets share one limiter: HTTP requests per source address,
//! WebSocket messages per connection, and connection attempts per source.
//! Successful HTTP responses carry the bucket state in X-RateLimit headers;
//! rejections carry a retry-after hint. Idle buckets age out.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Configuration for the three budgets.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// HTTP requests per source per minute.
    pub http_per_minute: u32,
    /// WebSocket messages per connection per second.
    pub ws_per_second: f64,
    /// WebSocket burst capacity.
    pub ws_burst: u32,
    /// Handshake attempts per source per minute.
    pub connection_attempts_per_minute: u32,
    /// Idle buckets older than this are dropped.
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            http_per_minute: 100,
            ws_per_second: 20.0,
            ws_burst: 10,
            connection_attempts_per_minute: 5,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&self) -> u32 {
        self.tokens as u32
    }

    /// Seconds until one token is available.
    fn retry_after_secs(&self) -> u64 {
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            return 0;
        }
        ((1.0 - self.tokens) / self.refill_rate).ceil() as u64
    }

    /// Seconds until the bucket is full again.
    fn reset_secs(&self) -> u64 {
        if self.refill_rate <= 0.0 {
            return 0;
        }
        ((self.capacity - self.tokens) / self.refill_rate).ceil() as u64
    }
}

/// Decision for one HTTP request, carried into the response headers.
#[derive(Debug, Clone, Copy)]
pub struct HttpDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    http: Mutex<HashMap<IpAddr, TokenBucket>>,
    attempts: Mutex<HashMap<IpAddr, TokenBucket>>,
    ws: Mutex<HashMap<Uuid, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            http: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            ws: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_http(&self, ip: IpAddr) -> HttpDecision {
        let config = &self.config;
        let mut buckets = self.http.lock();
        let bucket = buckets.entry(ip).or_insert_with(|| {
            TokenBucket::new(
                config.http_per_minute as f64,
                config.http_per_minute as f64 / 60.0,
            )
        });

        let allowed = bucket.consume();
        HttpDecision {
            allowed,
            limit: config.http_per_minute,
            remaining: bucket.remaining(),
            reset_secs: bucket.reset_secs(),
            retry_after_secs: bucket.retry_after_secs(),
        }
    }

    /// One handshake attempt against the per-source budget.
    pub fn check_connection_attempt(&self, ip: IpAddr) -> bool {
        let config = &self.config;
        let mut buckets = self.attempts.lock();
        let bucket = buckets.entry(ip).or_insert_with(|| {
            TokenBucket::new(
                config.connection_attempts_per_minute as f64,
                config.connection_attempts_per_minute as f64 / 60.0,
            )
        });
        bucket.consume()
    }

    /// One inbound message against the per-connection budget.
    pub fn check_ws_message(&self, id: Uuid) -> bool {
        let config = &self.config;
        let mut buckets = self.ws.lock();
        let bucket = buckets
            .entry(id)
            .or_insert_with(|| TokenBucket::new(config.ws_burst as f64, config.ws_per_second));
        bucket.consume()
    }

    pub fn remove_ws(&self, id: Uuid) {
        self.ws.lock().remove(&id);
    }

    /// Drop buckets idle past the configured timeout.
    pub fn cleanup(&self) {
        let idle = self.config.idle_timeout;
        let now = Instant::now();
        self.http
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_update) < idle);
        self.attempts
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_update) < idle);
        self.ws
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last_update) < idle);
    }
}

/// HTTP rate limiting middleware with X-RateLimit headers.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let decision = limiter.check_http(addr.ip());

    if !decision.allowed {
        warn!(
            ip = %addr.ip(),
            retry_after_secs = decision.retry_after_secs,
            "HTTP rate limit exceeded"
        );
        let body = serde_json::json!({
            "error": "rate_limited",
            "message": "Too many requests. Please slow down.",
            "retry_after": decision.retry_after_secs,
        });
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", decision.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response();
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = decision.reset_secs.to_string().parse() {
        headers.insert("X-RateLimit-Reset", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict_config() -> RateLimitConfig {
        RateLimitConfig {
            http_per_minute: 3,
            ws_per_second: 1e-9,
            ws_burst: 2,
            connection_attempts_per_minute: 5,
            idle_timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_http_budget_enforced() {
        let limiter = RateLimiter::new(strict_config());
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for i in 0..3 {
            let decision = limiter.check_http(ip);
            assert!(decision.allowed, "request {} should pass", i);
            assert_eq!(decision.limit, 3);
        }
        let decision = limiter.check_http(ip);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs > 0);
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = RateLimiter::new(strict_config());
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check_http(a).allowed);
        }
        assert!(!limiter.check_http(a).allowed);
        assert!(limiter.check_http(b).allowed);
    }

    #[test]
    fn test_connection_attempt_budget() {
        let limiter = RateLimiter::new(RateLimitConfig {
            connection_attempts_per_minute: 5,
            ..strict_config()
        });
        let ip: IpAddr = "10.0.0.9".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check_connection_attempt(ip));
        }
        assert!(!limiter.check_connection_attempt(ip));
    }

    #[test]
    fn test_ws_burst_then_denied() {
        let limiter = RateLimiter::new(strict_config());
        let id = Uuid::new_v4();

        assert!(limiter.check_ws_message(id));
        assert!(limiter.check_ws_message(id));
        assert!(!limiter.check_ws_message(id));

        limiter.remove_ws(id);
        // Fresh bucket after removal.
        assert!(limiter.check_ws_message(id));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 1000.0);
        assert!(bucket.consume());
        assert!(!bucket.consume());
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.consume());
    }
}
