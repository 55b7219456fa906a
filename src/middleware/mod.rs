//! HTTP middleware: rate limiting and request logging.

pub mod logging;
pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimiter};
