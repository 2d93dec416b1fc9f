//! HTTP collector for CloudLedger
//!
//! Lists one resource kind from a paginated JSON API, throttled by a token
//! bucket that all collectors of the same API share.
//!
//! ```text
//! Reconciler ──pull──▶ HttpCollector ──acquire──▶ RateLimiter
//!                           │
//!                           └── GET /{scope}/{path}?pageToken=… ──▶ API
//! ```

pub mod collector;
pub mod error;
pub mod rate_limit;

pub use collector::{HttpCollector, HttpCollectorConfig, Page};
pub use error::{HttpCollectorError, Result};
pub use rate_limit::{RateLimitConfig, RateLimiter};
