//! Token bucket shared by every collector that talks to one API
//!
//! Waiters are served in arrival order: the bucket sits behind a fair
//! `tokio::sync::Mutex` and a waiter sleeps while holding it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            burst_capacity: 30,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    fn per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, per_second: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.last_refill = now;
    }
}

/// Cheap to clone; clones share one bucket
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: f64::from(config.burst_capacity.max(1)),
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn is_active(&self) -> bool {
        self.config.enabled && self.config.requests_per_minute > 0
    }

    /// Wait until one request may be sent
    pub async fn acquire(&self) {
        if !self.is_active() {
            return;
        }
        let per_second = self.config.per_second();
        let capacity = f64::from(self.config.burst_capacity.max(1));

        let mut bucket = self.bucket.lock().await;
        bucket.refill(per_second, capacity);
        if bucket.tokens < 1.0 {
            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / per_second);
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
            bucket.refill(per_second, capacity);
        }
        bucket.tokens -= 1.0;
    }

    /// Tokens currently in the bucket
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(
            self.config.per_second(),
            f64::from(self.config.burst_capacity.max(1)),
        );
        bucket.tokens
    }
}
