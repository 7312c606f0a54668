//! Resilience utilities: destination backoff and incoming rate limiting.
//!
//! - [`RetryConfig`]: capped exponential backoff for failing destinations
//! - [`RateLimiter`]: token bucket so a reconnect storm cannot starve local writers
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use doc_replication::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::exponential(Duration::from_millis(500), Duration::from_secs(300));
//! assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire_many(32).await; // Blocks if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Backoff schedule for a destination that keeps failing.
///
/// After `n` consecutive failures the next attempt waits
/// `min(max_delay, initial_delay * 2^n)`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay with zero recorded failures.
    pub initial_delay: Duration,

    /// Ceiling for the exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(300))
    }
}

impl RetryConfig {
    /// Doubling backoff between `base` and `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            initial_delay: base,
            max_delay: max,
        }
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self::exponential(Duration::from_millis(10), Duration::from_millis(100))
    }

    /// Delay after `attempt` consecutive failures.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each applied item consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Shared by every incoming handler of a database. Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire `n` permits, one at a time. Cancel-safe.
    ///
    /// Batches larger than the burst size still make progress this way.
    pub async fn acquire_many(&self, n: u32) {
        for _ in 0..n {
            self.limiter.until_ready().await;
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
