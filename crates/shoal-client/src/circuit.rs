//! Per-node error-rate circuit breaker.
//!
//! Many commands running at once update the same node's counter, so the
//! breaker is lock-free: one atomic error count and one atomic window start.
//! The window rolls over lazily, on the first call that notices it expired.
//!
//! # Example
//!
//! ```
//! use shoal_client::circuit::{ErrorRateBreaker, ErrorRateConfig};
//! use std::time::Duration;
//!
//! let breaker = ErrorRateBreaker::new(ErrorRateConfig {
//!     max_error_rate: 2,
//!     window: Duration::from_secs(1),
//! });
//! assert!(breaker.validate());
//! breaker.record_error();
//! breaker.record_error();
//! assert!(!breaker.validate());
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Default errors allowed per window.
pub const DEFAULT_MAX_ERROR_RATE: u32 = 100;
/// Default window length in milliseconds.
pub const DEFAULT_ERROR_RATE_WINDOW_MS: u64 = 1_000;

/// Breaker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRateConfig {
    /// Errors tolerated per window. `0` disables the breaker.
    pub max_error_rate: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for ErrorRateConfig {
    fn default() -> Self {
        Self {
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            window: Duration::from_millis(DEFAULT_ERROR_RATE_WINDOW_MS),
        }
    }
}

/// Rolling-window error counter.
#[derive(Debug)]
pub struct ErrorRateBreaker {
    config: ErrorRateConfig,
    origin: Instant,
    window_start_ms: AtomicU64,
    errors: AtomicU32,
}

impl ErrorRateBreaker {
    /// New closed breaker.
    pub fn new(config: ErrorRateConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            errors: AtomicU32::new(0),
        }
    }

    /// Breaker limits.
    pub fn config(&self) -> &ErrorRateConfig {
        &self.config
    }

    /// Returns `true` if the node may take another command.
    pub fn validate(&self) -> bool {
        if self.config.max_error_rate == 0 {
            return true;
        }
        self.roll();
        self.errors.load(Ordering::Acquire) < self.config.max_error_rate
    }

    /// Count one error against the current window.
    pub fn record_error(&self) {
        self.roll();
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    /// Errors counted in the current window.
    pub fn error_count(&self) -> u32 {
        self.roll();
        self.errors.load(Ordering::Acquire)
    }

    /// Clear the count and start a new window now.
    pub fn reset(&self) {
        self.window_start_ms.store(self.now_ms(), Ordering::Release);
        self.errors.store(0, Ordering::Release);
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn roll(&self) {
        let window = self.config.window.as_millis() as u64;
        if window == 0 {
            return;
        }
        let now = self.now_ms();
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now.saturating_sub(start) < window {
            return;
        }
        // Only the caller that wins the swap resets the count.
        if self
            .window_start_ms
            .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.errors.store(0, Ordering::Release);
        }
    }
}

impl Default for ErrorRateBreaker {
    fn default() -> Self {
        Self::new(ErrorRateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max: u32, window_ms: u64) -> ErrorRateBreaker {
        ErrorRateBreaker::new(ErrorRateConfig {
            max_error_rate: max,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_at_limit() {
        let b = breaker(3, 1_000);
        for _ in 0..2 {
            b.record_error();
        }
        assert!(b.validate());
        b.record_error();
        assert!(!b.validate());
        assert_eq!(b.error_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let b = breaker(1, 100);
        b.record_error();
        assert!(!b.validate());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(b.validate());
        assert_eq!(b.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_disables() {
        let b = breaker(0, 1_000);
        for _ in 0..1_000 {
            b.record_error();
        }
        assert!(b.validate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let b = breaker(1, 1_000);
        b.record_error();
        b.reset();
        assert!(b.validate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_errors_all_counted() {
        let b = std::sync::Arc::new(breaker(10_000, 60_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    b.record_error();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(b.error_count(), 800);
    }
}
