//! Absolute per-command deadline.
//!
//! Built on `tokio::time::Instant`, so paused test clocks drive it too.

use std::time::Duration;

use tokio::time::Instant;

/// Total-timeout deadline plus the per-socket timeout derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDeadline {
    expiry: Option<Instant>,
    socket_timeout: Duration,
}

impl CommandDeadline {
    /// Deadline `total` from now; a zero `total` means no deadline.
    ///
    /// The socket timeout is capped by `total` when both are set.
    pub fn new(total: Duration, socket_timeout: Duration) -> Self {
        if total.is_zero() {
            return Self {
                expiry: None,
                socket_timeout,
            };
        }
        let socket_timeout = if socket_timeout.is_zero() || socket_timeout > total {
            total
        } else {
            socket_timeout
        };
        Self {
            expiry: Some(Instant::now() + total),
            socket_timeout,
        }
    }

    /// No deadline, no socket timeout.
    pub fn unbounded() -> Self {
        Self {
            expiry: None,
            socket_timeout: Duration::ZERO,
        }
    }

    /// Absolute expiry, if any.
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Socket timeout after capping.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }

    /// Time left, or `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.expiry.map(|e| e.saturating_duration_since(Instant::now()))
    }

    /// True once the deadline has passed.
    pub fn expired(&self) -> bool {
        self.expiry.is_some_and(|e| Instant::now() >= e)
    }

    /// Limit for the next socket read or write: the smaller of the socket
    /// timeout and the time left. `None` means wait indefinitely.
    pub fn io_timeout(&self) -> Option<Duration> {
        let socket = (!self.socket_timeout.is_zero()).then_some(self.socket_timeout);
        match (socket, self.remaining()) {
            (Some(s), Some(r)) => Some(s.min(r)),
            (s, r) => s.or(r),
        }
    }

    /// Value for the header's server timeout: milliseconds left, at least 1,
    /// or 0 without a deadline.
    pub fn server_timeout_ms(&self) -> u32 {
        match self.remaining() {
            Some(r) => r.as_millis().clamp(1, u32::MAX as u128) as u32,
            None => 0,
        }
    }

    /// True if sleeping for `sleep` would wake up past the deadline.
    pub fn would_overshoot(&self, sleep: Duration) -> bool {
        self.expiry.is_some_and(|e| Instant::now() + sleep > e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_socket_timeout_capped_by_total() {
        let d = CommandDeadline::new(Duration::from_millis(50), Duration::from_secs(30));
        assert_eq!(d.socket_timeout(), Duration::from_millis(50));
        let d = CommandDeadline::new(Duration::from_millis(50), Duration::ZERO);
        assert_eq!(d.socket_timeout(), Duration::from_millis(50));
        let d = CommandDeadline::new(Duration::ZERO, Duration::from_secs(30));
        assert_eq!(d.socket_timeout(), Duration::from_secs(30));
        assert!(d.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_timeout_minimum_one_ms() {
        let d = CommandDeadline::new(Duration::from_millis(20), Duration::ZERO);
        assert_eq!(d.server_timeout_ms(), 20);
        tokio::time::advance(Duration::from_millis(19)).await;
        assert_eq!(d.server_timeout_ms(), 1);
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(d.expired());
        assert_eq!(d.server_timeout_ms(), 1);
        assert_eq!(CommandDeadline::unbounded().server_timeout_ms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_would_overshoot() {
        let d = CommandDeadline::new(Duration::from_millis(50), Duration::ZERO);
        assert!(d.would_overshoot(Duration::from_millis(100)));
        assert!(!d.would_overshoot(Duration::from_millis(10)));
        assert!(!CommandDeadline::unbounded().would_overshoot(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_timeout_tracks_remaining() {
        let d = CommandDeadline::new(Duration::from_millis(100), Duration::from_millis(80));
        assert_eq!(d.io_timeout(), Some(Duration::from_millis(80)));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(d.io_timeout(), Some(Duration::from_millis(40)));
        assert_eq!(CommandDeadline::unbounded().io_timeout(), None);
    }
}
