use std::time::Duration;

/// Trait for defining reconnection strategies
///
/// Controls how long a channel waits before the next reconnection attempt
/// and when recovery gives up.
pub trait ReconnectionStrategy: Send + Sync {
    /// Get the delay before the next reconnection attempt
    ///
    /// # Arguments
    /// * `attempt` - Number of reconnection attempts already made (0-indexed)
    ///
    /// # Returns
    /// * `Some(duration)` - Wait this long before reconnecting
    /// * `None` - Stop reconnecting
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Check if we should continue reconnecting
    fn should_reconnect(&self, attempt: u32) -> bool;
}

/// Exponential backoff reconnection strategy
///
/// The first failure reconnects immediately. Attempt `i >= 1` waits
/// `min(max_delay, min_delay * 2^(i-1))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy
    ///
    /// # Arguments
    /// * `min_delay` - Delay of the second attempt, doubled on each further attempt
    /// * `max_delay` - Upper bound for any single delay
    /// * `max_attempts` - Maximum number of attempts (None = unlimited)
    pub fn new(min_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            min_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Build the strategy from the reactor's integer attempt limit (`-1` = unlimited)
    pub fn from_limit(min_delay: Duration, max_delay: Duration, attempt_limit: i32) -> Self {
        let max_attempts = if attempt_limit < 0 {
            None
        } else {
            Some(attempt_limit as u32)
        };
        Self::new(min_delay, max_delay, max_attempts)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay for `attempt`, ignoring the attempt limit
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = min_ms.saturating_mul(factor).min(max_ms);
        Duration::from_millis(delay)
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_reconnect(attempt) {
            return None;
        }
        Some(self.delay_for(attempt))
    }

    fn should_reconnect(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Never reconnect strategy
///
/// Used for accepted (server side) channels, which are never recovered.
#[derive(Debug, Clone)]
pub struct NeverReconnect;

impl ReconnectionStrategy for NeverReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn should_reconnect(&self, _attempt: u32) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_immediate() {
        let strategy =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(4), None);
        assert_eq!(strategy.next_delay(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_doubling_and_cap() {
        let strategy =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(3), None);
        let delays: Vec<u64> = (0..6)
            .map(|i| strategy.next_delay(i).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_attempt_limit() {
        let strategy = ExponentialBackoff::from_limit(
            Duration::from_millis(100),
            Duration::from_millis(400),
            3,
        );
        assert!(strategy.next_delay(2).is_some());
        assert!(strategy.next_delay(3).is_none());
    }

    #[test]
    fn test_unlimited_when_negative() {
        let strategy =
            ExponentialBackoff::from_limit(Duration::from_millis(1), Duration::from_millis(2), -1);
        assert!(strategy.should_reconnect(10_000));
    }

    #[test]
    fn test_overflow_safety() {
        let strategy =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(3600), None);
        assert_eq!(strategy.delay_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn test_never_reconnect() {
        assert!(NeverReconnect.next_delay(0).is_none());
        assert!(!NeverReconnect.should_reconnect(0));
    }
}
