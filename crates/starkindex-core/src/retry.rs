//! Exponential backoff policies: a bounded retry budget for storage and RPC
//! operations, and an unbounded reconnect backoff for the live subscription.

use std::time::Duration;

/// Configuration for a bounded retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Stateless retry policy — computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), or `None`
    /// once the budget is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as u64
            * 2u64.saturating_pow(attempt.saturating_sub(1));
        let capped = base_ms.min(self.config.max_backoff.as_millis() as u64);
        Some(Duration::from_millis(capped))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Unbounded reconnect backoff with ±`jitter_fraction` jitter, for the live
/// WebSocket subscription: doubles per failure, resets on success.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    jitter_fraction: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration, jitter_fraction: f64) -> Self {
        Self {
            initial,
            cap,
            jitter_fraction,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.cap);

        // Jitter seeded from the clock's sub-second noise; good enough to
        // de-synchronize reconnect storms without a PRNG dependency.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let unit = (nanos % 1000) as f64 / 500.0 - 1.0; // [-1, 1]
        let jittered = base.as_millis() as f64 * (1.0 + self.jitter_fraction * unit);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_doubles_until_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        });
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert_eq!(policy.next_delay(4).unwrap().as_millis(), 500); // capped
        assert_eq!(policy.next_delay(5).unwrap().as_millis(), 500);
        assert!(policy.next_delay(6).is_none());
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut backoff = Backoff::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            0.0, // no jitter: deterministic for the test
        );
        assert_eq!(backoff.next_delay().as_millis(), 500);
        assert_eq!(backoff.next_delay().as_millis(), 1000);
        assert_eq!(backoff.next_delay().as_millis(), 2000);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 500);
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1000),
            Duration::from_secs(30),
            0.2,
        );
        for _ in 0..16 {
            let d = backoff.next_delay().as_millis() as f64;
            backoff.reset();
            assert!((800.0..=1200.0).contains(&d), "delay {d} outside ±20%");
        }
    }
}
