//! Retry backoff with jitter.
//!
//! Used for transport retries and for re-arming trust-gap waits. Jitter
//! spreads out devices that all retry after the same relay outage.

use std::time::Duration;

/// Exponential backoff policy.
///
/// Formula: `min(max, base * 2^(attempt - 1)) + random(0..=max_jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_jitter: Duration,
}

impl Backoff {
    /// Create a policy.
    pub fn new(base: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            max_jitter,
        }
    }

    /// Same policy without jitter. Deterministic, for tests.
    pub fn without_jitter(self) -> Self {
        Self {
            max_jitter: Duration::ZERO,
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max)
    }

    /// Delay before retry number `attempt` (1-based), with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + random_jitter(self.max_jitter)
    }

    /// Largest delay this policy can produce.
    pub fn ceiling(&self) -> Duration {
        self.max + self.max_jitter
    }
}

impl Default for Backoff {
    /// 2s base, 30s cap, up to 5s jitter.
    fn default() -> Self {
        Self::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            Duration::from_millis(5000),
        )
    }
}

/// Random jitter in `0..=max`. Falls back to no jitter if the OS RNG fails.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_increases_with_attempt() {
        let backoff = Backoff::default();
        // Attempt 1: base = 2s, attempt 3: base = 8s
        assert!(backoff.delay(1) >= Duration::from_secs(2));
        assert!(backoff.delay(3) >= Duration::from_secs(8));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn jitter_creates_variance() {
        let backoff = Backoff::default();
        let delays: Vec<Duration> = (0..20).map(|_| backoff.delay(3)).collect();

        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // 20 samples over 5001 jitter values; identical draws are very unlikely
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "Expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }

    #[test]
    fn delay_capped_at_max_plus_jitter() {
        let backoff = Backoff::default();
        let delay = backoff.delay(40);
        assert!(
            delay <= Duration::from_secs(35),
            "Delay must be capped at 35s (30s base + 5s jitter), got {:?}",
            delay
        );
        assert_eq!(backoff.ceiling(), Duration::from_secs(35));
    }

    #[test]
    fn without_jitter_is_deterministic() {
        let backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .without_jitter();

        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let backoff = Backoff::default().without_jitter();
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }
}
