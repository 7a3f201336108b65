//! Outgoing rate limiting.
//!
//! A buggy or looping engine must not flood the relay. Pushes are limited:
//! - per (destination, blob kind) pair, so one chatty session cannot starve
//!   circle or share updates
//! - globally, across every key
//!
//! Both use the governor crate; the keyed limiter is backed by DashMap.

use crate::config::{ConfigError, LimitsConfig};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use zerok_trust_types::{BlobKey, BlobKind, Destination};

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limit category of a push.
pub type LimitKey = (Destination, BlobKind);

/// Push rate limiters for one account.
#[derive(Clone)]
pub struct RateLimits {
    per_key: Arc<KeyedLimiter<LimitKey>>,
    global: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("per_key", &"KeyedLimiter<(Destination, BlobKind)>")
            .field("global", &"DirectLimiter")
            .finish()
    }
}

fn non_zero(value: u32, field: &'static str) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or_else(|| ConfigError::Invalid {
        field,
        reason: "must be > 0".into(),
    })
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a configured value is zero.
    pub fn new(config: &LimitsConfig) -> Result<Self, ConfigError> {
        let per_minute = non_zero(config.pushes_per_minute, "limits.pushes_per_minute")?;
        let burst = non_zero(config.burst, "limits.burst")?;
        let global_rps = non_zero(config.global_per_second, "limits.global_per_second")?;

        let key_quota = Quota::per_minute(per_minute).allow_burst(burst);
        let global_quota = Quota::per_second(global_rps);

        Ok(Self {
            per_key: Arc::new(RateLimiter::keyed(key_quota)),
            global: Arc::new(RateLimiter::direct(global_quota)),
        })
    }

    /// Check whether a push under `key` is allowed.
    pub fn check(&self, key: &BlobKey) -> Result<(), RateLimitError> {
        self.check_global()?;
        let limit_key = (key.destination(), key.kind());
        self.per_key
            .check_key(&limit_key)
            .map_err(|_| RateLimitError::KeyLimitExceeded(key.kind()))
    }

    /// Check the account-wide push rate.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked (destination, kind) pairs.
    pub fn tracked_keys(&self) -> usize {
        self.per_key.len()
    }

    /// Evict idle entries from the keyed limiter.
    pub fn shrink(&self) {
        self.per_key.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many pushes of one kind to one destination.
    KeyLimitExceeded(BlobKind),
    /// Too many pushes overall.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyLimitExceeded(kind) => {
                write!(f, "{} push rate limit exceeded", kind.as_str())
            }
            Self::GlobalLimitExceeded => {
                write!(f, "global push rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;
    use zerok_trust_types::PeerId;

    fn config(per_minute: u32, burst: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            pushes_per_minute: per_minute,
            burst,
            global_per_second: global,
        }
    }

    fn peer(byte: u8) -> PeerId {
        PeerId::fingerprint(&[byte; 32])
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&LimitsConfig::default()).unwrap();
        assert_eq!(limits.tracked_keys(), 0);
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(matches!(
            RateLimits::new(&config(0, 1, 1)),
            Err(ConfigError::Invalid { field: "limits.pushes_per_minute", .. })
        ));
        assert!(RateLimits::new(&config(1, 0, 1)).is_err());
        assert!(RateLimits::new(&config(1, 1, 0)).is_err());
    }

    #[test]
    fn key_limit_allows_burst() {
        let limits = RateLimits::new(&config(60, 3, 1000)).unwrap();
        let key = BlobKey::circle("ring");

        for _ in 0..3 {
            assert!(limits.check(&key).is_ok());
        }
        assert_eq!(
            limits.check(&key),
            Err(RateLimitError::KeyLimitExceeded(BlobKind::Circle))
        );
    }

    #[test]
    fn destinations_have_independent_limits() {
        let limits = RateLimits::new(&config(60, 2, 1000)).unwrap();
        let to_a = BlobKey::session(&peer(1), &peer(2));
        let to_b = BlobKey::session(&peer(1), &peer(3));

        assert!(limits.check(&to_a).is_ok());
        assert!(limits.check(&to_a).is_ok());
        assert!(limits.check(&to_a).is_err());

        assert!(limits.check(&to_b).is_ok());
        assert!(limits.check(&to_b).is_ok());
        assert_eq!(limits.tracked_keys(), 2);
    }

    #[test]
    fn kinds_have_independent_limits() {
        let limits = RateLimits::new(&config(60, 1, 1000)).unwrap();
        assert!(limits.check(&BlobKey::circle("ring")).is_ok());
        assert!(limits.check(&BlobKey::circle("ring")).is_err());

        let shares = BlobKey::shares(
            &zerok_trust_types::ViewName::new("v"),
            &zerok_trust_types::KeyUuid::new(),
            &peer(1),
        );
        assert!(limits.check(&shares).is_ok());
    }

    #[test]
    fn global_limit_applies_across_keys() {
        let limits = RateLimits::new(&config(1000, 1000, 2)).unwrap();
        assert!(limits.check(&BlobKey::session(&peer(1), &peer(2))).is_ok());
        assert!(limits.check(&BlobKey::session(&peer(1), &peer(3))).is_ok());
        assert_eq!(
            limits.check(&BlobKey::session(&peer(1), &peer(4))),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(
            RateLimitError::KeyLimitExceeded(BlobKind::Shares).to_string(),
            "shares push rate limit exceeded"
        );
    }

    #[test]
    fn rate_limits_are_debug() {
        let limits = RateLimits::new(&LimitsConfig::default()).unwrap();
        let debug = format!("{:?}", limits);
        assert!(debug.contains("RateLimits"));
    }
}
