//! Rate-limited transport wrapper.

use super::{Pulled, Transport, TransportError};
use crate::limits::RateLimits;
use async_trait::async_trait;
use zerok_trust_types::{BlobKey, Cursor};

/// Wraps a transport and refuses pushes over the configured rates.
///
/// Refused pushes surface as [`TransportError::RateLimited`], which the
/// engine treats like any other transport failure: the push is retried
/// with backoff.
#[derive(Debug, Clone)]
pub struct RateLimitedTransport<T> {
    inner: T,
    limits: RateLimits,
}

impl<T: Transport> RateLimitedTransport<T> {
    /// Wrap `inner`.
    pub fn new(inner: T, limits: RateLimits) -> Self {
        Self { inner, limits }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The limiters in use.
    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }
}

#[async_trait]
impl<T: Transport> Transport for RateLimitedTransport<T> {
    async fn push(&self, key: &BlobKey, blob: Vec<u8>) -> Result<(), TransportError> {
        if let Err(e) = self.limits.check(key) {
            tracing::warn!("Push to {} refused locally: {}", key, e);
            return Err(TransportError::RateLimited(e.to_string()));
        }
        self.inner.push(key, blob).await
    }

    async fn pull(&self, since: Cursor, limit: u32) -> Result<Pulled, TransportError> {
        self.inner.pull(since, limit).await
    }
}
