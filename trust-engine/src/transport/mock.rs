//! Mock transport for testing.
//!
//! Clones share one in-memory relay log, so several engines built from
//! clones of the same mock see each other's pushes. Failures can be
//! injected per call.

use super::{Pulled, RelayItem, Transport, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zerok_trust_types::{BlobKey, BlobKind, Cursor};

/// Mock relay shared by all clones.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    log: Vec<RelayItem>,
    offline: bool,
    fail_next_push: Option<String>,
    fail_next_pull: Option<String>,
    failing_pushes: u32,
    push_attempts: u64,
    pull_attempts: u64,
}

impl MockTransport {
    /// Create a new, empty mock relay.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything pushed so far, in cursor order.
    pub fn items(&self) -> Vec<RelayItem> {
        self.lock().log.clone()
    }

    /// Items of one kind.
    pub fn items_of_kind(&self, kind: BlobKind) -> Vec<RelayItem> {
        self.lock()
            .log
            .iter()
            .filter(|item| item.key.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of push calls, failed ones included.
    pub fn push_attempts(&self) -> u64 {
        self.lock().push_attempts
    }

    /// Number of pull calls, failed ones included.
    pub fn pull_attempts(&self) -> u64 {
        self.lock().pull_attempts
    }

    /// Make every call fail until `set_offline(false)`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Cause the next push() to fail with the given error.
    pub fn fail_next_push(&self, error: &str) {
        self.lock().fail_next_push = Some(error.to_string());
    }

    /// Cause the next pull() to fail with the given error.
    pub fn fail_next_pull(&self, error: &str) {
        self.lock().fail_next_pull = Some(error.to_string());
    }

    /// Cause the next `count` pushes to fail.
    pub fn fail_pushes(&self, count: u32) {
        self.lock().failing_pushes = count;
    }

    /// Drop every stored blob and injected failure.
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn push(&self, key: &BlobKey, blob: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.push_attempts += 1;

        if inner.offline {
            return Err(TransportError::Unreachable("relay offline".into()));
        }
        if let Some(error) = inner.fail_next_push.take() {
            return Err(TransportError::Unreachable(error));
        }
        if inner.failing_pushes > 0 {
            inner.failing_pushes -= 1;
            return Err(TransportError::Unreachable("injected push failure".into()));
        }

        let cursor = Cursor::new(inner.log.len() as u64 + 1);
        inner.log.push(RelayItem {
            cursor,
            key: key.clone(),
            blob,
        });
        Ok(())
    }

    async fn pull(&self, since: Cursor, limit: u32) -> Result<Pulled, TransportError> {
        let mut inner = self.lock();
        inner.pull_attempts += 1;

        if inner.offline {
            return Err(TransportError::Unreachable("relay offline".into()));
        }
        if let Some(error) = inner.fail_next_pull.take() {
            return Err(TransportError::Unreachable(error));
        }

        let items: Vec<RelayItem> = inner
            .log
            .iter()
            .filter(|item| item.cursor > since)
            .take(limit as usize)
            .cloned()
            .collect();
        let token = items.last().map_or(since, |item| item.cursor);
        Ok(Pulled { items, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerok_trust_types::{PeerId, ViewName, KeyUuid};

    fn circle_key() -> BlobKey {
        BlobKey::circle("ring")
    }

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn push_assigns_increasing_cursors() {
        let transport = MockTransport::new();
        transport.push(&circle_key(), b"one".to_vec()).await.unwrap();
        transport.push(&circle_key(), b"two".to_vec()).await.unwrap();

        let items = transport.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].cursor, Cursor::new(1));
        assert_eq!(items[1].cursor, Cursor::new(2));
    }

    #[tokio::test]
    async fn pull_returns_items_after_cursor() {
        let transport = MockTransport::new();
        for i in 0..3u8 {
            transport.push(&circle_key(), vec![i]).await.unwrap();
        }

        let pulled = transport.pull(Cursor::new(1), 100).await.unwrap();
        assert_eq!(pulled.items.len(), 2);
        assert_eq!(pulled.items[0].blob, vec![1]);
        assert_eq!(pulled.token, Cursor::new(3));
    }

    #[tokio::test]
    async fn pull_respects_limit() {
        let transport = MockTransport::new();
        for i in 0..5u8 {
            transport.push(&circle_key(), vec![i]).await.unwrap();
        }

        let pulled = transport.pull(Cursor::zero(), 2).await.unwrap();
        assert_eq!(pulled.items.len(), 2);
        assert_eq!(pulled.token, Cursor::new(2));
    }

    #[tokio::test]
    async fn empty_pull_keeps_cursor() {
        let transport = MockTransport::new();
        let pulled = transport.pull(Cursor::new(7), 10).await.unwrap();
        assert!(pulled.items.is_empty());
        assert_eq!(pulled.token, Cursor::new(7));
    }

    #[tokio::test]
    async fn items_of_kind_filters() {
        let transport = MockTransport::new();
        let sender = PeerId::fingerprint(&[1u8; 32]);
        transport.push(&circle_key(), vec![]).await.unwrap();
        transport
            .push(
                &BlobKey::shares(&ViewName::new("v"), &KeyUuid::new(), &sender),
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(transport.items_of_kind(BlobKind::Shares).len(), 1);
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_push_failure() {
        let transport = MockTransport::new();
        transport.fail_next_push("relay down");

        let result = transport.push(&circle_key(), vec![]).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));

        // Next push should work
        assert!(transport.push(&circle_key(), vec![]).await.is_ok());
        assert_eq!(transport.push_attempts(), 2);
    }

    #[tokio::test]
    async fn forced_pull_failure() {
        let transport = MockTransport::new();
        transport.fail_next_pull("timeout");

        assert!(transport.pull(Cursor::zero(), 1).await.is_err());
        assert!(transport.pull(Cursor::zero(), 1).await.is_ok());
    }

    #[tokio::test]
    async fn counted_push_failures() {
        let transport = MockTransport::new();
        transport.fail_pushes(2);

        assert!(transport.push(&circle_key(), vec![]).await.is_err());
        assert!(transport.push(&circle_key(), vec![]).await.is_err());
        assert!(transport.push(&circle_key(), vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn offline_fails_everything() {
        let transport = MockTransport::new();
        transport.set_offline(true);

        assert!(transport.push(&circle_key(), vec![]).await.is_err());
        assert!(transport.pull(Cursor::zero(), 1).await.is_err());

        transport.set_offline(false);
        assert!(transport.push(&circle_key(), vec![]).await.is_ok());
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn clones_share_relay_log() {
        let device_a = MockTransport::new();
        let device_b = device_a.clone();

        device_a.push(&circle_key(), b"hello".to_vec()).await.unwrap();

        let pulled = device_b.pull(Cursor::zero(), 10).await.unwrap();
        assert_eq!(pulled.items.len(), 1);
        assert_eq!(pulled.items[0].blob, b"hello");
    }

    #[tokio::test]
    async fn reset_clears_all() {
        let transport = MockTransport::new();
        transport.push(&circle_key(), vec![]).await.unwrap();
        transport.set_offline(true);

        transport.reset();

        assert!(transport.items().is_empty());
        assert!(transport.pull(Cursor::zero(), 10).await.is_ok());
    }
}
