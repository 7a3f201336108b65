//! Relay outages and injected transport failures.

mod common;

use common::*;
use zerok_trust_core::CircleStatus;
use zerok_trust_engine::{EngineState, MockTransport};
use zerok_trust_types::BlobKind;

// ===========================================
// Push Failures
// ===========================================

/// An unreachable relay marks the account degraded; work resumes once it
/// comes back.
#[tokio::test]
async fn offline_relay_degrades_then_recovers() {
    let relay = MockTransport::new();
    let (a, b) = founded_pair(&relay).await;

    relay.set_offline(true);
    a.engine.rotate(passwords()).await.unwrap();
    let snapshot = wait_for(&a, |s| s.status.degraded).await;
    assert_eq!(snapshot.circle_status(), CircleStatus::InCircle);
    assert!(snapshot.status.summary().contains("degraded"));
    let rotated = a.engine.current_key_set(&passwords()).unwrap();

    relay.set_offline(false);
    wait_for(&a, |s| !s.status.degraded).await;

    b.engine.fetch().await.unwrap();
    b.engine.settle().await.unwrap();
    assert_eq!(
        b.engine.current_key_set(&passwords()).unwrap().uuid(),
        rotated.uuid()
    );
}

/// Transient push failures are retried until the blob lands.
#[tokio::test]
async fn failed_pushes_are_retried() {
    let relay = MockTransport::new();
    let a = device(relay.clone()).await;

    relay.fail_pushes(3);
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();

    tokio::time::timeout(PATIENCE, async {
        while relay.items_of_kind(BlobKind::Circle).is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(relay.push_attempts() >= 4);

    let snapshot = wait_for(&a, |s| !s.status.degraded).await;
    assert_eq!(snapshot.circle_status(), CircleStatus::InCircle);
}

// ===========================================
// Fetch Failures
// ===========================================

/// A failed fetch is retried on its own without a new request.
#[tokio::test]
async fn failed_fetch_is_retried() {
    let relay = MockTransport::new();
    let b = device(relay.clone()).await;
    let a = device(relay.clone()).await;
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();

    let attempts = relay.pull_attempts();
    relay.fail_next_pull("connection reset");
    b.engine.fetch().await.unwrap();
    b.engine.settle().await.unwrap();

    let snapshot = wait_for(&b, |s| s.circle.is_some()).await;
    assert_eq!(snapshot.circle_status(), CircleStatus::NotInCircle);
    assert!(relay.pull_attempts() >= attempts + 2);
}

/// Joining while the relay is down waits for it instead of founding a
/// second circle.
#[tokio::test]
async fn join_waits_for_relay() {
    let relay = MockTransport::new();
    let b = device(relay.clone()).await;
    let a = device(relay.clone()).await;
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();

    relay.set_offline(true);
    b.engine.join().await.unwrap();
    let status = b.engine.settle().await.unwrap();
    assert_eq!(status.circle_status, CircleStatus::NotInCircle);
    assert_eq!(status.state, EngineState::Ready);

    relay.set_offline(false);
    let snapshot = wait_for(&b, |s| s.circle_status() == CircleStatus::Applying).await;
    assert_eq!(
        snapshot.circle.as_ref().unwrap().peers().keys().copied().collect::<Vec<_>>(),
        vec![a.id]
    );
}

// ===========================================
// Malformed Blobs
// ===========================================

/// Garbage on the relay is skipped with a warning.
#[tokio::test]
async fn unreadable_blob_is_skipped() {
    use zerok_trust_engine::Transport;
    use zerok_trust_types::BlobKey;

    let relay = MockTransport::new();
    let a = device(relay.clone()).await;
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();

    relay
        .push(&BlobKey::circle("default"), b"not an envelope".to_vec())
        .await
        .unwrap();
    a.engine.fetch().await.unwrap();
    let status = a.engine.settle().await.unwrap();

    assert_eq!(status.state, EngineState::Ready);
    assert!(status.last_warning.is_some());
    assert!(status.last_error.is_none());
}
