//! Encrypted peer sessions between circle members.

mod common;

use common::*;
use zerok_trust_core::{Frame, LocalIdentity, SessionCoder};
use zerok_trust_engine::{MockTransport, PeerMessage, Transport};
use zerok_trust_types::{BlobKey, BlobKind, Envelope, PeerId};

async fn next_message(inbox: &mut tokio::sync::broadcast::Receiver<PeerMessage>) -> PeerMessage {
    tokio::time::timeout(PATIENCE, inbox.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Push a session frame that claims to come from `sender`.
async fn inject(relay: &MockTransport, sender: PeerId, recipient: PeerId, frame: &Frame) {
    let blob = Envelope::seal(BlobKind::Session, sender, frame)
        .unwrap()
        .to_bytes()
        .unwrap();
    relay
        .push(&BlobKey::session(&sender, &recipient), blob)
        .await
        .unwrap();
}

/// A message to another member is delivered after the handshake.
#[tokio::test]
async fn message_reaches_member() {
    let relay = MockTransport::new();
    let (a, b) = founded_pair(&relay).await;
    let mut inbox = b.engine.subscribe_messages();

    a.engine.send_to(b.id, b"rendezvous".to_vec()).await.unwrap();
    a.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;

    let message = tokio::time::timeout(PATIENCE, inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        message,
        PeerMessage {
            from: a.id,
            payload: b"rendezvous".to_vec(),
        }
    );

    // Nothing on the relay carries the plaintext.
    for item in relay.items_of_kind(BlobKind::Session) {
        assert!(!item.blob.windows(10).any(|w| w == b"rendezvous"));
    }
}

/// Once established, a session carries traffic both ways.
#[tokio::test]
async fn session_carries_replies() {
    let relay = MockTransport::new();
    let (a, b) = founded_pair(&relay).await;
    let mut a_inbox = a.engine.subscribe_messages();
    let mut b_inbox = b.engine.subscribe_messages();

    a.engine.send_to(b.id, b"ping".to_vec()).await.unwrap();
    a.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;
    let ping = tokio::time::timeout(PATIENCE, b_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ping.payload, b"ping".to_vec());

    b.engine.send_to(a.id, b"pong".to_vec()).await.unwrap();
    b.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;
    let pong = tokio::time::timeout(PATIENCE, a_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pong.from, b.id);
    assert_eq!(pong.payload, b"pong".to_vec());
}

/// Messages for devices outside the circle are dropped.
#[tokio::test]
async fn message_to_non_member_is_dropped() {
    let relay = MockTransport::new();
    let a = device(relay.clone()).await;
    a.engine.join().await.unwrap();
    a.engine.settle().await.unwrap();
    let outsider = device(relay.clone()).await;

    a.engine.send_to(outsider.id, b"secret".to_vec()).await.unwrap();
    let status = a.engine.settle().await.unwrap();

    assert!(status.last_warning.is_some());
    assert!(relay.items_of_kind(BlobKind::Session).is_empty());
}

// ===========================================
// Recovery
// ===========================================

/// A close frame the relay fabricates from captured traffic does not end
/// the session.
#[tokio::test]
async fn fabricated_close_leaves_session_open() {
    let relay = MockTransport::new();
    let (a, b) = founded_pair(&relay).await;
    let mut inbox = b.engine.subscribe_messages();

    a.engine.send_to(b.id, b"one".to_vec()).await.unwrap();
    a.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;
    assert_eq!(next_message(&mut inbox).await.payload, b"one".to_vec());

    let key = BlobKey::session(&a.id, &b.id);
    let captured = relay
        .items_of_kind(BlobKind::Session)
        .into_iter()
        .filter(|item| item.key == key)
        .filter_map(|item| {
            let envelope = Envelope::from_bytes(&item.blob).ok()?;
            match envelope.open::<Frame>(BlobKind::Session).ok()? {
                Frame::Data { counter, sealed } => Some(Frame::Close { counter, sealed }),
                _ => None,
            }
        })
        .last()
        .unwrap();
    inject(&relay, a.id, b.id, &captured).await;

    b.engine.fetch().await.unwrap();
    assert!(b.engine.settle().await.unwrap().last_warning.is_some());

    a.engine.send_to(b.id, b"two".to_vec()).await.unwrap();
    a.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;
    let message = next_message(&mut inbox).await;
    assert_eq!(message.from, a.id);
    assert_eq!(message.payload, b"two".to_vec());
}

/// A coder faulted by forged hellos restarts when the real peer opens a
/// session.
#[tokio::test]
async fn faulted_session_restarts_on_genuine_hello() {
    let relay = MockTransport::new();
    let (a, b) = founded_pair(&relay).await;
    let mut inbox = b.engine.subscribe_messages();
    let b_info = a
        .engine
        .snapshot()
        .circle
        .as_ref()
        .unwrap()
        .peers()
        .get(&b.id)
        .cloned()
        .unwrap();

    let mallory = LocalIdentity::generate().unwrap();
    for _ in 0..zerok_trust_core::session::DEFAULT_MAX_HANDSHAKE_FAILURES {
        let hello = SessionCoder::new(b_info.clone()).start(&mallory).unwrap();
        inject(&relay, a.id, b.id, &hello).await;
    }
    b.engine.fetch().await.unwrap();
    assert!(b.engine.settle().await.unwrap().last_warning.is_some());

    a.engine.send_to(b.id, b"after the fault".to_vec()).await.unwrap();
    a.engine.settle().await.unwrap();
    sync_all(&[&a, &b]).await;
    let message = next_message(&mut inbox).await;
    assert_eq!(message.payload, b"after the fault".to_vec());
}
