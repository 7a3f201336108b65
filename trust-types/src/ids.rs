//! Identity and ordering types for 0k-Trust.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a peer device.
///
/// SHA-256 fingerprint of the peer's signing public key, displayed as
/// URL-safe base64. Never changes while the signing key is unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive a PeerId from the raw bytes of a signing public key.
    pub fn fingerprint(signing_public_key: &[u8; 32]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"0k-trust-peer-id-v1");
        hasher.update(signing_public_key);
        let result = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Create a PeerId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Get the raw bytes of this PeerId.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_string()[..8])
    }
}

/// Identifier of a top-level key (and the key set built on it).
///
/// UUID v4 format (16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyUuid(uuid::Uuid);

impl KeyUuid {
    /// Create a new random KeyUuid.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Create a KeyUuid from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        uuid::Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Get the raw bytes of this KeyUuid.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for KeyUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyUuid({})", self.0)
    }
}

/// A category of synchronized items. Each view has its own key hierarchy.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewName(String);

impl ViewName {
    /// Create a view name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ViewName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewName({})", self.0)
    }
}

/// Identifier of the account that owns a circle and its engine.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create an account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

/// Version counter on a circle.
///
/// Strictly increasing on every membership-altering mutation. Unlike
/// [`Cursor`], it never saturates: running out of generations is an error.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Generation(u64);

impl Generation {
    /// Create a Generation with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The generation of a freshly created circle.
    pub fn genesis() -> Self {
        Self(1)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The following generation, or `None` on overflow.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

/// A monotonically increasing position in the relay's log.
///
/// Assigned by the relay, not by clients. Used as the `since` token
/// for pulls.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Cursor(u64);

impl Cursor {
    /// Create a new Cursor with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Cursor.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Create a Cursor representing "no data yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the cursor by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({})", self.0)
    }
}

/// What kind of object a relay blob carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobKind {
    /// A serialized circle snapshot.
    Circle = 1,
    /// A batch of TLK shares.
    Shares = 2,
    /// A session coder handshake or ciphertext frame.
    Session = 3,
}

impl BlobKind {
    /// Short lowercase label, used in blob keys and rate-limit categories.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Shares => "shares",
            Self::Session => "session",
        }
    }
}

impl TryFrom<u8> for BlobKind {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Circle),
            2 => Ok(Self::Shares),
            3 => Ok(Self::Session),
            _ => Err(crate::WireError::InvalidBlobKind(value)),
        }
    }
}

/// Who a blob is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Every device of the account.
    Broadcast,
    /// One peer.
    Peer(PeerId),
}

/// Relay key under which a blob is pushed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    kind: BlobKind,
    destination: Destination,
    name: String,
}

impl BlobKey {
    /// Key for a circle snapshot, broadcast to every device.
    pub fn circle(circle_name: &str) -> Self {
        Self {
            kind: BlobKind::Circle,
            destination: Destination::Broadcast,
            name: circle_name.to_string(),
        }
    }

    /// Key for the shares one sender produced for a top-level key.
    pub fn shares(view: &ViewName, tlk: &KeyUuid, sender: &PeerId) -> Self {
        Self {
            kind: BlobKind::Shares,
            destination: Destination::Broadcast,
            name: format!("{}/{}/{}", view, tlk, sender),
        }
    }

    /// Key for a session frame from `sender` to `recipient`.
    pub fn session(sender: &PeerId, recipient: &PeerId) -> Self {
        Self {
            kind: BlobKind::Session,
            destination: Destination::Peer(*recipient),
            name: sender.to_string(),
        }
    }

    /// The kind of object stored under this key.
    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    /// The intended recipient.
    pub fn destination(&self) -> Destination {
        self.destination
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination {
            Destination::Broadcast => write!(f, "{}/*/{}", self.kind.as_str(), self.name),
            Destination::Peer(peer) => write!(f, "{}/{}/{}", self.kind.as_str(), peer, self.name),
        }
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_fingerprint_is_deterministic() {
        let key = [7u8; 32];
        assert_eq!(PeerId::fingerprint(&key), PeerId::fingerprint(&key));
    }

    #[test]
    fn peer_id_differs_per_key() {
        assert_ne!(PeerId::fingerprint(&[1u8; 32]), PeerId::fingerprint(&[2u8; 32]));
    }

    #[test]
    fn peer_id_base64_display() {
        let id = PeerId::fingerprint(&[3u8; 32]);
        assert_eq!(id.to_string().len(), 43); // 32 bytes = 43 base64 chars (no padding)
    }

    #[test]
    fn peer_id_from_invalid_length_fails() {
        assert!(PeerId::from_bytes(&[0u8; 16]).is_none());
        assert!(PeerId::from_bytes(&[0u8; 64]).is_none());
    }

    #[test]
    fn key_uuid_is_unique() {
        assert_ne!(KeyUuid::new(), KeyUuid::new());
    }

    #[test]
    fn generation_next_is_strictly_greater() {
        let g = Generation::genesis();
        let next = g.next().unwrap();
        assert!(next > g);
        assert_eq!(next.value(), 2);
    }

    #[test]
    fn generation_overflow_is_reported() {
        assert!(Generation::new(u64::MAX).next().is_none());
    }

    #[test]
    fn cursor_saturating_add() {
        let c = Cursor::new(u64::MAX);
        assert_eq!(c.next().value(), u64::MAX); // Saturates, doesn't wrap
    }

    #[test]
    fn blob_kind_roundtrip() {
        for val in 1..=3u8 {
            let kind = BlobKind::try_from(val).unwrap();
            assert_eq!(kind as u8, val);
        }
        assert!(BlobKind::try_from(0).is_err());
        assert!(BlobKind::try_from(4).is_err());
    }

    #[test]
    fn session_key_targets_recipient() {
        let a = PeerId::fingerprint(&[1u8; 32]);
        let b = PeerId::fingerprint(&[2u8; 32]);
        let key = BlobKey::session(&a, &b);
        assert_eq!(key.kind(), BlobKind::Session);
        assert_eq!(key.destination(), Destination::Peer(b));
    }

    #[test]
    fn circle_key_is_broadcast() {
        let key = BlobKey::circle("ring");
        assert_eq!(key.destination(), Destination::Broadcast);
        assert_eq!(key.to_string(), "circle/*/ring");
    }

    #[test]
    fn view_name_serializes_as_string() {
        let view = ViewName::new("passwords");
        let json = serde_json::to_string(&view).unwrap();
        assert_eq!(json, "\"passwords\"");
    }
}
