//! Envelope - the wrapper for every blob pushed to the relay.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{BlobKind, PeerId, WireError};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// The envelope wraps every relay blob with routing metadata.
///
/// This is the outer layer that the relay sees. The payload carries its
/// own signatures or encryption; the relay is never trusted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version (currently 1)
    pub version: u8,
    /// Blob kind discriminator
    pub kind: u8,
    /// Peer that produced the blob
    pub sender: PeerId,
    /// Unix timestamp (seconds) - informational only, not trusted
    pub timestamp: u64,
    /// MessagePack-encoded inner object
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap an already-encoded payload.
    pub fn new(kind: BlobKind, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: kind as u8,
            sender,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            payload,
        }
    }

    /// Encode `value` and wrap it.
    pub fn seal<T: Serialize>(kind: BlobKind, sender: PeerId, value: &T) -> Result<Self, WireError> {
        let payload = rmp_serde::to_vec_named(value).map_err(WireError::Serialization)?;
        Ok(Self::new(kind, sender, payload))
    }

    /// Check the kind and decode the inner object.
    pub fn open<T: DeserializeOwned>(&self, expected: BlobKind) -> Result<T, WireError> {
        let actual = self.blob_kind()?;
        if actual != expected {
            return Err(WireError::UnexpectedKind { expected, actual });
        }
        rmp_serde::from_slice(&self.payload).map_err(WireError::Deserialization)
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let envelope: Self = rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(WireError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    /// Get the blob kind as an enum.
    pub fn blob_kind(&self) -> Result<BlobKind, WireError> {
        BlobKind::try_from(self.kind)
    }
}
