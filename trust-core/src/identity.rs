//! Device identity records.
//!
//! A [`LocalIdentity`] holds a device's private keys. The matching
//! [`PeerInfo`] is the self-signed public record other devices see: its
//! id is the fingerprint of the signing key, and its signature covers
//! the keys, the description and the version.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};
use zerok_trust_types::PeerId;

use crate::crypto::{canonical_bytes, random_array, CryptoError};

const PEER_INFO_DOMAIN: &[u8] = b"0k-trust-peer-info-v1";

/// Capability and device attributes advertised by a peer.
pub type Description = BTreeMap<String, String>;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The record's signature does not verify against its signing key.
    #[error("invalid signature on peer info for {peer}")]
    InvalidSignature {
        /// The peer whose record failed.
        peer: PeerId,
    },

    /// The record's id is not the fingerprint of its signing key.
    #[error("peer id {peer} does not match its signing key")]
    IdMismatch {
        /// The claimed id.
        peer: PeerId,
    },

    /// An update was attempted with a key that does not own the record.
    #[error("signing key does not match peer {peer}")]
    KeyMismatch {
        /// The peer that was being updated.
        peer: PeerId,
    },

    /// The record's version counter cannot advance further.
    #[error("peer info version exhausted")]
    VersionExhausted,

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// An X25519 public key peers use to wrap secrets for this device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionPublicKey([u8; 32]);

impl EncryptionPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for EncryptionPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionPublicKey({})", &hex::encode(self.0)[..8])
    }
}

/// Private key material of an identity, for persistence.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentitySeed {
    signing: [u8; 32],
    encryption: [u8; 32],
}

// Intentionally opaque debug to avoid logging secrets
impl std::fmt::Debug for IdentitySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentitySeed([REDACTED])")
    }
}

/// The private half of a device identity.
pub struct LocalIdentity {
    signing: SigningKey,
    encryption: StaticSecret,
    peer_id: PeerId,
}

impl LocalIdentity {
    /// Generate fresh signing and encryption key pairs.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_seed(&IdentitySeed {
            signing: random_array()?,
            encryption: random_array()?,
        }))
    }

    /// Restore an identity from persisted seed material.
    pub fn from_seed(seed: &IdentitySeed) -> Self {
        let signing = SigningKey::from_bytes(&seed.signing);
        let encryption = StaticSecret::from(seed.encryption);
        let peer_id = PeerId::fingerprint(signing.verifying_key().as_bytes());
        Self {
            signing,
            encryption,
            peer_id,
        }
    }

    /// Export the seed material for persistence.
    pub fn seed(&self) -> IdentitySeed {
        IdentitySeed {
            signing: self.signing.to_bytes(),
            encryption: self.encryption.to_bytes(),
        }
    }

    /// This device's stable peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The signing key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The public half of the signing key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The public half of the encryption key.
    pub fn encryption_public_key(&self) -> EncryptionPublicKey {
        EncryptionPublicKey(*PublicKey::from(&self.encryption).as_bytes())
    }

    /// Sign a message with the identity's signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

/// A device's self-signed public identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    id: PeerId,
    signing_key: VerifyingKey,
    encryption_key: EncryptionPublicKey,
    description: Description,
    version: u64,
    signature: Signature,
}

#[derive(Serialize)]
struct SignedPeerFields<'a> {
    id: &'a PeerId,
    signing_key: &'a [u8; 32],
    encryption_key: &'a [u8; 32],
    description: &'a Description,
    version: u64,
}

impl PeerInfo {
    /// Create and sign the record for a local identity.
    pub fn create(identity: &LocalIdentity, description: Description) -> Result<Self, IdentityError> {
        Self::signed(
            identity.signing_key(),
            identity.encryption_public_key(),
            description,
            1,
        )
    }

    fn signed(
        signing: &SigningKey,
        encryption_key: EncryptionPublicKey,
        description: Description,
        version: u64,
    ) -> Result<Self, IdentityError> {
        let signing_key = signing.verifying_key();
        let id = PeerId::fingerprint(signing_key.as_bytes());
        let message = signed_message(&id, &signing_key, &encryption_key, &description, version)?;
        let signature = signing.sign(&message);
        Ok(Self {
            id,
            signing_key,
            encryption_key,
            description,
            version,
            signature,
        })
    }

    /// Check the id fingerprint and the self-signature.
    pub fn verify(&self) -> Result<(), IdentityError> {
        if PeerId::fingerprint(self.signing_key.as_bytes()) != self.id {
            return Err(IdentityError::IdMismatch { peer: self.id });
        }
        let message = signed_message(
            &self.id,
            &self.signing_key,
            &self.encryption_key,
            &self.description,
            self.version,
        )?;
        self.signing_key
            .verify(&message, &self.signature)
            .map_err(|_| IdentityError::InvalidSignature { peer: self.id })
    }

    /// `true` when [`verify`](Self::verify) succeeds.
    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Re-sign the record with a new description and the next version.
    ///
    /// The id is unchanged. Fails with `KeyMismatch` when `signing` is not
    /// the key this record was created with.
    pub fn with_updated_description(
        &self,
        description: Description,
        signing: &SigningKey,
    ) -> Result<Self, IdentityError> {
        if signing.verifying_key() != self.signing_key {
            return Err(IdentityError::KeyMismatch { peer: self.id });
        }
        let version = self
            .version
            .checked_add(1)
            .ok_or(IdentityError::VersionExhausted)?;
        Self::signed(signing, self.encryption_key, description, version)
    }

    /// Stable peer id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Signing public key.
    pub fn signing_key(&self) -> &VerifyingKey {
        &self.signing_key
    }

    /// Encryption public key.
    pub fn encryption_key(&self) -> EncryptionPublicKey {
        self.encryption_key
    }

    /// Advertised attributes.
    pub fn description(&self) -> &Description {
        &self.description
    }

    /// Record version, bumped on every re-sign.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Verify a detached signature made by this peer.
    pub fn verify_signature(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verify(message, signature).is_ok()
    }
}

fn signed_message(
    id: &PeerId,
    signing_key: &VerifyingKey,
    encryption_key: &EncryptionPublicKey,
    description: &Description,
    version: u64,
) -> Result<Vec<u8>, CryptoError> {
    let body = canonical_bytes(&SignedPeerFields {
        id,
        signing_key: signing_key.as_bytes(),
        encryption_key: encryption_key.as_bytes(),
        description,
        version,
    })?;
    let mut message = Vec::with_capacity(PEER_INFO_DOMAIN.len() + body.len());
    message.extend_from_slice(PEER_INFO_DOMAIN);
    message.extend_from_slice(&body);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(name: &str) -> Description {
        let mut d = Description::new();
        d.insert("device".into(), name.into());
        d
    }

    #[test]
    fn created_record_verifies() {
        let identity = LocalIdentity::generate().unwrap();
        let peer = PeerInfo::create(&identity, description("laptop")).unwrap();

        assert!(peer.verify().is_ok());
        assert_eq!(peer.id(), identity.peer_id());
        assert_eq!(peer.version(), 1);
    }

    #[test]
    fn tampered_description_fails_verification() {
        let identity = LocalIdentity::generate().unwrap();
        let mut peer = PeerInfo::create(&identity, description("laptop")).unwrap();
        peer.description.insert("device".into(), "phone".into());

        assert!(matches!(
            peer.verify(),
            Err(IdentityError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn swapped_encryption_key_fails_verification() {
        let identity = LocalIdentity::generate().unwrap();
        let other = LocalIdentity::generate().unwrap();
        let mut peer = PeerInfo::create(&identity, Description::new()).unwrap();
        peer.encryption_key = other.encryption_public_key();

        assert!(!peer.is_valid());
    }

    #[test]
    fn forged_id_fails_verification() {
        let identity = LocalIdentity::generate().unwrap();
        let other = LocalIdentity::generate().unwrap();
        let mut peer = PeerInfo::create(&identity, Description::new()).unwrap();
        peer.id = other.peer_id();

        assert!(matches!(peer.verify(), Err(IdentityError::IdMismatch { .. })));
    }

    #[test]
    fn update_keeps_id_and_bumps_version() {
        let identity = LocalIdentity::generate().unwrap();
        let peer = PeerInfo::create(&identity, description("laptop")).unwrap();

        let updated = peer
            .with_updated_description(description("work laptop"), identity.signing_key())
            .unwrap();

        assert_eq!(updated.id(), peer.id());
        assert_eq!(updated.version(), 2);
        assert_eq!(updated.description()["device"], "work laptop");
        assert!(updated.verify().is_ok());
    }

    #[test]
    fn update_with_foreign_key_is_rejected() {
        let identity = LocalIdentity::generate().unwrap();
        let intruder = LocalIdentity::generate().unwrap();
        let peer = PeerInfo::create(&identity, Description::new()).unwrap();

        let result = peer.with_updated_description(Description::new(), intruder.signing_key());
        assert!(matches!(result, Err(IdentityError::KeyMismatch { .. })));
    }

    #[test]
    fn seed_roundtrip_restores_same_identity() {
        let identity = LocalIdentity::generate().unwrap();
        let restored = LocalIdentity::from_seed(&identity.seed());

        assert_eq!(restored.peer_id(), identity.peer_id());
        assert_eq!(
            restored.encryption_public_key(),
            identity.encryption_public_key()
        );
    }

    #[test]
    fn identity_debug_is_redacted() {
        let identity = LocalIdentity::generate().unwrap();
        assert!(format!("{:?}", identity).contains("REDACTED"));
        assert!(format!("{:?}", identity.seed()).contains("REDACTED"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn create_always_verifies(entries in proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..6)) {
                let identity = LocalIdentity::generate().unwrap();
                let peer = PeerInfo::create(&identity, entries).unwrap();
                prop_assert!(peer.verify().is_ok());
            }
        }
    }
}
