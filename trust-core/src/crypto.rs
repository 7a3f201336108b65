//! Cryptographic primitives for 0k-Trust.
//!
//! This module provides:
//! - [`SymmetricKey`]: 256-bit keys with XChaCha20-Poly1305 encryption and
//!   HKDF-SHA256 subkey derivation
//! - [`SealedBox`]: ephemeral X25519 wrapping of a secret to one peer's
//!   encryption public key
//! - SHA-256 content digests
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Every derivation is domain-separated by an HKDF salt and info label
//! - Low-order X25519 points are rejected (non-contributory DH)

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

const KEY_HIERARCHY_SALT: &[u8] = b"0k-trust-key-hierarchy-v1";
const SEALED_BOX_SALT: &[u8] = b"0k-trust-sealed-box-v1";

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The system random source failed.
    #[error("random generation failed: {0}")]
    Random(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The peer's public key produced a non-contributory shared secret.
    #[error("key agreement produced a low-order shared secret")]
    WeakKeyAgreement,

    /// Canonical encoding for signing failed.
    #[error("canonical encoding failed: {0}")]
    Encoding(String),
}

/// Fill a fixed-size array from the OS random source.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(bytes)
}

/// SHA-256 over a domain label followed by each part.
pub fn digest(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    bytes
}

/// Deterministic MessagePack encoding of a value, for signing and hashing.
///
/// Callers only pass types built from ordered collections, so the encoding
/// of equal values is byte-identical.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    rmp_serde::to_vec(value).map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Ciphertext plus the nonce it was produced with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    /// Random 192-bit nonce.
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a fresh random key.
    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self(random_array()?))
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derive a labelled subkey with HKDF-SHA256.
    pub fn derive(&self, label: &[u8]) -> Result<SymmetricKey, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(KEY_HIERARCHY_SALT), &self.0);
        let mut out = [0u8; KEY_SIZE];
        hkdf.expand(label, &mut out)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(Self(out))
    }

    /// Encrypt with XChaCha20-Poly1305, binding `aad`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
        let nonce_bytes: [u8; NONCE_SIZE] = random_array()?;
        self.encrypt_with_nonce(nonce_bytes, plaintext, aad)
    }

    /// Encrypt with a caller-chosen nonce. The caller guarantees uniqueness.
    pub fn encrypt_with_nonce(
        &self,
        nonce: [u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Sealed, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))?;

        Ok(Sealed { nonce, ciphertext })
    }

    /// Decrypt and authenticate.
    pub fn decrypt(&self, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        cipher
            .decrypt(
                XNonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// A secret wrapped to one recipient's X25519 public key.
///
/// The sender generates a throwaway key pair, so only the recipient's
/// static secret can reopen the box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Sender's ephemeral public key.
    pub ephemeral: [u8; 32],
    /// Secret encrypted under the agreed key.
    pub sealed: Sealed,
}

impl SealedBox {
    /// Wrap `plaintext` to `recipient`, binding `aad`.
    pub fn seal(recipient: &PublicKey, plaintext: &[u8], aad: &[u8]) -> Result<Self, CryptoError> {
        let ephemeral_secret = StaticSecret::from(random_array::<32>()?);
        let ephemeral = PublicKey::from(&ephemeral_secret);
        let key = box_key(&ephemeral_secret, recipient, ephemeral.as_bytes(), recipient.as_bytes())?;
        let sealed = key.encrypt(plaintext, aad)?;
        Ok(Self {
            ephemeral: *ephemeral.as_bytes(),
            sealed,
        })
    }

    /// Unwrap with the recipient's static secret.
    pub fn open(&self, recipient: &StaticSecret, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = PublicKey::from(self.ephemeral);
        let recipient_public = PublicKey::from(recipient);
        let key = box_key(recipient, &ephemeral, &self.ephemeral, recipient_public.as_bytes())?;
        key.decrypt(&self.sealed, aad)
    }
}

fn box_key(
    secret: &StaticSecret,
    public: &PublicKey,
    ephemeral: &[u8; 32],
    recipient: &[u8; 32],
) -> Result<SymmetricKey, CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKeyAgreement);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SEALED_BOX_SALT), shared.as_bytes());
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);

    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut out)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(SymmetricKey(out))
}
