//! Error classes shared by every layer.
//!
//! Each concrete error maps to one class, and the class decides what the
//! engine does with it: integrity and crypto failures abort the current
//! operation, trust gaps and transport failures wait and retry.

use crate::circle::CircleError;
use crate::crypto::CryptoError;
use crate::identity::IdentityError;
use crate::keys::KeyError;
use crate::session::SessionError;

/// How an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad signature or generation. Reject wholesale, enter the error state.
    Integrity,
    /// Something needed is not available yet. Re-arm and wait.
    TrustGap,
    /// Relay unreachable or refusing. Back off and retry.
    Transport,
    /// Key generation, wrap or unwrap failed. Abort the operation.
    Crypto,
}

impl ErrorClass {
    /// Whether this class aborts the current operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity | Self::Crypto)
    }
}

/// Classify an error.
pub trait Classify {
    /// The error's class.
    fn class(&self) -> ErrorClass;
}

impl Classify for CryptoError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Crypto
    }
}

impl Classify for IdentityError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Crypto(_) => ErrorClass::Crypto,
            _ => ErrorClass::Integrity,
        }
    }
}

impl Classify for CircleError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Crypto(_) => ErrorClass::Crypto,
            Self::Identity(e) => e.class(),
            Self::NotAMember { .. } => ErrorClass::TrustGap,
            _ => ErrorClass::Integrity,
        }
    }
}

impl Classify for KeyError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::MissingTrustedShare { .. }
            | Self::NoCurrentKeySet { .. }
            | Self::DeviceLocked
            | Self::NotInCircle { .. } => ErrorClass::TrustGap,
            Self::EpochExhausted { .. } => ErrorClass::Integrity,
            Self::MalformedShare(_) | Self::Crypto(_) => ErrorClass::Crypto,
        }
    }
}

impl Classify for SessionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidState { .. } => ErrorClass::TrustGap,
            Self::Handshake(_) | Self::Faulted { .. } | Self::Decode(_) => ErrorClass::Integrity,
            Self::Encoding(_) | Self::Crypto(_) => ErrorClass::Crypto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerok_trust_types::ViewName;

    #[test]
    fn missing_share_is_trust_gap() {
        let err = KeyError::MissingTrustedShare {
            view: ViewName::new("v"),
        };
        assert_eq!(err.class(), ErrorClass::TrustGap);
        assert!(!err.class().is_fatal());
    }

    #[test]
    fn circle_integrity_is_fatal() {
        let err = CircleError::Integrity {
            reason: "bad signature".into(),
        };
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(err.class().is_fatal());
    }

    #[test]
    fn crypto_errors_are_fatal() {
        assert!(CryptoError::DecryptionFailed.class().is_fatal());
        assert_eq!(
            KeyError::Crypto(CryptoError::WeakKeyAgreement).class(),
            ErrorClass::Crypto
        );
    }

    #[test]
    fn locked_device_waits() {
        assert_eq!(KeyError::DeviceLocked.class(), ErrorClass::TrustGap);
    }
}
