//! Per-view key hierarchy and TLK shares.
//!
//! Each view has a chain of [`KeySet`]s ordered by epoch. Exactly one of
//! them is current; older ones are kept so existing data stays readable.
//! A key set's top-level key (TLK) reaches other devices as
//! [`TlkShare`]s: the TLK sealed to one peer's encryption key and signed
//! by the sender. A device only installs a TLK from a share signed by a
//! current circle member.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use zerok_trust_types::{KeyUuid, PeerId, ViewName};

use crate::circle::Circle;
use crate::crypto::{canonical_bytes, CryptoError, Sealed, SealedBox, SymmetricKey, KEY_SIZE};
use crate::identity::{EncryptionPublicKey, LocalIdentity, PeerInfo};

const SHARE_DOMAIN: &[u8] = b"0k-trust-tlk-share-v1";
const CLASS_A_LABEL: &[u8] = b"class-a";
const CLASS_C_LABEL: &[u8] = b"class-c";

/// Key hierarchy errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No share from a trusted member is addressed to this device yet.
    #[error("no trusted share available for view {view}")]
    MissingTrustedShare {
        /// The view waiting for a key.
        view: ViewName,
    },

    /// The view has no current key set.
    #[error("no current key set for view {view}")]
    NoCurrentKeySet {
        /// The view.
        view: ViewName,
    },

    /// Class A keys are only released while the device is unlocked.
    #[error("device is locked")]
    DeviceLocked,

    /// Only circle members produce key material.
    #[error("local peer {peer} is not a circle member")]
    NotInCircle {
        /// The local peer.
        peer: PeerId,
    },

    /// The epoch counter cannot advance further.
    #[error("key epoch exhausted for view {view}")]
    EpochExhausted {
        /// The view.
        view: ViewName,
    },

    /// A share failed to decode into a key.
    #[error("malformed share: {0}")]
    MalformedShare(String),

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Whether the device currently allows class A keys to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Screen locked; class A keys unavailable.
    Locked,
    /// Unlocked.
    Unlocked,
}

/// The keys protecting one view at one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    view: ViewName,
    uuid: KeyUuid,
    epoch: u64,
    top_level_key: SymmetricKey,
    class_a: Sealed,
    class_c: Sealed,
    is_current: bool,
}

impl KeySet {
    /// Build a key set around a top-level key, deriving and wrapping the
    /// class keys.
    pub fn from_top_level_key(
        view: ViewName,
        uuid: KeyUuid,
        epoch: u64,
        top_level_key: SymmetricKey,
    ) -> Result<Self, KeyError> {
        let class_a = top_level_key.derive(CLASS_A_LABEL)?;
        let class_c = top_level_key.derive(CLASS_C_LABEL)?;
        let class_a = top_level_key.encrypt(class_a.as_bytes(), &class_aad(&uuid, CLASS_A_LABEL))?;
        let class_c = top_level_key.encrypt(class_c.as_bytes(), &class_aad(&uuid, CLASS_C_LABEL))?;
        Ok(Self {
            view,
            uuid,
            epoch,
            top_level_key,
            class_a,
            class_c,
            is_current: false,
        })
    }

    /// The view this key set protects.
    pub fn view(&self) -> &ViewName {
        &self.view
    }

    /// Unique id of the top-level key.
    pub fn uuid(&self) -> KeyUuid {
        self.uuid
    }

    /// Rotation counter within the view.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether new data is written under this key set.
    pub fn is_current(&self) -> bool {
        self.is_current
    }

    /// The top-level key.
    pub fn top_level_key(&self) -> &SymmetricKey {
        &self.top_level_key
    }

    /// Key for items readable only while the device is unlocked.
    pub fn class_a_key(&self, lock_state: LockState) -> Result<SymmetricKey, KeyError> {
        if lock_state == LockState::Locked {
            return Err(KeyError::DeviceLocked);
        }
        self.unwrap_class(&self.class_a, CLASS_A_LABEL)
    }

    /// Key for items readable after first unlock.
    pub fn class_c_key(&self) -> Result<SymmetricKey, KeyError> {
        self.unwrap_class(&self.class_c, CLASS_C_LABEL)
    }

    fn unwrap_class(&self, sealed: &Sealed, label: &[u8]) -> Result<SymmetricKey, KeyError> {
        let bytes = self
            .top_level_key
            .decrypt(sealed, &class_aad(&self.uuid, label))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::MalformedShare("class key has wrong length".into()))?;
        Ok(SymmetricKey::from_bytes(bytes))
    }
}

fn class_aad(uuid: &KeyUuid, label: &[u8]) -> Vec<u8> {
    let mut aad = uuid.as_bytes().to_vec();
    aad.extend_from_slice(label);
    aad
}

/// A TLK sealed to one peer and signed by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlkShare {
    tlk_uuid: KeyUuid,
    view: ViewName,
    epoch: u64,
    sender: PeerId,
    receiver: PeerId,
    receiver_key: EncryptionPublicKey,
    wrapped: SealedBox,
    signature: Signature,
}

#[derive(Serialize)]
struct ShareHeader<'a> {
    tlk_uuid: &'a KeyUuid,
    view: &'a ViewName,
    epoch: u64,
    sender: &'a PeerId,
    receiver: &'a PeerId,
    receiver_key: &'a EncryptionPublicKey,
}

impl TlkShare {
    /// Seal `key_set`'s TLK to `receiver` and sign it.
    pub fn create(key_set: &KeySet, sender: &LocalIdentity, receiver: &PeerInfo) -> Result<Self, KeyError> {
        let header = ShareHeader {
            tlk_uuid: &key_set.uuid,
            view: &key_set.view,
            epoch: key_set.epoch,
            sender: &sender.peer_id(),
            receiver: &receiver.id(),
            receiver_key: &receiver.encryption_key(),
        };
        let aad = canonical_bytes(&header)?;
        let wrapped = SealedBox::seal(
            &receiver.encryption_key().to_x25519(),
            key_set.top_level_key.as_bytes(),
            &aad,
        )?;

        let mut share = Self {
            tlk_uuid: key_set.uuid,
            view: key_set.view.clone(),
            epoch: key_set.epoch,
            sender: sender.peer_id(),
            receiver: receiver.id(),
            receiver_key: receiver.encryption_key(),
            wrapped,
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        share.signature = sender.sign(&share.signed_bytes()?);
        Ok(share)
    }

    fn header(&self) -> ShareHeader<'_> {
        ShareHeader {
            tlk_uuid: &self.tlk_uuid,
            view: &self.view,
            epoch: self.epoch,
            sender: &self.sender,
            receiver: &self.receiver,
            receiver_key: &self.receiver_key,
        }
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut message = SHARE_DOMAIN.to_vec();
        message.extend_from_slice(&canonical_bytes(&(self.header(), &self.wrapped))?);
        Ok(message)
    }

    /// Whether the share was signed by `sender_info`.
    pub fn is_signed_by(&self, sender_info: &PeerInfo) -> bool {
        if sender_info.id() != self.sender {
            return false;
        }
        match self.signed_bytes() {
            Ok(message) => sender_info.verify_signature(&message, &self.signature),
            Err(_) => false,
        }
    }

    /// Whether this share is addressed to `identity`.
    pub fn is_addressed_to(&self, identity: &LocalIdentity) -> bool {
        self.receiver == identity.peer_id() && self.receiver_key == identity.encryption_public_key()
    }

    /// Open the TLK with the receiver's identity.
    pub fn open(&self, identity: &LocalIdentity) -> Result<SymmetricKey, KeyError> {
        let aad = canonical_bytes(&self.header())?;
        let bytes = self.wrapped.open(identity.encryption_secret(), &aad)?;
        let bytes: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::MalformedShare("top-level key has wrong length".into()))?;
        Ok(SymmetricKey::from_bytes(bytes))
    }

    /// Id of the shared top-level key.
    pub fn tlk_uuid(&self) -> KeyUuid {
        self.tlk_uuid
    }

    /// View the key belongs to.
    pub fn view(&self) -> &ViewName {
        &self.view
    }

    /// Epoch of the shared key set.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Producer of the share.
    pub fn sender(&self) -> PeerId {
        self.sender
    }

    /// Intended recipient.
    pub fn receiver(&self) -> PeerId {
        self.receiver
    }

    /// Encryption key the TLK was sealed to.
    pub fn receiver_key(&self) -> EncryptionPublicKey {
        self.receiver_key
    }
}

/// Whether `candidate` should replace `current`: a newer epoch wins, and
/// on equal epochs the smaller uuid wins so concurrent rotations converge.
fn supersedes(candidate: &KeySet, current: &KeySet) -> bool {
    (candidate.epoch, std::cmp::Reverse(candidate.uuid)) > (current.epoch, std::cmp::Reverse(current.uuid))
}

/// Output of [`KeyHierarchy::rotate`].
#[derive(Debug, Clone)]
pub struct Rotation {
    /// The new current key set.
    pub key_set: KeySet,
    /// One share per circle member, the local device included.
    pub shares: Vec<TlkShare>,
}

/// All key sets and shares one device knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHierarchy {
    key_sets: BTreeMap<ViewName, Vec<KeySet>>,
    shares: BTreeMap<KeyUuid, Vec<TlkShare>>,
}

impl KeyHierarchy {
    /// Empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// The key set new data in `view` must be written under.
    pub fn current_key_set(&self, view: &ViewName) -> Option<&KeySet> {
        self.key_sets
            .get(view)
            .and_then(|sets| sets.iter().find(|set| set.is_current))
    }

    /// Every key set of `view`, oldest epoch first.
    pub fn key_sets(&self, view: &ViewName) -> &[KeySet] {
        self.key_sets.get(view).map_or(&[], Vec::as_slice)
    }

    /// Look up a key set by id, current or retained.
    pub fn key_set(&self, uuid: &KeyUuid) -> Option<&KeySet> {
        self.key_sets
            .values()
            .flatten()
            .find(|set| set.uuid == *uuid)
    }

    /// Views that have at least one key set.
    pub fn views(&self) -> impl Iterator<Item = &ViewName> {
        self.key_sets.keys()
    }

    /// Shares recorded for a top-level key.
    pub fn shares_for(&self, uuid: &KeyUuid) -> &[TlkShare] {
        self.shares.get(uuid).map_or(&[], Vec::as_slice)
    }

    /// Every recorded share for `view`.
    pub fn shares_for_view(&self, view: &ViewName) -> Vec<TlkShare> {
        self.shares
            .values()
            .flatten()
            .filter(|share| share.view == *view)
            .cloned()
            .collect()
    }

    /// Views whose current key set has been shared with `peer`.
    pub fn views_shared_with(&self, peer: &PeerId) -> Vec<ViewName> {
        self.key_sets
            .iter()
            .filter_map(|(view, sets)| {
                let current = sets.iter().find(|set| set.is_current)?;
                self.shares_for(&current.uuid)
                    .iter()
                    .any(|share| share.receiver == *peer)
                    .then(|| view.clone())
            })
            .collect()
    }

    /// Replace `view`'s current key set with a fresh one and share it with
    /// every member of `circle`.
    pub fn rotate(
        &mut self,
        view: &ViewName,
        circle: &Circle,
        identity: &LocalIdentity,
    ) -> Result<Rotation, KeyError> {
        if !circle.is_member(&identity.peer_id()) {
            return Err(KeyError::NotInCircle {
                peer: identity.peer_id(),
            });
        }
        let epoch = self
            .key_sets(view)
            .iter()
            .map(|set| set.epoch)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| KeyError::EpochExhausted { view: view.clone() })?;

        let mut key_set =
            KeySet::from_top_level_key(view.clone(), KeyUuid::new(), epoch, SymmetricKey::random()?)?;
        let shares = circle
            .peers()
            .values()
            .map(|peer| TlkShare::create(&key_set, identity, peer))
            .collect::<Result<Vec<_>, _>>()?;

        key_set.is_current = true;
        self.install(key_set.clone());
        self.record(&shares);
        Ok(Rotation { key_set, shares })
    }

    /// Install the newest TLK for `view` found in `shares`.
    ///
    /// Only shares addressed to this device and signed by a member of
    /// `circle` count. Leaves the hierarchy unchanged on failure.
    pub fn ingest_shares(
        &mut self,
        view: &ViewName,
        shares: &[TlkShare],
        circle: &Circle,
        identity: &LocalIdentity,
    ) -> Result<KeySet, KeyError> {
        let best = shares
            .iter()
            .filter(|share| share.view == *view && share.is_addressed_to(identity))
            .filter(|share| {
                circle
                    .peers()
                    .get(&share.sender)
                    .map_or(false, |sender| share.is_signed_by(sender))
            })
            .max_by_key(|share| (share.epoch, std::cmp::Reverse(share.tlk_uuid)))
            .ok_or_else(|| KeyError::MissingTrustedShare { view: view.clone() })?;

        if let Some(existing) = self.key_set(&best.tlk_uuid) {
            return Ok(existing.clone());
        }

        let tlk = best.open(identity)?;
        let mut key_set = KeySet::from_top_level_key(view.clone(), best.tlk_uuid, best.epoch, tlk)?;
        key_set.is_current = match self.current_key_set(view) {
            None => true,
            Some(current) => supersedes(&key_set, current),
        };

        self.install(key_set.clone());
        self.record(std::slice::from_ref(best));
        Ok(key_set)
    }

    /// Produce shares of `key_set` for circle members that lack one.
    pub fn issue_missing_shares(
        &mut self,
        key_set: &KeySet,
        circle: &Circle,
        identity: &LocalIdentity,
    ) -> Result<Vec<TlkShare>, KeyError> {
        if !circle.is_member(&identity.peer_id()) {
            return Err(KeyError::NotInCircle {
                peer: identity.peer_id(),
            });
        }
        let existing = self.shares_for(&key_set.uuid);
        let missing = circle
            .peers()
            .values()
            .filter(|peer| {
                !existing.iter().any(|share| {
                    share.receiver == peer.id() && share.receiver_key == peer.encryption_key()
                })
            })
            .map(|peer| TlkShare::create(key_set, identity, peer))
            .collect::<Result<Vec<_>, _>>()?;

        self.record(&missing);
        Ok(missing)
    }

    /// Remember shares seen on the relay, whoever they are for.
    pub fn record_shares(&mut self, shares: &[TlkShare]) {
        self.record(shares);
    }

    /// Stop treating any key set as current and forget recorded shares.
    ///
    /// Used when the device leaves the circle or loses a founding race.
    /// Key sets stay installed so old data can still be decrypted.
    pub fn relinquish(&mut self) {
        for set in self.key_sets.values_mut().flatten() {
            set.is_current = false;
        }
        self.shares.clear();
    }

    fn install(&mut self, key_set: KeySet) {
        let sets = self.key_sets.entry(key_set.view.clone()).or_default();
        if key_set.is_current {
            for set in sets.iter_mut() {
                set.is_current = false;
            }
        }
        sets.push(key_set);
        sets.sort_by_key(|set| set.epoch);
    }

    fn record(&mut self, shares: &[TlkShare]) {
        for share in shares {
            let recorded = self.shares.entry(share.tlk_uuid).or_default();
            if !recorded.contains(share) {
                recorded.push(share.clone());
            }
        }
    }
}
