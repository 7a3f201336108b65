//! The trust circle: a signed, generation-counted membership set.
//!
//! Every operation here is pure: it takes a snapshot and returns a new
//! one. A successor snapshot always has a strictly greater generation,
//! records the digest of the snapshot it was derived from, and carries
//! only the signature of the device that produced it. Other members add
//! their signatures with [`Circle::countersign`].
//!
//! Each successor also records the membership of its parent, so a
//! device holding only the latest snapshot can still check a sibling
//! derived from the same parent.
//!
//! Conflicts between two snapshots are settled by [`Circle::merge`]:
//! the higher generation wins outright; on a tie the snapshot with the
//! smaller content digest wins, provided the parent membership
//! authorized it.

use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use zerok_trust_types::{Generation, PeerId};

use crate::crypto::{canonical_bytes, digest, CryptoError};
use crate::identity::{IdentityError, LocalIdentity, PeerInfo};

const CIRCLE_DOMAIN: &[u8] = b"0k-trust-circle-v1";

/// Circle errors.
#[derive(Debug, Error)]
pub enum CircleError {
    /// The peer is not one of the account's provisioned machines.
    #[error("peer {peer} is not an authorized machine for this account")]
    NotAuthorized {
        /// The rejected peer.
        peer: PeerId,
    },

    /// The peer is already a member.
    #[error("peer {peer} is already a member")]
    AlreadyMember {
        /// The peer.
        peer: PeerId,
    },

    /// The peer has already applied.
    #[error("peer {peer} has already applied")]
    AlreadyApplied {
        /// The peer.
        peer: PeerId,
    },

    /// The peer was rejected earlier and may not re-apply.
    #[error("peer {peer} was rejected")]
    Rejected {
        /// The peer.
        peer: PeerId,
    },

    /// No applicant with this id.
    #[error("unknown applicant {peer}")]
    UnknownApplicant {
        /// The missing applicant.
        peer: PeerId,
    },

    /// No member with this id.
    #[error("unknown peer {peer}")]
    UnknownPeer {
        /// The missing peer.
        peer: PeerId,
    },

    /// The acting device is not a member of the circle.
    #[error("local peer {peer} is not a member")]
    NotAMember {
        /// The acting device.
        peer: PeerId,
    },

    /// A device cannot remove itself; it retires instead.
    #[error("a peer cannot remove itself, retire instead")]
    CannotRemoveSelf,

    /// The two snapshots describe different circles.
    #[error("circle name mismatch: local {local}, remote {remote}")]
    NameMismatch {
        /// Local circle name.
        local: String,
        /// Remote circle name.
        remote: String,
    },

    /// The generation counter cannot advance further.
    #[error("circle generation exhausted")]
    GenerationExhausted,

    /// The snapshot failed verification and was rejected as a whole.
    #[error("circle integrity error: {reason}")]
    Integrity {
        /// What failed.
        reason: String,
    },

    /// Underlying identity failure.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl CircleError {
    fn integrity(reason: impl Into<String>) -> Self {
        Self::Integrity {
            reason: reason.into(),
        }
    }

    /// Whether membership rules refused the change.
    ///
    /// The circle itself is fine; the change should be dropped.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized { .. }
                | Self::AlreadyMember { .. }
                | Self::AlreadyApplied { .. }
                | Self::Rejected { .. }
                | Self::UnknownApplicant { .. }
                | Self::UnknownPeer { .. }
                | Self::NotAMember { .. }
                | Self::CannotRemoveSelf
        )
    }
}

/// SHA-256 digest of a circle's signed content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircleDigest([u8; 32]);

impl CircleDigest {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CircleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CircleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircleDigest({})", &hex::encode(self.0)[..12])
    }
}

/// The machine identities the account is provisioned with.
///
/// Supplied by the provisioning layer. Only listed peers may apply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineList {
    allowed: Option<BTreeSet<PeerId>>,
}

impl MachineList {
    /// Allow exactly the given peers.
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            allowed: Some(peers.into_iter().collect()),
        }
    }

    /// Allow any peer. Used when no provisioning layer is present.
    pub fn unrestricted() -> Self {
        Self { allowed: None }
    }

    /// Whether `peer` may join.
    pub fn allows(&self, peer: &PeerId) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(peer))
    }
}

/// Where a device stands relative to a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleStatus {
    /// Not a member and not applying.
    NotInCircle,
    /// Waiting for a member to accept the application.
    Applying,
    /// A trusted member.
    InCircle,
    /// Left the circle.
    Retired,
}

/// The ids that decide who may change a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Membership {
    peers: BTreeSet<PeerId>,
    applicants: BTreeSet<PeerId>,
    rejected: BTreeSet<PeerId>,
}

impl Membership {
    /// Trusted members.
    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    /// Check that `successor` was produced by someone allowed to make its
    /// changes relative to this membership.
    ///
    /// Membership changes must be signed by a current member. An applicant
    /// may only add itself to the applicant list, and the successor must
    /// name this membership as its parent's.
    fn authorizes(&self, successor: &Circle) -> Result<(), CircleError> {
        let signed_by_member = successor
            .signatures
            .keys()
            .any(|signer| self.peers.contains(signer));
        if signed_by_member {
            return Ok(());
        }

        let membership_unchanged = self.peers.iter().eq(successor.peers.keys())
            && self.rejected.iter().eq(successor.rejected.keys());
        let added_only_signers = successor
            .applicants
            .keys()
            .filter(|id| !self.applicants.contains(id))
            .all(|id| successor.signatures.contains_key(id));
        let claims_this_parent = successor
            .parent_membership
            .as_ref()
            .map_or(false, |parent| {
                parent.peers == self.peers && parent.rejected == self.rejected
            });

        if membership_unchanged && added_only_signers && claims_this_parent {
            Ok(())
        } else {
            Err(CircleError::integrity(
                "membership change not signed by a current member",
            ))
        }
    }
}

/// A circle snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    name: String,
    generation: Generation,
    parent: Option<CircleDigest>,
    parent_membership: Option<Membership>,
    peers: BTreeMap<PeerId, PeerInfo>,
    applicants: BTreeMap<PeerId, PeerInfo>,
    rejected: BTreeMap<PeerId, PeerInfo>,
    retired: BTreeMap<PeerId, PeerInfo>,
    signatures: BTreeMap<PeerId, Signature>,
}

#[derive(Serialize)]
struct SignedCircleFields<'a> {
    name: &'a str,
    generation: Generation,
    parent: &'a Option<CircleDigest>,
    parent_membership: &'a Option<Membership>,
    peers: &'a BTreeMap<PeerId, PeerInfo>,
    applicants: &'a BTreeMap<PeerId, PeerInfo>,
    rejected: &'a BTreeMap<PeerId, PeerInfo>,
    retired: &'a BTreeMap<PeerId, PeerInfo>,
}

/// How [`Circle::merge`] settled two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same content; signatures were combined.
    Identical,
    /// The local snapshot has the higher generation.
    LocalNewer,
    /// The remote snapshot has the higher generation.
    RemoteNewer,
    /// Same generation, different content; the local snapshot won the tie-break.
    TieLocalWon,
    /// Same generation, different content; the remote snapshot won and
    /// the local author must re-derive its change on top of it.
    TieRemoteWon,
    /// Same generation on another branch, signed by no current member.
    /// The local snapshot is kept.
    Unverified,
}

impl MergeOutcome {
    /// Whether the merged snapshot is the remote one.
    pub fn adopted_remote(&self) -> bool {
        matches!(self, Self::RemoteNewer | Self::TieRemoteWon)
    }
}

/// Result of a merge.
#[derive(Debug, Clone)]
pub struct Merged {
    /// The snapshot to keep.
    pub circle: Circle,
    /// How it was chosen.
    pub outcome: MergeOutcome,
}

impl Circle {
    /// Create a genesis circle with `identity` as its only member.
    pub fn new(name: &str, founder: &PeerInfo, identity: &LocalIdentity) -> Result<Self, CircleError> {
        founder.verify()?;
        if founder.id() != identity.peer_id() {
            return Err(CircleError::Identity(IdentityError::KeyMismatch {
                peer: founder.id(),
            }));
        }
        let mut circle = Self {
            name: name.to_string(),
            generation: Generation::genesis(),
            parent: None,
            parent_membership: None,
            peers: BTreeMap::new(),
            applicants: BTreeMap::new(),
            rejected: BTreeMap::new(),
            retired: BTreeMap::new(),
            signatures: BTreeMap::new(),
        };
        circle.peers.insert(founder.id(), founder.clone());
        circle.sign_with(identity)?;
        Ok(circle)
    }

    // ===========================================
    // Accessors
    // ===========================================

    /// Circle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Digest of the snapshot this one was derived from.
    pub fn parent(&self) -> Option<CircleDigest> {
        self.parent
    }

    /// Membership of the snapshot this one was derived from.
    pub fn parent_membership(&self) -> Option<&Membership> {
        self.parent_membership.as_ref()
    }

    /// The ids that decide who may change this snapshot.
    pub fn membership(&self) -> Membership {
        Membership {
            peers: self.peers.keys().copied().collect(),
            applicants: self.applicants.keys().copied().collect(),
            rejected: self.rejected.keys().copied().collect(),
        }
    }

    /// Whether this is a genesis snapshot.
    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }

    /// Trusted members.
    pub fn peers(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.peers
    }

    /// Devices requesting entry.
    pub fn applicants(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.applicants
    }

    /// Devices whose application was refused.
    pub fn rejected(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.rejected
    }

    /// Devices that left on their own.
    pub fn retired(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.retired
    }

    /// Signatures over the current snapshot.
    pub fn signatures(&self) -> &BTreeMap<PeerId, Signature> {
        &self.signatures
    }

    /// Whether `peer` is a trusted member.
    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Zero peers and at least one applicant.
    pub fn is_offering(&self) -> bool {
        self.peers.is_empty() && !self.applicants.is_empty()
    }

    /// Exactly one peer and nobody has retired.
    pub fn is_self_offering(&self) -> bool {
        self.peers.len() == 1 && self.retired.is_empty()
    }

    /// Number of applications awaiting a decision.
    pub fn pending_applicant_count(&self) -> usize {
        self.applicants.len()
    }

    /// Where `peer` stands in this circle.
    pub fn status_for(&self, peer: &PeerId) -> CircleStatus {
        if self.peers.contains_key(peer) {
            CircleStatus::InCircle
        } else if self.applicants.contains_key(peer) {
            CircleStatus::Applying
        } else if self.retired.contains_key(peer) {
            CircleStatus::Retired
        } else {
            CircleStatus::NotInCircle
        }
    }

    /// Digest of the signed content (everything except signatures).
    pub fn digest(&self) -> Result<CircleDigest, CircleError> {
        let body = canonical_bytes(&SignedCircleFields {
            name: &self.name,
            generation: self.generation,
            parent: &self.parent,
            parent_membership: &self.parent_membership,
            peers: &self.peers,
            applicants: &self.applicants,
            rejected: &self.rejected,
            retired: &self.retired,
        })?;
        Ok(CircleDigest(digest(CIRCLE_DOMAIN, &[&body])))
    }

    // ===========================================
    // Mutations
    // ===========================================

    /// Request entry for `peer`.
    ///
    /// `signer` is the device producing the snapshot, normally the
    /// applicant itself.
    pub fn apply_as_applicant(
        &self,
        peer: &PeerInfo,
        machines: &MachineList,
        signer: &LocalIdentity,
    ) -> Result<Self, CircleError> {
        peer.verify()?;
        let id = peer.id();
        if !machines.allows(&id) {
            return Err(CircleError::NotAuthorized { peer: id });
        }
        if self.peers.contains_key(&id) {
            return Err(CircleError::AlreadyMember { peer: id });
        }
        if self.rejected.contains_key(&id) {
            return Err(CircleError::Rejected { peer: id });
        }
        if self.applicants.contains_key(&id) {
            return Err(CircleError::AlreadyApplied { peer: id });
        }
        self.successor(signer, |next| {
            next.retired.remove(&id);
            next.applicants.insert(id, peer.clone());
            Ok(())
        })
    }

    /// Move an applicant into the trusted peer set.
    pub fn accept_applicant(
        &self,
        applicant: &PeerId,
        identity: &LocalIdentity,
    ) -> Result<Self, CircleError> {
        self.require_member(identity)?;
        if !self.applicants.contains_key(applicant) {
            return Err(CircleError::UnknownApplicant { peer: *applicant });
        }
        self.successor(identity, |next| {
            let info = next
                .applicants
                .remove(applicant)
                .ok_or(CircleError::UnknownApplicant { peer: *applicant })?;
            next.peers.insert(*applicant, info);
            Ok(())
        })
    }

    /// Refuse an applicant.
    pub fn reject_applicant(
        &self,
        applicant: &PeerId,
        identity: &LocalIdentity,
    ) -> Result<Self, CircleError> {
        self.require_member(identity)?;
        self.successor(identity, |next| {
            let info = next
                .applicants
                .remove(applicant)
                .ok_or(CircleError::UnknownApplicant { peer: *applicant })?;
            next.rejected.insert(*applicant, info);
            Ok(())
        })
    }

    /// Drop a member from the trusted peer set.
    ///
    /// The caller must rotate every view the removed peer could read
    /// before publishing the result.
    pub fn remove_peer(&self, peer: &PeerId, identity: &LocalIdentity) -> Result<Self, CircleError> {
        self.require_member(identity)?;
        if *peer == identity.peer_id() {
            return Err(CircleError::CannotRemoveSelf);
        }
        self.successor(identity, |next| {
            next.peers
                .remove(peer)
                .map(|_| ())
                .ok_or(CircleError::UnknownPeer { peer: *peer })
        })
    }

    /// Leave the circle.
    pub fn retire_self(&self, identity: &LocalIdentity) -> Result<Self, CircleError> {
        self.require_member(identity)?;
        let id = identity.peer_id();
        self.successor(identity, |next| {
            let info = next
                .peers
                .remove(&id)
                .ok_or(CircleError::NotAMember { peer: id })?;
            next.retired.insert(id, info);
            Ok(())
        })
    }

    /// Add this member's signature to the current snapshot.
    ///
    /// The generation does not change.
    pub fn countersign(&self, identity: &LocalIdentity) -> Result<Self, CircleError> {
        self.require_member(identity)?;
        let mut next = self.clone();
        next.sign_with(identity)?;
        Ok(next)
    }

    fn require_member(&self, identity: &LocalIdentity) -> Result<(), CircleError> {
        if self.peers.contains_key(&identity.peer_id()) {
            Ok(())
        } else {
            Err(CircleError::NotAMember {
                peer: identity.peer_id(),
            })
        }
    }

    fn successor(
        &self,
        signer: &LocalIdentity,
        change: impl FnOnce(&mut Self) -> Result<(), CircleError>,
    ) -> Result<Self, CircleError> {
        let mut next = self.clone();
        next.generation = self
            .generation
            .next()
            .ok_or(CircleError::GenerationExhausted)?;
        next.parent = Some(self.digest()?);
        next.parent_membership = Some(self.membership());
        next.signatures.clear();
        change(&mut next)?;
        next.sign_with(signer)?;
        Ok(next)
    }

    fn sign_with(&mut self, identity: &LocalIdentity) -> Result<(), CircleError> {
        let digest = self.digest()?;
        let signature = identity.sign(digest.as_bytes());
        self.signatures.insert(identity.peer_id(), signature);
        Ok(())
    }

    // ===========================================
    // Verification and merge
    // ===========================================

    /// A retired device may only sign the snapshot that retired it.
    fn signer_info(&self, signer: &PeerId) -> Option<&PeerInfo> {
        let retired_here = self
            .parent_membership
            .as_ref()
            .map_or(false, |parent| parent.peers.contains(signer));
        self.peers
            .get(signer)
            .or_else(|| self.applicants.get(signer))
            .or_else(|| self.retired.get(signer).filter(|_| retired_here))
    }

    /// A genesis snapshot holds exactly its founder, who signed it.
    fn check_genesis(&self) -> Result<(), CircleError> {
        let founder_signed = self.peers.len() == 1
            && self
                .peers
                .keys()
                .all(|founder| self.signatures.contains_key(founder));
        let nothing_else = self.applicants.is_empty()
            && self.rejected.is_empty()
            && self.retired.is_empty()
            && self.parent_membership.is_none();
        if founder_signed && nothing_else {
            Ok(())
        } else {
            Err(CircleError::integrity("malformed genesis snapshot"))
        }
    }

    /// Verify every embedded record and every signature.
    ///
    /// Any failure rejects the snapshot as a whole.
    pub fn verify(&self) -> Result<(), CircleError> {
        for info in self
            .peers
            .values()
            .chain(self.applicants.values())
            .chain(self.rejected.values())
            .chain(self.retired.values())
        {
            info.verify()
                .map_err(|e| CircleError::integrity(format!("embedded peer record: {}", e)))?;
        }

        if self.signatures.is_empty() {
            return Err(CircleError::integrity("snapshot carries no signatures"));
        }

        let digest = self.digest()?;
        for (signer, signature) in &self.signatures {
            let info = self.signer_info(signer).ok_or_else(|| {
                CircleError::integrity(format!("signature from non-participant {}", signer))
            })?;
            if !info.verify_signature(digest.as_bytes(), signature) {
                return Err(CircleError::integrity(format!(
                    "bad signature from {}",
                    signer
                )));
            }
        }
        Ok(())
    }

    fn authorizes(&self, successor: &Self) -> Result<(), CircleError> {
        self.membership().authorizes(successor)
    }

    /// Check a remote snapshot with the same generation as `self`.
    ///
    /// A sibling from the same parent must be authorized by the parent's
    /// membership. Returns `false` for a snapshot on another branch that
    /// no current member signed.
    fn authorizes_sibling(&self, sibling: &Self) -> Result<bool, CircleError> {
        if sibling.parent == self.parent {
            match &self.parent_membership {
                Some(parent) => parent.authorizes(sibling)?,
                None => sibling.check_genesis()?,
            }
            return Ok(true);
        }
        Ok(sibling
            .signatures
            .keys()
            .any(|signer| self.peers.contains_key(signer)))
    }

    /// Settle a local and a remote snapshot of the same circle.
    ///
    /// The remote snapshot is verified first and rejected wholesale if it
    /// fails. A newer remote must be authorized by the local membership; a
    /// sibling must be authorized by the membership of the shared parent.
    pub fn merge(local: &Self, remote: &Self) -> Result<Merged, CircleError> {
        if local.name != remote.name {
            return Err(CircleError::NameMismatch {
                local: local.name.clone(),
                remote: remote.name.clone(),
            });
        }
        remote.verify()?;

        if remote.generation > local.generation {
            local.authorizes(remote)?;
            return Ok(Merged {
                circle: remote.clone(),
                outcome: MergeOutcome::RemoteNewer,
            });
        }
        if remote.generation < local.generation {
            return Ok(Merged {
                circle: local.clone(),
                outcome: MergeOutcome::LocalNewer,
            });
        }

        let local_digest = local.digest()?;
        let remote_digest = remote.digest()?;
        if local_digest == remote_digest {
            let mut combined = local.clone();
            for (signer, signature) in &remote.signatures {
                combined.signatures.entry(*signer).or_insert(*signature);
            }
            return Ok(Merged {
                circle: combined,
                outcome: MergeOutcome::Identical,
            });
        }

        if !local.authorizes_sibling(remote)? {
            return Ok(Merged {
                circle: local.clone(),
                outcome: MergeOutcome::Unverified,
            });
        }
        if remote_digest < local_digest {
            Ok(Merged {
                circle: remote.clone(),
                outcome: MergeOutcome::TieRemoteWon,
            })
        } else {
            Ok(Merged {
                circle: local.clone(),
                outcome: MergeOutcome::TieLocalWon,
            })
        }
    }
}

/// A local membership change, kept until it is visible in an accepted
/// snapshot so it can be re-derived after losing a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircleChange {
    /// The local device applied.
    Apply(PeerInfo),
    /// An applicant was accepted.
    Accept(PeerId),
    /// An applicant was rejected.
    Reject(PeerId),
    /// A member was removed.
    Remove(PeerId),
    /// The local device retired.
    Retire,
}

impl CircleChange {
    /// Produce the successor of `circle` that carries this change.
    pub fn apply_to(
        &self,
        circle: &Circle,
        identity: &LocalIdentity,
        machines: &MachineList,
    ) -> Result<Circle, CircleError> {
        match self {
            Self::Apply(info) => circle.apply_as_applicant(info, machines, identity),
            Self::Accept(peer) => circle.accept_applicant(peer, identity),
            Self::Reject(peer) => circle.reject_applicant(peer, identity),
            Self::Remove(peer) => circle.remove_peer(peer, identity),
            Self::Retire => circle.retire_self(identity),
        }
    }

    /// Whether `circle` already reflects this change.
    pub fn is_reflected_in(&self, circle: &Circle, local: &PeerId) -> bool {
        match self {
            Self::Apply(info) => {
                circle.applicants.contains_key(&info.id()) || circle.peers.contains_key(&info.id())
            }
            Self::Accept(peer) => circle.peers.contains_key(peer),
            Self::Reject(peer) => circle.rejected.contains_key(peer),
            Self::Remove(peer) => !circle.peers.contains_key(peer),
            Self::Retire => circle.retired.contains_key(local),
        }
    }
}
