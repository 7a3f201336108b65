//! Encrypted, authenticated channel between two circle members.
//!
//! A coder is created for one remote peer and walks
//! `Uninitialized -> Negotiating -> Established -> (Faulted | Retired)`.
//!
//! The handshake is a signed ephemeral X25519 exchange: the initiator
//! sends a `Hello`, the responder answers with a `Reply` that also signs
//! the initiator's ephemeral key. Both sides then derive one key per
//! direction. Data frames carry a counter that must strictly increase,
//! so replayed frames are refused. A close is sealed the same way, so
//! only the peer holding the session keys can end the session.
//!
//! If both peers open at the same time, the peer with the lower id keeps
//! the initiator role and the other answers its hello.

use ed25519_dalek::Signature;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zerok_trust_types::PeerId;

use crate::crypto::{canonical_bytes, random_array, CryptoError, Sealed, SymmetricKey, KEY_SIZE, NONCE_SIZE};
use crate::identity::{LocalIdentity, PeerInfo};

const HANDSHAKE_DOMAIN: &[u8] = b"0k-trust-session-handshake-v1";
const SESSION_SALT: &[u8] = b"0k-trust-session-v1";
const CLOSE_DOMAIN: &[u8] = b"0k-trust-session-close-v1";

/// Handshake failures tolerated before the coder faults.
pub const DEFAULT_MAX_HANDSHAKE_FAILURES: u32 = 3;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not valid in the current state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// Current state.
        state: SessionState,
        /// What was attempted.
        operation: &'static str,
    },

    /// A handshake frame failed verification.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Too many handshake failures; call `reset`.
    #[error("session faulted after {failures} handshake failures")]
    Faulted {
        /// Failures seen.
        failures: u32,
    },

    /// A data frame failed authentication or arrived out of order.
    #[error("decode error: {0}")]
    Decode(String),

    /// Frame (de)serialization failed.
    #[error("frame encoding: {0}")]
    Encoding(String),

    /// Underlying crypto failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Lifecycle of a coder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No handshake in progress.
    Uninitialized,
    /// Hello sent, waiting for the reply.
    Negotiating,
    /// Keys agreed; data may flow.
    Established,
    /// Gave up after repeated handshake failures.
    Faulted,
    /// Closed by either side.
    Retired,
}

/// Signed ephemeral key announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    sender: PeerId,
    receiver: PeerId,
    ephemeral: [u8; 32],
    /// For a reply, the initiator ephemeral key being answered.
    answering: Option<[u8; 32]>,
    signature: Signature,
}

#[derive(Serialize)]
struct HandshakeFields<'a> {
    sender: &'a PeerId,
    receiver: &'a PeerId,
    ephemeral: &'a [u8; 32],
    answering: &'a Option<[u8; 32]>,
}

impl Handshake {
    fn signed(
        identity: &LocalIdentity,
        receiver: PeerId,
        ephemeral: [u8; 32],
        answering: Option<[u8; 32]>,
    ) -> Result<Self, SessionError> {
        let sender = identity.peer_id();
        let message = handshake_message(&HandshakeFields {
            sender: &sender,
            receiver: &receiver,
            ephemeral: &ephemeral,
            answering: &answering,
        })?;
        Ok(Self {
            sender,
            receiver,
            ephemeral,
            answering,
            signature: identity.sign(&message),
        })
    }

    fn verify(&self, remote: &PeerInfo, local: PeerId) -> Result<(), SessionError> {
        if self.sender != remote.id() {
            return Err(SessionError::Handshake(format!(
                "unexpected sender {}",
                self.sender
            )));
        }
        if self.receiver != local {
            return Err(SessionError::Handshake("frame addressed to another peer".into()));
        }
        let message = handshake_message(&HandshakeFields {
            sender: &self.sender,
            receiver: &self.receiver,
            ephemeral: &self.ephemeral,
            answering: &self.answering,
        })?;
        if !remote.verify_signature(&message, &self.signature) {
            return Err(SessionError::Handshake("bad handshake signature".into()));
        }
        Ok(())
    }
}

fn handshake_message(fields: &HandshakeFields<'_>) -> Result<Vec<u8>, SessionError> {
    let mut message = HANDSHAKE_DOMAIN.to_vec();
    message.extend_from_slice(&canonical_bytes(fields)?);
    Ok(message)
}

/// A unit exchanged between two coders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Opens a handshake.
    Hello(Handshake),
    /// Completes a handshake.
    Reply(Handshake),
    /// Encrypted payload.
    Data {
        /// Per-direction message counter, starting at 1.
        counter: u64,
        /// Ciphertext.
        sealed: Sealed,
    },
    /// Orderly shutdown, sealed like a data frame.
    Close {
        /// Per-direction message counter.
        counter: u64,
        /// Empty payload bound to the close marker.
        sealed: Sealed,
    },
}

impl Frame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        rmp_serde::to_vec(self).map_err(|e| SessionError::Encoding(e.to_string()))
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        rmp_serde::from_slice(bytes).map_err(|e| SessionError::Encoding(e.to_string()))
    }
}

/// What [`SessionCoder::handle_incoming`] produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Incoming {
    /// Frame to send back, if any.
    pub reply: Option<Frame>,
    /// Decrypted payload, if the frame carried data.
    pub plaintext: Option<Vec<u8>>,
}

struct DirectionalKeys {
    send: SymmetricKey,
    receive: SymmetricKey,
    sent: u64,
    received: u64,
}

enum Phase {
    Idle,
    Negotiating { ephemeral: StaticSecret },
    Established(DirectionalKeys),
    Faulted,
    Retired,
}

/// Session coder for one remote peer.
pub struct SessionCoder {
    remote: PeerInfo,
    phase: Phase,
    failures: u32,
    max_failures: u32,
    /// Ephemeral key of the last hello answered; a replay of it is ignored.
    answered: Option<[u8; 32]>,
}

impl std::fmt::Debug for SessionCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoder")
            .field("remote", &self.remote.id())
            .field("state", &self.state())
            .field("failures", &self.failures)
            .finish()
    }
}

impl SessionCoder {
    /// New coder talking to `remote`.
    pub fn new(remote: PeerInfo) -> Self {
        Self::with_max_failures(remote, DEFAULT_MAX_HANDSHAKE_FAILURES)
    }

    /// New coder with a custom handshake failure limit.
    pub fn with_max_failures(remote: PeerInfo, max_failures: u32) -> Self {
        Self {
            remote,
            phase: Phase::Idle,
            failures: 0,
            max_failures: max_failures.max(1),
            answered: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Uninitialized,
            Phase::Negotiating { .. } => SessionState::Negotiating,
            Phase::Established(_) => SessionState::Established,
            Phase::Faulted => SessionState::Faulted,
            Phase::Retired => SessionState::Retired,
        }
    }

    /// The peer on the other end.
    pub fn remote(&self) -> &PeerInfo {
        &self.remote
    }

    /// Handshake failures since the last reset or success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Begin a handshake. Only valid from `Uninitialized`.
    pub fn start(&mut self, local: &LocalIdentity) -> Result<Frame, SessionError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(self.invalid("start"));
        }
        let ephemeral = StaticSecret::from(random_array::<32>()?);
        let public = PublicKey::from(&ephemeral);
        let hello = Handshake::signed(local, self.remote.id(), *public.as_bytes(), None)?;
        self.phase = Phase::Negotiating { ephemeral };
        Ok(Frame::Hello(hello))
    }

    /// Process a frame from the remote peer.
    pub fn handle_incoming(
        &mut self,
        local: &LocalIdentity,
        frame: &Frame,
    ) -> Result<Incoming, SessionError> {
        if let Phase::Faulted = self.phase {
            return Err(SessionError::Faulted {
                failures: self.failures,
            });
        }
        match frame {
            Frame::Hello(hello) => self.on_hello(local, hello),
            Frame::Reply(reply) => self.on_reply(local, reply),
            Frame::Data { .. } => Ok(Incoming {
                reply: None,
                plaintext: Some(self.unwrap(frame)?),
            }),
            Frame::Close { counter, sealed } => {
                self.open(*counter, sealed, &close_aad(*counter), "close")?;
                self.phase = Phase::Retired;
                Ok(Incoming::default())
            }
        }
    }

    fn on_hello(&mut self, local: &LocalIdentity, hello: &Handshake) -> Result<Incoming, SessionError> {
        if matches!(self.phase, Phase::Retired) {
            return Err(self.invalid("accept hello"));
        }
        if let Err(e) = hello.verify(&self.remote, local.peer_id()).and_then(|_| {
            if hello.answering.is_some() {
                Err(SessionError::Handshake("hello must not answer".into()))
            } else {
                Ok(())
            }
        }) {
            // A bad hello does not disturb a working session.
            if matches!(self.phase, Phase::Established(_)) {
                return Err(e);
            }
            return Err(self.record_failure(e));
        }
        if self.answered == Some(hello.ephemeral) {
            return Ok(Incoming::default());
        }

        // Simultaneous open: the lower id stays initiator.
        if matches!(self.phase, Phase::Negotiating { .. }) && local.peer_id() < self.remote.id() {
            return Ok(Incoming::default());
        }

        let ephemeral = StaticSecret::from(random_array::<32>()?);
        let public = PublicKey::from(&ephemeral);
        let keys = derive_keys(
            &ephemeral,
            &hello.ephemeral,
            Role::Responder,
            self.remote.id(),
            local.peer_id(),
            &hello.ephemeral,
            public.as_bytes(),
        )?;
        let reply = Handshake::signed(
            local,
            self.remote.id(),
            *public.as_bytes(),
            Some(hello.ephemeral),
        )?;

        self.phase = Phase::Established(keys);
        self.failures = 0;
        self.answered = Some(hello.ephemeral);
        Ok(Incoming {
            reply: Some(Frame::Reply(reply)),
            plaintext: None,
        })
    }

    fn on_reply(&mut self, local: &LocalIdentity, reply: &Handshake) -> Result<Incoming, SessionError> {
        let ephemeral = match &self.phase {
            Phase::Negotiating { ephemeral } => ephemeral,
            _ => return Err(self.invalid("accept reply")),
        };
        let ours = *PublicKey::from(ephemeral).as_bytes();

        let checked = reply.verify(&self.remote, local.peer_id()).and_then(|_| {
            if reply.answering == Some(ours) {
                Ok(())
            } else {
                Err(SessionError::Handshake("reply answers a different hello".into()))
            }
        });
        let keys = checked.and_then(|_| {
            derive_keys(
                ephemeral,
                &reply.ephemeral,
                Role::Initiator,
                local.peer_id(),
                self.remote.id(),
                &ours,
                &reply.ephemeral,
            )
        });

        match keys {
            Ok(keys) => {
                self.phase = Phase::Established(keys);
                self.failures = 0;
                Ok(Incoming::default())
            }
            Err(e) => Err(self.record_failure(e)),
        }
    }

    /// Encrypt `plaintext`. Only valid in `Established`.
    pub fn wrap(&mut self, plaintext: &[u8]) -> Result<Frame, SessionError> {
        let (counter, sealed) = self.seal(plaintext, |counter| counter.to_be_bytes().to_vec(), "wrap")?;
        Ok(Frame::Data { counter, sealed })
    }

    /// Decrypt a data frame. Leaves the coder untouched on failure.
    pub fn unwrap(&mut self, frame: &Frame) -> Result<Vec<u8>, SessionError> {
        let (counter, sealed) = match frame {
            Frame::Data { counter, sealed } => (*counter, sealed),
            _ => return Err(SessionError::Decode("not a data frame".into())),
        };
        self.open(counter, sealed, &counter.to_be_bytes(), "unwrap")
    }

    /// Close the session.
    ///
    /// Returns the sealed close frame for the remote peer when keys were
    /// agreed, otherwise just retires locally.
    pub fn close(&mut self) -> Result<Option<Frame>, SessionError> {
        let frame = if matches!(self.phase, Phase::Established(_)) {
            let (counter, sealed) = self.seal(&[], close_aad, "close")?;
            Some(Frame::Close { counter, sealed })
        } else {
            None
        };
        self.phase = Phase::Retired;
        Ok(frame)
    }

    fn seal(
        &mut self,
        plaintext: &[u8],
        aad: impl FnOnce(u64) -> Vec<u8>,
        operation: &'static str,
    ) -> Result<(u64, Sealed), SessionError> {
        let state = self.state();
        let keys = match &mut self.phase {
            Phase::Established(keys) => keys,
            _ => return Err(SessionError::InvalidState { state, operation }),
        };
        let counter = keys
            .sent
            .checked_add(1)
            .ok_or_else(|| SessionError::Decode("send counter exhausted".into()))?;
        let sealed = keys
            .send
            .encrypt_with_nonce(counter_nonce(counter), plaintext, &aad(counter))?;
        keys.sent = counter;
        Ok((counter, sealed))
    }

    fn open(
        &mut self,
        counter: u64,
        sealed: &Sealed,
        aad: &[u8],
        operation: &'static str,
    ) -> Result<Vec<u8>, SessionError> {
        let state = self.state();
        let keys = match &mut self.phase {
            Phase::Established(keys) => keys,
            _ => return Err(SessionError::InvalidState { state, operation }),
        };
        if counter <= keys.received {
            return Err(SessionError::Decode(format!(
                "replayed or reordered frame {}",
                counter
            )));
        }
        let plaintext = keys
            .receive
            .decrypt(sealed, aad)
            .map_err(|_| SessionError::Decode("authentication failed".into()))?;
        keys.received = counter;
        Ok(plaintext)
    }

    /// Drop all keys and return to `Uninitialized`.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.failures = 0;
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            state: self.state(),
            operation,
        }
    }

    fn record_failure(&mut self, error: SessionError) -> SessionError {
        self.failures += 1;
        if self.failures >= self.max_failures {
            self.phase = Phase::Faulted;
            return SessionError::Faulted {
                failures: self.failures,
            };
        }
        if matches!(self.phase, Phase::Negotiating { .. }) {
            self.phase = Phase::Idle;
        }
        error
    }
}

#[derive(Clone, Copy)]
enum Role {
    Initiator,
    Responder,
}

fn close_aad(counter: u64) -> Vec<u8> {
    let mut aad = CLOSE_DOMAIN.to_vec();
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}

fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[NONCE_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn derive_keys(
    ours: &StaticSecret,
    theirs: &[u8; 32],
    role: Role,
    initiator: PeerId,
    responder: PeerId,
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
) -> Result<DirectionalKeys, SessionError> {
    let shared = ours.diffie_hellman(&PublicKey::from(*theirs));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKeyAgreement.into());
    }

    let mut info = Vec::with_capacity(128);
    info.extend_from_slice(initiator.as_bytes());
    info.extend_from_slice(responder.as_bytes());
    info.extend_from_slice(initiator_ephemeral);
    info.extend_from_slice(responder_ephemeral);

    let hkdf = Hkdf::<Sha256>::new(Some(SESSION_SALT), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE * 2];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

    let mut forward = [0u8; KEY_SIZE];
    let mut backward = [0u8; KEY_SIZE];
    forward.copy_from_slice(&okm[..KEY_SIZE]);
    backward.copy_from_slice(&okm[KEY_SIZE..]);
    let (forward, backward) = (SymmetricKey::from_bytes(forward), SymmetricKey::from_bytes(backward));

    let (send, receive) = match role {
        Role::Initiator => (forward, backward),
        Role::Responder => (backward, forward),
    };
    Ok(DirectionalKeys {
        send,
        receive,
        sent: 0,
        received: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Description;

    fn device() -> (LocalIdentity, PeerInfo) {
        let identity = LocalIdentity::generate().unwrap();
        let info = PeerInfo::create(&identity, Description::new()).unwrap();
        (identity, info)
    }

    struct Pair {
        a: LocalIdentity,
        b: LocalIdentity,
        a_coder: SessionCoder,
        b_coder: SessionCoder,
    }

    fn pair() -> Pair {
        let (a, a_info) = device();
        let (b, b_info) = device();
        Pair {
            a_coder: SessionCoder::new(b_info),
            b_coder: SessionCoder::new(a_info),
            a,
            b,
        }
    }

    fn established() -> Pair {
        let mut p = pair();
        let hello = p.a_coder.start(&p.a).unwrap();
        let reply = p.b_coder.handle_incoming(&p.b, &hello).unwrap().reply.unwrap();
        p.a_coder.handle_incoming(&p.a, &reply).unwrap();
        p
    }

    // ===========================================
    // Handshake Tests
    // ===========================================

    #[test]
    fn starts_uninitialized() {
        let p = pair();
        assert_eq!(p.a_coder.state(), SessionState::Uninitialized);
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let mut p = pair();
        let hello = p.a_coder.start(&p.a).unwrap();
        assert_eq!(p.a_coder.state(), SessionState::Negotiating);

        let incoming = p.b_coder.handle_incoming(&p.b, &hello).unwrap();
        assert_eq!(p.b_coder.state(), SessionState::Established);
        assert!(matches!(incoming.reply, Some(Frame::Reply(_))));

        p.a_coder
            .handle_incoming(&p.a, &incoming.reply.unwrap())
            .unwrap();
        assert_eq!(p.a_coder.state(), SessionState::Established);
    }

    #[test]
    fn start_twice_is_invalid() {
        let mut p = pair();
        p.a_coder.start(&p.a).unwrap();
        assert!(matches!(
            p.a_coder.start(&p.a),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn hello_from_impostor_fails() {
        let mut p = pair();
        let (mallory, _) = device();
        // Mallory's hello is addressed to b but signed with the wrong key.
        let mut coder = SessionCoder::new(PeerInfo::create(&p.b, Description::new()).unwrap());
        let Frame::Hello(mut hello) = coder.start(&mallory).unwrap() else {
            panic!("expected hello");
        };
        hello.sender = p.a.peer_id();

        let result = p.b_coder.handle_incoming(&p.b, &Frame::Hello(hello));
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert_eq!(p.b_coder.state(), SessionState::Uninitialized);
        assert_eq!(p.b_coder.failures(), 1);
    }

    #[test]
    fn repeated_handshake_failure_faults_until_reset() {
        let mut p = pair();
        let (mallory, _) = device();
        let mut forged = SessionCoder::new(PeerInfo::create(&p.b, Description::new()).unwrap());

        let mut last = None;
        for _ in 0..DEFAULT_MAX_HANDSHAKE_FAILURES {
            forged.reset();
            let Frame::Hello(mut hello) = forged.start(&mallory).unwrap() else {
                panic!("expected hello");
            };
            hello.sender = p.a.peer_id();
            last = Some(p.b_coder.handle_incoming(&p.b, &Frame::Hello(hello)));
        }
        assert!(matches!(last, Some(Err(SessionError::Faulted { .. }))));
        assert_eq!(p.b_coder.state(), SessionState::Faulted);

        // A genuine hello is refused until reset.
        let hello = p.a_coder.start(&p.a).unwrap();
        assert!(p.b_coder.handle_incoming(&p.b, &hello).is_err());
        assert!(matches!(p.b_coder.wrap(b"x"), Err(SessionError::InvalidState { .. })));

        p.b_coder.reset();
        assert_eq!(p.b_coder.state(), SessionState::Uninitialized);
        assert!(p.b_coder.handle_incoming(&p.b, &hello).is_ok());
    }

    #[test]
    fn bad_hellos_leave_established_session_alone() {
        let mut p = established();
        let (mallory, _) = device();
        let mut forged = SessionCoder::new(PeerInfo::create(&p.b, Description::new()).unwrap());

        for _ in 0..DEFAULT_MAX_HANDSHAKE_FAILURES + 1 {
            forged.reset();
            let Frame::Hello(mut hello) = forged.start(&mallory).unwrap() else {
                panic!("expected hello");
            };
            hello.sender = p.a.peer_id();
            let result = p.b_coder.handle_incoming(&p.b, &Frame::Hello(hello));
            assert!(matches!(result, Err(SessionError::Handshake(_))));
        }
        assert_eq!(p.b_coder.state(), SessionState::Established);

        let frame = p.a_coder.wrap(b"after").unwrap();
        assert_eq!(p.b_coder.unwrap(&frame).unwrap(), b"after");
    }

    #[test]
    fn replayed_hello_does_not_rekey() {
        let mut p = pair();
        let hello = p.a_coder.start(&p.a).unwrap();
        let reply = p.b_coder.handle_incoming(&p.b, &hello).unwrap().reply.unwrap();
        p.a_coder.handle_incoming(&p.a, &reply).unwrap();

        let replay = p.b_coder.handle_incoming(&p.b, &hello).unwrap();
        assert!(replay.reply.is_none());

        let frame = p.a_coder.wrap(b"same keys").unwrap();
        assert_eq!(p.b_coder.unwrap(&frame).unwrap(), b"same keys");
    }

    #[test]
    fn reply_to_different_hello_fails() {
        let mut p = pair();
        let first = p.a_coder.start(&p.a).unwrap();
        let reply = p.b_coder.handle_incoming(&p.b, &first).unwrap().reply.unwrap();

        p.a_coder.reset();
        p.a_coder.start(&p.a).unwrap();
        let result = p.a_coder.handle_incoming(&p.a, &reply);
        assert!(matches!(result, Err(SessionError::Handshake(_))));
        assert_ne!(p.a_coder.state(), SessionState::Established);
    }

    #[test]
    fn simultaneous_open_settles_on_one_handshake() {
        let mut p = pair();
        let hello_a = p.a_coder.start(&p.a).unwrap();
        let hello_b = p.b_coder.start(&p.b).unwrap();

        let at_a = p.a_coder.handle_incoming(&p.a, &hello_b).unwrap();
        let at_b = p.b_coder.handle_incoming(&p.b, &hello_a).unwrap();

        // Exactly one side answers.
        let (reply, initiator, initiator_coder) = match (at_a.reply, at_b.reply) {
            (Some(reply), None) => (reply, &p.b, &mut p.b_coder),
            (None, Some(reply)) => (reply, &p.a, &mut p.a_coder),
            other => panic!("expected exactly one reply, got {:?}", other),
        };
        initiator_coder.handle_incoming(initiator, &reply).unwrap();

        assert_eq!(p.a_coder.state(), SessionState::Established);
        assert_eq!(p.b_coder.state(), SessionState::Established);

        let frame = p.a_coder.wrap(b"ping").unwrap();
        assert_eq!(p.b_coder.unwrap(&frame).unwrap(), b"ping");
    }

    // ===========================================
    // Data Tests
    // ===========================================

    #[test]
    fn wrap_before_established_is_invalid() {
        let mut p = pair();
        assert!(matches!(
            p.a_coder.wrap(b"hello"),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn data_flows_both_ways() {
        let mut p = established();

        let to_b = p.a_coder.wrap(b"from a").unwrap();
        let incoming = p.b_coder.handle_incoming(&p.b, &to_b).unwrap();
        assert_eq!(incoming.plaintext.as_deref(), Some(&b"from a"[..]));

        let to_a = p.b_coder.wrap(b"from b").unwrap();
        assert_eq!(p.a_coder.unwrap(&to_a).unwrap(), b"from b");
    }

    #[test]
    fn tampered_frame_fails_without_advancing() {
        let mut p = established();
        let frame = p.a_coder.wrap(b"secret").unwrap();
        let Frame::Data { counter, mut sealed } = frame.clone() else {
            panic!("expected data");
        };
        sealed.ciphertext[0] ^= 0xff;

        let result = p.b_coder.unwrap(&Frame::Data { counter, sealed });
        assert!(matches!(result, Err(SessionError::Decode(_))));
        assert_eq!(p.b_coder.state(), SessionState::Established);

        // The genuine frame still decodes afterwards.
        assert_eq!(p.b_coder.unwrap(&frame).unwrap(), b"secret");
    }

    #[test]
    fn replayed_frame_is_refused() {
        let mut p = established();
        let frame = p.a_coder.wrap(b"once").unwrap();
        p.b_coder.unwrap(&frame).unwrap();

        assert!(matches!(
            p.b_coder.unwrap(&frame),
            Err(SessionError::Decode(_))
        ));
    }

    #[test]
    fn own_frame_does_not_decode_locally() {
        let mut p = established();
        let frame = p.a_coder.wrap(b"loop").unwrap();
        assert!(p.a_coder.unwrap(&frame).is_err());
    }

    #[test]
    fn frames_survive_encoding() {
        let mut p = established();
        let frame = p.a_coder.wrap(b"bytes").unwrap();
        let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(p.b_coder.unwrap(&decoded).unwrap(), b"bytes");
    }

    #[test]
    fn close_retires_remote() {
        let mut p = established();
        let close = p.a_coder.close().unwrap().unwrap();
        assert_eq!(p.a_coder.state(), SessionState::Retired);

        p.b_coder.handle_incoming(&p.b, &close).unwrap();
        assert_eq!(p.b_coder.state(), SessionState::Retired);
        assert!(p.b_coder.wrap(b"late").is_err());
    }

    #[test]
    fn close_without_session_keys_is_refused() {
        let mut p = established();
        let mut other = established();
        let foreign = other.a_coder.close().unwrap().unwrap();

        assert!(matches!(
            p.b_coder.handle_incoming(&p.b, &foreign),
            Err(SessionError::Decode(_))
        ));
        assert_eq!(p.b_coder.state(), SessionState::Established);

        let frame = p.a_coder.wrap(b"still here").unwrap();
        assert_eq!(p.b_coder.unwrap(&frame).unwrap(), b"still here");
    }

    #[test]
    fn data_frame_cannot_pose_as_close() {
        let mut p = established();
        let Frame::Data { counter, sealed } = p.a_coder.wrap(b"").unwrap() else {
            panic!("expected data");
        };

        let result = p.b_coder.handle_incoming(&p.b, &Frame::Close { counter, sealed });
        assert!(matches!(result, Err(SessionError::Decode(_))));
        assert_eq!(p.b_coder.state(), SessionState::Established);
    }

    #[test]
    fn closing_before_handshake_sends_nothing() {
        let mut p = pair();
        assert!(p.a_coder.close().unwrap().is_none());
        assert_eq!(p.a_coder.state(), SessionState::Retired);
    }
}
