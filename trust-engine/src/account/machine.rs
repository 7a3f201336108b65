//! States, flags and the transition table of an account engine.

use serde::{Deserialize, Serialize};
use zerok_trust_core::{MachineSnapshot, StateMachine};

/// Where an account engine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    /// Idle or working normally.
    Ready,
    /// Needs a share or an acceptance from another device.
    WaitForTrust,
    /// Needs the device to be unlocked.
    WaitForUnlock,
    /// An integrity or crypto failure stopped the engine until reset.
    Error,
    /// The device left the circle.
    Retired,
}

impl EngineState {
    /// States in which regular work runs.
    pub const ACTIVE: [EngineState; 3] = [Self::Ready, Self::WaitForTrust, Self::WaitForUnlock];

    /// Whether the engine is parked waiting for something external.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::WaitForTrust | Self::WaitForUnlock)
    }
}

/// Work requests. Setting a flag twice before it runs collapses to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineFlag {
    /// Pull new blobs from the relay.
    FetchRequested,
    /// Handle blobs pulled by the last fetch.
    ProcessIncoming,
    /// Join the circle, founding it if none exists.
    JoinRequested,
    /// Apply queued membership changes.
    ApplyChanges,
    /// Rotate explicitly requested views.
    RotateKeys,
    /// Give shares to members that lack them.
    IssueShares,
    /// Push the outbox.
    PushPending,
    /// Fetch back what was pushed.
    ConfirmPush,
    /// Make sure every configured view has a current key set.
    EnsureKeys,
    /// Send queued session messages.
    SessionTraffic,
    /// Leave the circle.
    RetireRequested,
    /// Leave the error state.
    ResetRequested,
}

/// Operations run by the engine's owner task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineOp {
    /// Pull from the relay.
    Fetch,
    /// Merge circles, record shares, decode session frames.
    Process,
    /// Found or apply to the circle.
    Join,
    /// Apply one queued membership change.
    ApplyChanges,
    /// Rotate requested views.
    Rotate,
    /// Issue missing shares.
    IssueShares,
    /// Push queued blobs.
    Push,
    /// Confirm pushes by fetching.
    ConfirmPush,
    /// Install or create key sets.
    EnsureKeys,
    /// Handshake and send queued messages.
    FlushSessions,
    /// Retire this device.
    Retire,
    /// Clear the error state.
    Reset,
}

impl EngineOp {
    /// The flag that triggers this operation.
    pub fn trigger(&self) -> EngineFlag {
        match self {
            Self::Fetch => EngineFlag::FetchRequested,
            Self::Process => EngineFlag::ProcessIncoming,
            Self::Join => EngineFlag::JoinRequested,
            Self::ApplyChanges => EngineFlag::ApplyChanges,
            Self::Rotate => EngineFlag::RotateKeys,
            Self::IssueShares => EngineFlag::IssueShares,
            Self::Push => EngineFlag::PushPending,
            Self::ConfirmPush => EngineFlag::ConfirmPush,
            Self::EnsureKeys => EngineFlag::EnsureKeys,
            Self::FlushSessions => EngineFlag::SessionTraffic,
            Self::Retire => EngineFlag::RetireRequested,
            Self::Reset => EngineFlag::ResetRequested,
        }
    }
}

/// External conditions a pending flag can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnginePredicate {
    /// The device reports itself unlocked.
    DeviceUnlocked,
}

/// The account engine's state machine.
pub type EngineMachine = StateMachine<EngineState, EngineFlag, EngineOp, EnginePredicate>;

/// Persisted form of [`EngineMachine`].
pub type EngineSnapshot = MachineSnapshot<EngineState, EngineFlag, EnginePredicate>;

/// Operations that leave the current state unchanged.
const IN_PLACE: [(EngineFlag, EngineOp); 6] = [
    (EngineFlag::FetchRequested, EngineOp::Fetch),
    (EngineFlag::ProcessIncoming, EngineOp::Process),
    (EngineFlag::JoinRequested, EngineOp::Join),
    (EngineFlag::PushPending, EngineOp::Push),
    (EngineFlag::ConfirmPush, EngineOp::ConfirmPush),
    (EngineFlag::SessionTraffic, EngineOp::FlushSessions),
];

/// Operations that need the device unlocked and end an unlock wait.
const UNLOCK_GATED: [(EngineFlag, EngineOp); 3] = [
    (EngineFlag::ApplyChanges, EngineOp::ApplyChanges),
    (EngineFlag::RotateKeys, EngineOp::Rotate),
    (EngineFlag::IssueShares, EngineOp::IssueShares),
];

/// Build the transition table.
pub fn engine_machine() -> EngineMachine {
    use EngineState::*;

    let mut machine = EngineMachine::new(Ready, Error).terminal(Retired);

    for state in EngineState::ACTIVE {
        for (flag, op) in IN_PLACE {
            machine = machine.transition(state, flag, op, state);
        }
    }

    for state in EngineState::ACTIVE {
        let next = if state == WaitForUnlock { Ready } else { state };
        for (flag, op) in UNLOCK_GATED {
            machine = machine.transition(state, flag, op, next);
        }
    }

    machine
        .transitions_from(&EngineState::ACTIVE, EngineFlag::EnsureKeys, EngineOp::EnsureKeys, Ready)
        .transitions_from(
            &EngineState::ACTIVE,
            EngineFlag::RetireRequested,
            EngineOp::Retire,
            Retired,
        )
        .transition(Error, EngineFlag::ResetRequested, EngineOp::Reset, Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use zerok_trust_core::{Condition, Failure, Outcome};

    fn never(_: &EnginePredicate) -> bool {
        false
    }

    // ===========================================
    // Transition Table Tests
    // ===========================================

    #[test]
    fn fetch_runs_in_every_active_state() {
        for state in EngineState::ACTIVE {
            let mut machine = engine_machine();
            machine.restore(EngineSnapshot {
                current: state,
                flags: vec![EngineFlag::FetchRequested],
                pending: vec![],
            });

            let outcome = machine.step(SystemTime::now(), never, |op| {
                assert_eq!(*op, EngineOp::Fetch);
                Ok(vec![])
            });
            assert!(matches!(outcome, Outcome::Advanced { .. }));
            assert_eq!(*machine.current(), state);
        }
    }

    #[test]
    fn error_state_only_accepts_reset() {
        let mut machine = engine_machine();
        machine.restore(EngineSnapshot {
            current: EngineState::Error,
            flags: vec![EngineFlag::FetchRequested, EngineFlag::PushPending],
            pending: vec![],
        });

        let outcome = machine.step(SystemTime::now(), never, |_| Ok(vec![]));
        assert_eq!(outcome, Outcome::Quiescent);

        machine.set_flag(EngineFlag::ResetRequested);
        let outcome = machine.step(SystemTime::now(), never, |op| {
            assert_eq!(*op, EngineOp::Reset);
            Ok(vec![])
        });
        assert!(matches!(outcome, Outcome::Advanced { .. }));
        assert_eq!(*machine.current(), EngineState::Ready);

        // The flags queued before the failure survive the reset.
        assert!(machine.has_flag(&EngineFlag::FetchRequested));
    }

    #[test]
    fn retired_is_terminal() {
        let mut machine = engine_machine();
        machine.set_flag(EngineFlag::RetireRequested);
        machine.step(SystemTime::now(), never, |_| Ok(vec![]));
        assert_eq!(*machine.current(), EngineState::Retired);

        machine.set_flag(EngineFlag::FetchRequested);
        let outcome = machine.step(SystemTime::now(), never, |_| Ok(vec![]));
        assert_eq!(outcome, Outcome::Halted);
    }

    #[test]
    fn ensure_keys_ends_trust_wait() {
        let mut machine = engine_machine();
        machine.restore(EngineSnapshot {
            current: EngineState::WaitForTrust,
            flags: vec![EngineFlag::EnsureKeys],
            pending: vec![],
        });

        machine.step(SystemTime::now(), never, |_| Ok(vec![]));
        assert_eq!(*machine.current(), EngineState::Ready);
    }

    #[test]
    fn every_op_runs_from_its_trigger() {
        use EngineOp::*;
        for op in [
            Fetch,
            Process,
            Join,
            ApplyChanges,
            Rotate,
            IssueShares,
            Push,
            ConfirmPush,
            EnsureKeys,
            FlushSessions,
            Retire,
            Reset,
        ] {
            let start = if op == Reset {
                EngineState::Error
            } else {
                EngineState::Ready
            };
            let mut machine = engine_machine();
            machine.restore(EngineSnapshot {
                current: start,
                flags: vec![op.trigger()],
                pending: vec![],
            });

            let outcome = machine.step(SystemTime::now(), never, |ran| {
                assert_eq!(*ran, op);
                Ok(vec![])
            });
            assert!(matches!(outcome, Outcome::Advanced { .. }), "{:?}", op);
        }
    }

    #[test]
    fn fetch_keeps_trust_wait() {
        let mut machine = engine_machine();
        machine.restore(EngineSnapshot {
            current: EngineState::WaitForTrust,
            flags: vec![EngineFlag::FetchRequested],
            pending: vec![],
        });

        machine.step(SystemTime::now(), never, |_| Ok(vec![EngineFlag::ProcessIncoming]));
        assert_eq!(*machine.current(), EngineState::WaitForTrust);
        assert!(machine.has_flag(&EngineFlag::ProcessIncoming));
    }

    // ===========================================
    // Waiting Tests
    // ===========================================

    #[test]
    fn locked_change_waits_for_unlock() {
        let mut machine = engine_machine();
        machine.set_flag(EngineFlag::ApplyChanges);

        let outcome = machine.step(SystemTime::now(), never, |_| {
            Err(Failure::Retry {
                flag: EngineFlag::ApplyChanges,
                condition: Condition::Predicate(EnginePredicate::DeviceUnlocked),
                wait_state: Some(EngineState::WaitForUnlock),
            })
        });
        assert!(matches!(outcome, Outcome::Waiting { .. }));
        assert_eq!(*machine.current(), EngineState::WaitForUnlock);

        // Still locked: nothing runs.
        assert_eq!(
            machine.step(SystemTime::now(), never, |_| Ok(vec![])),
            Outcome::Quiescent
        );

        // Unlocked: the change runs and the wait ends.
        let outcome = machine.step(SystemTime::now(), |_| true, |op| {
            assert_eq!(*op, EngineOp::ApplyChanges);
            Ok(vec![])
        });
        assert!(matches!(outcome, Outcome::Advanced { .. }));
        assert_eq!(*machine.current(), EngineState::Ready);
    }

    #[test]
    fn trust_gap_retry_fires_after_deadline() {
        let mut machine = engine_machine();
        machine.set_flag(EngineFlag::EnsureKeys);
        let now = SystemTime::now();
        let deadline = now + Duration::from_secs(5);

        machine.step(now, never, |_| {
            Err(Failure::Retry {
                flag: EngineFlag::FetchRequested,
                condition: Condition::At(deadline),
                wait_state: Some(EngineState::WaitForTrust),
            })
        });
        assert_eq!(*machine.current(), EngineState::WaitForTrust);
        assert_eq!(machine.next_deadline(), Some(deadline));

        assert_eq!(machine.step(now, never, |_| Ok(vec![])), Outcome::Quiescent);

        let outcome = machine.step(deadline, never, |op| {
            assert_eq!(*op, EngineOp::Fetch);
            Ok(vec![])
        });
        assert!(matches!(outcome, Outcome::Advanced { .. }));
    }

    #[test]
    fn snapshot_round_trips_through_msgpack() {
        let mut machine = engine_machine();
        machine.set_flag(EngineFlag::PushPending);
        machine.set_pending_flag(
            EngineFlag::ApplyChanges,
            Condition::Predicate(EnginePredicate::DeviceUnlocked),
        );

        let bytes = rmp_serde::to_vec(&machine.snapshot()).unwrap();
        let snapshot: EngineSnapshot = rmp_serde::from_slice(&bytes).unwrap();

        let mut restored = engine_machine();
        restored.restore(snapshot);
        assert!(restored.has_flag(&EngineFlag::PushPending));
        assert!(restored.is_pending(&EngineFlag::ApplyChanges));
    }
}
