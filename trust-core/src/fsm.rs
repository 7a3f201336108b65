//! Generic flag-driven state machine.
//!
//! A machine is a table of transitions `(state, flag) -> (operation,
//! next state)` plus a queue of live flags. Each step consumes the
//! oldest live flag that has a transition from the current state, hands
//! its operation to the caller, and commits the caller's result.
//!
//! Flags are booleans: setting one that is already live does nothing.
//! Pending flags wait for a deadline or an external predicate and are
//! promoted to live flags at the start of a step.
//!
//! The machine never runs operations itself. [`StateMachine::poll`]
//! returns a [`Dispatch`] and [`StateMachine::complete`] commits its
//! result, so an async owner can await the work in between.
//! [`StateMachine::step`] does both for synchronous callers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::time::SystemTime;

/// When a pending flag becomes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition<P> {
    /// Once the wall clock reaches this instant.
    At(SystemTime),
    /// Once the caller reports the predicate as satisfied.
    Predicate(P),
}

/// A flag waiting on a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending<F, P> {
    /// Flag to set when the condition holds.
    pub flag: F,
    /// The condition.
    pub condition: Condition<P>,
}

/// One row of the transition table.
#[derive(Debug, Clone)]
pub struct Transition<S, F, O> {
    /// State the transition leaves.
    pub from: S,
    /// Flag that triggers it.
    pub flag: F,
    /// Operation the caller runs.
    pub op: O,
    /// State entered when the operation succeeds.
    pub next: S,
}

/// An operation handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch<S, F, O> {
    /// The consumed flag.
    pub flag: F,
    /// Operation to run.
    pub op: O,
    /// State entered on success.
    pub next: S,
}

/// How an operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<S, F, P> {
    /// Abort and enter the machine's error state.
    Fatal(String),
    /// Arm `flag` on `condition` and optionally park in `wait_state`.
    Retry {
        /// Flag to re-arm.
        flag: F,
        /// When to promote it.
        condition: Condition<P>,
        /// State to wait in. `None` stays in the current state.
        wait_state: Option<S>,
    },
}

/// Result of a successful operation: flags to set next.
pub type OpResult<S, F, P> = Result<Vec<F>, Failure<S, F, P>>;

/// What a poll found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<S, F, O> {
    /// An operation is ready to run.
    Run(Dispatch<S, F, O>),
    /// No live flag has a transition from the current state.
    Quiescent,
    /// The current state is terminal.
    Halted,
}

/// What a completed step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S, F, O> {
    /// An operation succeeded and the machine moved to `state`.
    Advanced {
        /// The consumed flag.
        flag: F,
        /// The operation that ran.
        op: O,
        /// New current state.
        state: S,
    },
    /// The operation asked to be retried later.
    Waiting {
        /// The consumed flag.
        flag: F,
        /// New current state.
        state: S,
    },
    /// The operation failed fatally; the machine is in its error state.
    Errored {
        /// The operation that failed.
        op: O,
        /// Failure description.
        reason: String,
    },
    /// Nothing to do.
    Quiescent,
    /// The current state is terminal.
    Halted,
}

/// Serializable machine state, for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot<S, F, P> {
    /// Current state.
    pub current: S,
    /// Live flags, oldest first.
    pub flags: Vec<F>,
    /// Pending flags.
    pub pending: Vec<Pending<F, P>>,
}

/// The machine.
#[derive(Debug, Clone)]
pub struct StateMachine<S, F, O, P> {
    initial: S,
    error_state: S,
    terminal: Vec<S>,
    transitions: Vec<Transition<S, F, O>>,
    current: S,
    flags: VecDeque<F>,
    pending: Vec<Pending<F, P>>,
}

impl<S, F, O, P> StateMachine<S, F, O, P>
where
    S: Clone + PartialEq + Debug,
    F: Clone + PartialEq + Debug,
    O: Clone + Debug,
    P: Clone + PartialEq + Debug,
{
    /// New machine in `initial`; fatal failures move it to `error_state`.
    pub fn new(initial: S, error_state: S) -> Self {
        Self {
            current: initial.clone(),
            initial,
            error_state,
            terminal: Vec::new(),
            transitions: Vec::new(),
            flags: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    /// Mark a state as terminal.
    pub fn terminal(mut self, state: S) -> Self {
        if !self.terminal.contains(&state) {
            self.terminal.push(state);
        }
        self
    }

    /// Add a transition.
    pub fn transition(mut self, from: S, flag: F, op: O, next: S) -> Self {
        self.transitions.push(Transition { from, flag, op, next });
        self
    }

    /// Add the same flag/operation from several states.
    pub fn transitions_from(mut self, from: &[S], flag: F, op: O, next: S) -> Self {
        for state in from {
            self = self.transition(state.clone(), flag.clone(), op.clone(), next.clone());
        }
        self
    }

    // ===========================================
    // Inspection
    // ===========================================

    /// Current state.
    pub fn current(&self) -> &S {
        &self.current
    }

    /// The state machines start in.
    pub fn initial(&self) -> &S {
        &self.initial
    }

    /// The state fatal failures lead to.
    pub fn error_state(&self) -> &S {
        &self.error_state
    }

    /// Whether the current state is terminal.
    pub fn is_halted(&self) -> bool {
        self.terminal.contains(&self.current)
    }

    /// Live flags, oldest first.
    pub fn flags(&self) -> impl Iterator<Item = &F> {
        self.flags.iter()
    }

    /// Whether `flag` is live.
    pub fn has_flag(&self, flag: &F) -> bool {
        self.flags.contains(flag)
    }

    /// Pending flags.
    pub fn pending(&self) -> &[Pending<F, P>] {
        &self.pending
    }

    /// Whether `flag` is armed.
    pub fn is_pending(&self, flag: &F) -> bool {
        self.pending.iter().any(|p| p.flag == *flag)
    }

    /// Earliest deadline among pending flags.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.pending
            .iter()
            .filter_map(|p| match p.condition {
                Condition::At(at) => Some(at),
                Condition::Predicate(_) => None,
            })
            .min()
    }

    /// Predicates some pending flag is waiting on.
    pub fn awaited_predicates(&self) -> impl Iterator<Item = &P> {
        self.pending.iter().filter_map(|p| match &p.condition {
            Condition::Predicate(predicate) => Some(predicate),
            Condition::At(_) => None,
        })
    }

    // ===========================================
    // Flags
    // ===========================================

    /// Set a live flag. No effect if it is already live.
    pub fn set_flag(&mut self, flag: F) {
        if !self.flags.contains(&flag) {
            self.flags.push_back(flag);
        }
    }

    /// Arm `flag` on `condition`, replacing any earlier arming of it.
    pub fn set_pending_flag(&mut self, flag: F, condition: Condition<P>) {
        self.pending.retain(|p| p.flag != flag);
        self.pending.push(Pending { flag, condition });
    }

    /// Disarm `flag`. Returns whether it was armed.
    pub fn cancel_pending(&mut self, flag: &F) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.flag != *flag);
        before != self.pending.len()
    }

    /// Promote pending flags whose condition holds. Returns how many.
    pub fn promote_due(&mut self, now: SystemTime, holds: impl Fn(&P) -> bool) -> usize {
        let mut due = Vec::new();
        self.pending.retain(|p| {
            let ready = match &p.condition {
                Condition::At(at) => *at <= now,
                Condition::Predicate(predicate) => holds(predicate),
            };
            if ready {
                due.push(p.flag.clone());
            }
            !ready
        });
        let count = due.len();
        for flag in due {
            self.set_flag(flag);
        }
        count
    }

    // ===========================================
    // Stepping
    // ===========================================

    /// Promote due flags and take the next runnable operation.
    ///
    /// The chosen flag is consumed. The caller must pass the returned
    /// dispatch to [`complete`](Self::complete).
    pub fn poll(&mut self, now: SystemTime, holds: impl Fn(&P) -> bool) -> Poll<S, F, O> {
        if self.is_halted() {
            return Poll::Halted;
        }
        self.promote_due(now, holds);

        let runnable = self.flags.iter().enumerate().find_map(|(index, flag)| {
            self.transitions
                .iter()
                .find(|t| t.from == self.current && t.flag == *flag)
                .map(|t| (index, t.clone()))
        });

        match runnable {
            Some((index, transition)) => {
                self.flags.remove(index);
                Poll::Run(Dispatch {
                    flag: transition.flag,
                    op: transition.op,
                    next: transition.next,
                })
            }
            None => Poll::Quiescent,
        }
    }

    /// Commit the result of a dispatched operation.
    pub fn complete(
        &mut self,
        dispatch: Dispatch<S, F, O>,
        result: OpResult<S, F, P>,
    ) -> Outcome<S, F, O> {
        match result {
            Ok(follow_ups) => {
                self.cancel_pending(&dispatch.flag);
                self.current = dispatch.next;
                for flag in follow_ups {
                    self.set_flag(flag);
                }
                Outcome::Advanced {
                    flag: dispatch.flag,
                    op: dispatch.op,
                    state: self.current.clone(),
                }
            }
            Err(Failure::Retry {
                flag,
                condition,
                wait_state,
            }) => {
                self.set_pending_flag(flag, condition);
                if let Some(state) = wait_state {
                    self.current = state;
                }
                Outcome::Waiting {
                    flag: dispatch.flag,
                    state: self.current.clone(),
                }
            }
            Err(Failure::Fatal(reason)) => {
                self.current = self.error_state.clone();
                Outcome::Errored {
                    op: dispatch.op,
                    reason,
                }
            }
        }
    }

    /// Poll and run one operation synchronously.
    pub fn step(
        &mut self,
        now: SystemTime,
        holds: impl Fn(&P) -> bool,
        run: impl FnOnce(&O) -> OpResult<S, F, P>,
    ) -> Outcome<S, F, O> {
        match self.poll(now, holds) {
            Poll::Run(dispatch) => {
                let result = run(&dispatch.op);
                self.complete(dispatch, result)
            }
            Poll::Quiescent => Outcome::Quiescent,
            Poll::Halted => Outcome::Halted,
        }
    }

    // ===========================================
    // Persistence
    // ===========================================

    /// Capture current state and flags.
    pub fn snapshot(&self) -> MachineSnapshot<S, F, P> {
        MachineSnapshot {
            current: self.current.clone(),
            flags: self.flags.iter().cloned().collect(),
            pending: self.pending.clone(),
        }
    }

    /// Restore state and flags captured by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, snapshot: MachineSnapshot<S, F, P>) {
        self.current = snapshot.current;
        self.flags.clear();
        for flag in snapshot.flags {
            self.set_flag(flag);
        }
        self.pending = snapshot.pending;
    }
}
