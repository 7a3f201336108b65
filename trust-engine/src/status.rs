//! Published account status and snapshots.
//!
//! Readers get an `Arc<AccountSnapshot>` from a watch channel. A snapshot
//! is never edited after publication, so readers never see a circle from
//! one batch paired with key sets from another.

use crate::account::machine::EngineState;
use serde::{Deserialize, Serialize};
use zerok_trust_core::{Circle, CircleStatus, KeyHierarchy, KeySet, PeerInfo};
use zerok_trust_types::{AccountId, Generation, ViewName};

/// Aggregate, user-facing account status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    /// This device's standing in the circle.
    pub circle_status: CircleStatus,
    /// Applicants waiting for a decision.
    pub pending_applicants: usize,
    /// Engine state.
    pub state: EngineState,
    /// Whether the engine is waiting on another device or an unlock.
    pub waiting: bool,
    /// Push retries were exhausted; the relay is unreachable or refusing.
    pub degraded: bool,
    /// Generation of the accepted circle, if any.
    pub generation: Option<Generation>,
    /// Last fatal failure, cleared by reset.
    pub last_error: Option<String>,
    /// Last dropped change or skipped blob.
    pub last_warning: Option<String>,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self {
            circle_status: CircleStatus::NotInCircle,
            pending_applicants: 0,
            state: EngineState::Ready,
            waiting: false,
            degraded: false,
            generation: None,
            last_error: None,
            last_warning: None,
        }
    }
}

impl AccountStatus {
    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        let standing = match self.circle_status {
            CircleStatus::NotInCircle => "not in circle",
            CircleStatus::Applying => "waiting for another device",
            CircleStatus::InCircle => "in circle",
            CircleStatus::Retired => "retired",
        };
        let mut summary = standing.to_string();
        if let Some(generation) = self.generation {
            summary.push_str(&format!(" (generation {})", generation.value()));
        }
        if self.pending_applicants > 0 {
            summary.push_str(&format!(", {} pending applicant(s)", self.pending_applicants));
        }
        if self.degraded {
            summary.push_str(", relay degraded");
        }
        if let Some(error) = &self.last_error {
            summary.push_str(&format!(", error: {}", error));
        }
        summary
    }
}

/// Immutable view of one account, published after every batch.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    /// The account.
    pub account: AccountId,
    /// This device.
    pub local_peer: PeerInfo,
    /// Accepted circle snapshot.
    pub circle: Option<Circle>,
    /// Key sets and shares.
    pub keys: KeyHierarchy,
    /// Status at publication time.
    pub status: AccountStatus,
}

impl AccountSnapshot {
    /// The key set new data in `view` must be written under.
    pub fn current_key_set(&self, view: &ViewName) -> Option<&KeySet> {
        self.keys.current_key_set(view)
    }

    /// This device's standing.
    pub fn circle_status(&self) -> CircleStatus {
        self.status.circle_status
    }

    /// Applicants waiting for a decision.
    pub fn pending_applicant_count(&self) -> usize {
        self.status.pending_applicants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_not_in_circle() {
        let status = AccountStatus::default();
        assert_eq!(status.circle_status, CircleStatus::NotInCircle);
        assert!(!status.degraded);
        assert_eq!(status.summary(), "not in circle");
    }

    #[test]
    fn summary_mentions_problems() {
        let status = AccountStatus {
            circle_status: CircleStatus::InCircle,
            pending_applicants: 2,
            generation: Some(Generation::new(4)),
            degraded: true,
            ..AccountStatus::default()
        };
        let summary = status.summary();
        assert!(summary.starts_with("in circle (generation 4)"));
        assert!(summary.contains("2 pending applicant(s)"));
        assert!(summary.contains("relay degraded"));
    }
}
