use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

pub type RunId = uuid::Uuid;

/// Lifecycle of a run. The four terminal states have no outgoing edges; every
/// other state's legal targets come from [`RunStatus::legal_targets`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Planning,
    Executing,
    WaitingUser,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        Self::Created,
        Self::Queued,
        Self::Planning,
        Self::Executing,
        Self::WaitingUser,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
    ];

    /// The static transition table.
    pub fn legal_targets(self) -> &'static [RunStatus] {
        match self {
            Self::Created => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Planning, Self::Cancelled],
            Self::Planning => &[Self::Executing, Self::Failed, Self::Cancelled],
            Self::Executing => &[
                Self::WaitingUser,
                Self::Paused,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
                Self::Timeout,
            ],
            Self::WaitingUser => &[Self::Executing, Self::Failed, Self::Cancelled, Self::Timeout],
            Self::Paused => &[Self::Executing, Self::Failed, Self::Cancelled, Self::Timeout],
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => &[],
        }
    }

    /// Pure table lookup; no I/O, no side effects.
    pub fn can_transition(self, to: RunStatus) -> bool {
        self.legal_targets().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::WaitingUser => "waiting_user",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(label: &str) -> Option<RunStatus> {
        Self::ALL.into_iter().find(|s| s.as_str() == label)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end agent task. Mutated only through validated, CAS-guarded
/// transitions; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub tenant_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub current_phase: usize,
    pub plan: Option<Plan>,
    pub credits_consumed: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(tenant_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new_v4(),
            tenant_id: tenant_id.into(),
            prompt: prompt.into(),
            status: RunStatus::Created,
            current_phase: 0,
            plan: None,
            credits_consumed: 0,
            error_kind: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable record of one committed status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub run_id: RunId,
    pub from_status: RunStatus,
    pub to_status: RunStatus,
    pub trigger: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for status in RunStatus::ALL {
            if status.is_terminal() {
                assert!(status.legal_targets().is_empty(), "{status} should be terminal");
            } else {
                assert!(!status.legal_targets().is_empty(), "{status} should have targets");
            }
        }
    }

    #[test]
    fn can_transition_matches_table() {
        for from in RunStatus::ALL {
            for to in RunStatus::ALL {
                assert_eq!(
                    from.can_transition(to),
                    from.legal_targets().contains(&to),
                    "table mismatch for {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn every_reachable_state_is_in_the_table() {
        // Every target of a non-terminal state must itself have defined edges
        // (possibly empty, for the four terminal states).
        for from in RunStatus::ALL {
            for to in from.legal_targets() {
                assert!(
                    !to.legal_targets().is_empty() || to.is_terminal(),
                    "{from} reaches {to} which has undefined edges"
                );
            }
        }
    }

    #[test]
    fn executing_reaches_all_terminal_states() {
        for target in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Timeout,
        ] {
            assert!(RunStatus::Executing.can_transition(target));
        }
        assert!(!RunStatus::Executing.can_transition(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_transition(RunStatus::Executing));
    }

    #[test]
    fn status_labels_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }
}
