use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;

pub type StepId = uuid::Uuid;

/// Lifecycle of one attempted tool invocation within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub const ALL: [StepStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn legal_targets(self) -> &'static [StepStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition(self, to: StepStatus) -> bool {
        self.legal_targets().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(label: &str) -> Option<StepStatus> {
        Self::ALL.into_iter().find(|s| s.as_str() == label)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    pub phase_index: usize,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub credits_charged: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        run_id: RunId,
        phase_index: usize,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: StepId::new_v4(),
            run_id,
            phase_index,
            tool_name: tool_name.into(),
            input,
            status: StepStatus::Pending,
            output: None,
            error: None,
            credits_charged: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_table_is_closed() {
        assert!(StepStatus::Pending.can_transition(StepStatus::Running));
        assert!(StepStatus::Pending.can_transition(StepStatus::Cancelled));
        assert!(!StepStatus::Pending.can_transition(StepStatus::Completed));
        assert!(StepStatus::Running.can_transition(StepStatus::Failed));
        for terminal in [StepStatus::Completed, StepStatus::Failed, StepStatus::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(terminal.legal_targets().is_empty());
        }
    }

    #[test]
    fn labels_round_trip() {
        for status in StepStatus::ALL {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
    }
}
