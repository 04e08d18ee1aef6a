use std::time::Duration;

use crate::run::RunId;

/// Top-level error for the engine. Every variant maps to a stable
/// [`kind`](ConductorError::kind) label that is persisted on failed runs.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("decision error: {0}")]
    Decision(#[from] DecisionError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("infra error: {0}")]
    Infra(#[from] InfraError),
}

impl ConductorError {
    /// Stable label stored in `runs.error_kind` for terminal failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transition(TransitionError::Invalid { .. }) => "invalid_transition",
            Self::Transition(TransitionError::Concurrent { .. }) => "concurrent_modification",
            Self::Transition(TransitionError::NotFound { .. }) => "infra",
            Self::Planning(_) => "planning_failed",
            Self::Decision(DecisionError::InvalidPhase { .. }) => "invalid_phase",
            Self::Decision(_) => "decision_failed",
            Self::Tool(ToolError::Timeout { .. }) => "timeout",
            Self::Tool(_) => "tool_execution_error",
            Self::Ledger(_) => "insufficient_credits",
            Self::Artifact(_) => "artifact_upload_failed",
            Self::Infra(_) => "infra",
        }
    }
}

/// State-machine violations. `Invalid` means the requested edge is not in the
/// transition table; `Concurrent` means the CAS write lost to another worker.
/// Callers must not retry a `Concurrent` failure blindly; reload and decide.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to} for {entity} {id}")]
    Invalid {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} {id} concurrently modified: observed {observed}, found {actual}")]
    Concurrent {
        entity: &'static str,
        id: String,
        observed: String,
        actual: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("plan source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("generated plan invalid: {reason}")]
    Invalid { reason: String },

    #[error("planning failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("decision source returned unparseable content: {reason}")]
    Unparseable { reason: String },

    #[error("decision source returned empty content")]
    Empty,

    #[error("decision source timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("run {run_id} has no phase at index {phase}")]
    InvalidPhase { run_id: RunId, phase: usize },
}

#[derive(Debug, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum ToolError {
    #[error("tool not found: {tool_name}")]
    NotFound { tool_name: String },

    #[error("tool {tool_name} execution failed: {message}")]
    ExecutionFailed {
        tool_name: String,
        message: String,
        retryable: bool,
    },

    #[error("tool {tool_name} timed out after {elapsed:?}")]
    Timeout { tool_name: String, elapsed: Duration },
}

impl ToolError {
    /// Whether the router may retry this failure. Timeouts are retryable;
    /// backend failures carry their own flag; an unknown tool never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::ExecutionFailed { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credits for tenant {tenant_id}: requested {requested}, available {available}")]
    InsufficientCredits {
        tenant_id: String,
        requested: i64,
        available: i64,
    },

    #[error("reservation for run {run_id} capped: consumed {consumed} + {requested} exceeds max {max_amount}")]
    MaxAmountExceeded {
        run_id: RunId,
        consumed: i64,
        requested: i64,
        max_amount: i64,
    },

    #[error("no active reservation for run {run_id}")]
    ReservationMissing { run_id: RunId },

    #[error("reservation for run {run_id} expired at {expired_at}")]
    ReservationExpired {
        run_id: RunId,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("run {run_id} already holds an active reservation")]
    ReservationExists { run_id: RunId },
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact upload failed for {hash}: {message}")]
    UploadFailed { hash: String, message: String },

    #[error("artifact not found: {hash}")]
    NotFound { hash: String },

    #[error("blob store error: {0}")]
    Blob(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_are_stable_labels() {
        let err = ConductorError::Decision(DecisionError::Empty);
        assert_eq!(err.kind(), "decision_failed");

        let err = ConductorError::Decision(DecisionError::InvalidPhase {
            run_id: uuid::Uuid::new_v4(),
            phase: 3,
        });
        assert_eq!(err.kind(), "invalid_phase");

        let err = ConductorError::Tool(ToolError::Timeout {
            tool_name: "search".into(),
            elapsed: Duration::from_secs(5),
        });
        assert_eq!(err.kind(), "timeout");

        let err = ConductorError::Ledger(LedgerError::ReservationMissing {
            run_id: uuid::Uuid::new_v4(),
        });
        assert_eq!(err.kind(), "insufficient_credits");

        let err = ConductorError::Decision(DecisionError::TimedOut {
            elapsed: Duration::from_secs(30),
        });
        assert_eq!(err.kind(), "decision_failed");
    }

    #[test]
    fn tool_error_retryability() {
        assert!(ToolError::Timeout {
            tool_name: "t".into(),
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());

        assert!(!ToolError::NotFound {
            tool_name: "t".into()
        }
        .is_retryable());

        assert!(!ToolError::ExecutionFailed {
            tool_name: "t".into(),
            message: "bad input".into(),
            retryable: false,
        }
        .is_retryable());
    }
}
