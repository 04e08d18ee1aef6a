use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConductorError;
use crate::plan::Phase;
use crate::thread::ThreadMessage;

/// The closed set of actions a decision source may choose. Serialized with an
/// `action` tag so a model can emit it as one JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Invoke a named tool with the given input.
    Tool {
        tool_name: String,
        input: serde_json::Value,
    },
    /// Emit an assistant message to the transcript.
    Message { content: String },
    /// The current phase is done; advance the phase pointer.
    PhaseComplete,
    /// The whole task is done; complete the run immediately.
    TaskComplete,
    /// Suspend the run and ask the user for input.
    RequestInput { prompt: String },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::Message { .. } => "message",
            Self::PhaseComplete => "phase_complete",
            Self::TaskComplete => "task_complete",
            Self::RequestInput { .. } => "request_input",
        }
    }
}

/// Capability that picks the next action for a run. Implementations must be
/// bounded by their own call timeout; unparseable output surfaces as
/// [`DecisionError::Unparseable`](crate::error::DecisionError), never a panic.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(
        &self,
        history: &[ThreadMessage],
        phase: &Phase,
    ) -> Result<Action, ConductorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_round_trip_through_tagged_json() {
        let action = Action::Tool {
            tool_name: "search".into(),
            input: serde_json::json!({"query": "rust"}),
        };
        let encoded = serde_json::to_string(&action).expect("serialize");
        assert!(encoded.contains(r#""action":"tool""#));
        let decoded: Action = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, action);

        let decoded: Action =
            serde_json::from_str(r#"{"action":"task_complete"}"#).expect("deserialize");
        assert_eq!(decoded, Action::TaskComplete);
    }

    #[test]
    fn unknown_action_tag_is_rejected() {
        let result = serde_json::from_str::<Action>(r#"{"action":"replan"}"#);
        assert!(result.is_err());
    }
}
