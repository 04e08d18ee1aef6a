use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MessageId = uuid::Uuid;

/// Role of a message in a run's conversation transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(label: &str) -> Option<MessageRole> {
        [Self::System, Self::User, Self::Assistant, Self::Tool]
            .into_iter()
            .find(|r| r.as_str() == label)
    }
}

/// A single transcript message. Tool results are rendered to text before
/// entering the transcript, so the decision prompt stays flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub token_estimate: u32,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    fn new(role: MessageRole, content: String) -> Self {
        let token_estimate = estimate_tokens(&content);
        Self {
            id: MessageId::new_v4(),
            role,
            content,
            token_estimate,
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text.into())
    }

    pub fn tool_result(tool_name: &str, output: &serde_json::Value) -> Self {
        Self::new(MessageRole::Tool, format!("[{tool_name}] {output}"))
    }
}

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn constructors_set_role_and_estimate() {
        let msg = ThreadMessage::tool_result("search", &serde_json::json!({"hits": 3}));
        assert_eq!(msg.role, MessageRole::Tool);
        assert!(msg.content.starts_with("[search]"));
        assert!(msg.token_estimate > 0);
    }

    #[test]
    fn roles_round_trip() {
        for role in [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
        ] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
    }
}
