use conductor_core::thread::{MessageRole, ThreadMessage};
use tracing::debug;

/// In-memory view of a run's transcript for the decision source, with a
/// token-estimate budget. The persistent transcript in the store is never
/// compressed; only this working copy is.
pub struct ConversationContext {
    messages: Vec<ThreadMessage>,
    token_budget: u32,
}

impl ConversationContext {
    pub fn new(token_budget: u32) -> Self {
        Self {
            messages: Vec::new(),
            token_budget,
        }
    }

    pub fn with_messages(messages: Vec<ThreadMessage>, token_budget: u32) -> Self {
        let mut ctx = Self {
            messages,
            token_budget,
        };
        ctx.compress_if_needed();
        ctx
    }

    pub fn push(&mut self, message: ThreadMessage) {
        self.messages.push(message);
        self.compress_if_needed();
    }

    pub fn messages(&self) -> &[ThreadMessage] {
        &self.messages
    }

    pub fn total_tokens(&self) -> u32 {
        self.messages.iter().map(|m| m.token_estimate).sum()
    }

    /// Over budget: keep every system message plus the most recent half of
    /// the rest. Applied repeatedly until under budget or nothing more can
    /// be dropped.
    fn compress_if_needed(&mut self) {
        while self.total_tokens() > self.token_budget {
            let non_system = self
                .messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .count();
            if non_system <= 1 {
                break;
            }

            let keep_recent = non_system / 2;
            let mut to_drop = non_system - keep_recent;
            let before = self.messages.len();
            self.messages.retain(|m| {
                if m.role == MessageRole::System || to_drop == 0 {
                    return true;
                }
                to_drop -= 1;
                false
            });
            debug!(
                dropped = before - self.messages.len(),
                remaining_tokens = self.total_tokens(),
                "compressed conversation context"
            );
        }
    }
}
