use async_trait::async_trait;
use conductor_core::action::{Action, DecisionSource};
use conductor_core::error::{ConductorError, DecisionError, PlanningError};
use conductor_core::plan::{Phase, Plan};
use conductor_core::thread::{MessageRole, ThreadMessage};

use crate::planner::PlanSource;

const DECISION_INSTRUCTIONS: &str = r#"You are the supervisor of an agent run.
Given the conversation so far and the current phase, reply with EXACTLY ONE
JSON object and nothing else. The object must have an "action" field set to
one of: "tool" (with "tool_name" and "input"), "message" (with "content"),
"phase_complete", "task_complete", "request_input" (with "prompt")."#;

const PLAN_INSTRUCTIONS: &str = r#"Break the task below into a short ordered
plan. Reply with EXACTLY ONE JSON object: {"phases": [{"id", "title",
"description", "required_tools", "depends_on", "expected_outputs"}, ...]}.
Use between 2 and 15 phases; "depends_on" may reference only earlier ids.
The last phase must deliver the result (id "deliver" or similar)."#;

/// `DecisionSource` over a rig completion model. The model is asked for a
/// single tagged JSON action object; anything else is
/// `DecisionError::Unparseable`.
pub struct RigDecisionSource<M: rig::completion::CompletionModel> {
    model: M,
}

impl<M: rig::completion::CompletionModel> RigDecisionSource<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M> DecisionSource for RigDecisionSource<M>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
    M::Response: Send + Sync,
{
    async fn decide(
        &self,
        history: &[ThreadMessage],
        phase: &Phase,
    ) -> Result<Action, ConductorError> {
        let prompt = render_decision_prompt(history, phase);
        let request = self.model.completion_request(prompt).build();
        let response = self.model.completion(request).await.map_err(|err| {
            DecisionError::Unparseable {
                reason: format!("completion failed: {err}"),
            }
        })?;

        let text = first_text(response.choice.iter()).ok_or(DecisionError::Empty)?;
        parse_action(&text)
    }
}

/// `PlanSource` over a rig completion model.
pub struct RigPlanSource<M: rig::completion::CompletionModel> {
    model: M,
}

impl<M: rig::completion::CompletionModel> RigPlanSource<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M> PlanSource for RigPlanSource<M>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
    M::Response: Send + Sync,
{
    async fn generate(&self, prompt: &str) -> Result<Plan, ConductorError> {
        let request = self
            .model
            .completion_request(format!("{PLAN_INSTRUCTIONS}\n\nTask: {prompt}"))
            .build();
        let response = self.model.completion(request).await.map_err(|err| {
            PlanningError::Unavailable {
                reason: format!("completion failed: {err}"),
            }
        })?;

        let text = first_text(response.choice.iter()).ok_or(PlanningError::Invalid {
            reason: "model returned no text".into(),
        })?;
        parse_plan(&text)
    }
}

fn first_text<'a>(
    choice: impl Iterator<Item = &'a rig::message::AssistantContent>,
) -> Option<String> {
    for content in choice {
        if let rig::message::AssistantContent::Text(t) = content {
            return Some(t.text.clone());
        }
    }
    None
}

fn render_decision_prompt(history: &[ThreadMessage], phase: &Phase) -> String {
    let mut prompt = String::from(DECISION_INSTRUCTIONS);
    prompt.push_str(&format!(
        "\n\nCurrent phase: {} ({})\n{}\n",
        phase.id, phase.title, phase.description
    ));
    if !phase.required_tools.is_empty() {
        prompt.push_str(&format!("Available tools: {}\n", phase.required_tools.join(", ")));
    }
    prompt.push_str("\nConversation:\n");
    for message in history {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        prompt.push_str(&format!("[{role}] {}\n", message.content));
    }
    prompt
}

/// Parse model output into an [`Action`], tolerating a markdown code fence
/// around the JSON.
pub fn parse_action(text: &str) -> Result<Action, ConductorError> {
    let trimmed = strip_fence(text);
    if trimmed.is_empty() {
        return Err(DecisionError::Empty.into());
    }
    serde_json::from_str(trimmed).map_err(|err| {
        DecisionError::Unparseable {
            reason: format!("{err}: {}", truncate(trimmed, 200)),
        }
        .into()
    })
}

fn parse_plan(text: &str) -> Result<Plan, ConductorError> {
    let trimmed = strip_fence(text);

    #[derive(serde::Deserialize)]
    struct Phases {
        phases: Vec<Phase>,
    }

    let parsed: Phases = serde_json::from_str(trimmed).map_err(|err| PlanningError::Invalid {
        reason: format!("{err}: {}", truncate(trimmed, 200)),
    })?;
    Ok(Plan::new(parsed.phases))
}

fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>() + "..."
}

/// Scripted decision source for tests: yields each action once, in order,
/// then reports empty output.
pub struct MockDecisionSource {
    actions: std::sync::Mutex<Vec<Action>>,
}

impl MockDecisionSource {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions: std::sync::Mutex::new(actions),
        }
    }
}

#[async_trait]
impl DecisionSource for MockDecisionSource {
    async fn decide(
        &self,
        _history: &[ThreadMessage],
        _phase: &Phase,
    ) -> Result<Action, ConductorError> {
        let mut actions = self.actions.lock().unwrap();
        if actions.is_empty() {
            return Err(DecisionError::Empty.into());
        }
        Ok(actions.remove(0))
    }
}

/// Scripted plan source for tests.
pub struct MockPlanSource {
    plans: std::sync::Mutex<Vec<Plan>>,
}

impl MockPlanSource {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: std::sync::Mutex::new(plans),
        }
    }
}

#[async_trait]
impl PlanSource for MockPlanSource {
    async fn generate(&self, _prompt: &str) -> Result<Plan, ConductorError> {
        let mut plans = self.plans.lock().unwrap();
        if plans.is_empty() {
            return Err(PlanningError::Unavailable {
                reason: "mock plan sequence exhausted".into(),
            }
            .into());
        }
        Ok(plans.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_action_json() {
        let action = parse_action(r#"{"action":"tool","tool_name":"search","input":{"q":"x"}}"#)
            .expect("parse");
        assert!(matches!(action, Action::Tool { .. }));
    }

    #[test]
    fn parses_fenced_action_json() {
        let action = parse_action("```json\n{\"action\":\"task_complete\"}\n```").expect("parse");
        assert_eq!(action, Action::TaskComplete);
    }

    #[test]
    fn garbage_is_unparseable_not_a_panic() {
        let err = parse_action("I think we should search the web").expect_err("garbage");
        assert!(matches!(
            err,
            ConductorError::Decision(DecisionError::Unparseable { .. })
        ));
        assert_eq!(err.kind(), "decision_failed");

        let err = parse_action("   ").expect_err("empty");
        assert!(matches!(err, ConductorError::Decision(DecisionError::Empty)));
    }

    #[test]
    fn plan_json_round_trips() {
        let plan = parse_plan(
            r#"{"phases":[{"id":"research","title":"Research","description":"gather"},
                {"id":"deliver","title":"Deliver","description":"wrap","depends_on":["research"]}]}"#,
        )
        .expect("parse");
        assert_eq!(plan.len(), 2);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn decision_prompt_includes_phase_and_history() {
        let phase = Phase::new("research", "Research", "gather context")
            .with_tools(vec!["search".into()]);
        let history = vec![
            ThreadMessage::system("you are an agent"),
            ThreadMessage::user("find rust news"),
        ];

        let prompt = render_decision_prompt(&history, &phase);
        assert!(prompt.contains("Current phase: research"));
        assert!(prompt.contains("Available tools: search"));
        assert!(prompt.contains("[user] find rust news"));
    }
}
