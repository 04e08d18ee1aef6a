use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::error::{ConductorError, PlanningError};
use conductor_core::plan::{Phase, Plan};
use tracing::{info, warn};

/// Generative plan producer (typically LLM-backed, see
/// [`RigPlanSource`](crate::llm::RigPlanSource)). The planner validates
/// whatever this returns; sources are free to be sloppy.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Plan, ConductorError>;
}

/// Produces the plan for a run: a bounded number of generative attempts,
/// then a deterministic keyword fallback. The fallback cannot fail, so a run
/// only dies in planning when the fallback is disabled.
pub struct Planner {
    source: Option<Arc<dyn PlanSource>>,
    attempts: u32,
    fallback_enabled: bool,
}

// Keyword buckets for the fallback, checked in order. Each matched bucket
// contributes one phase; the delivery phase is always appended last.
const KEYWORD_PHASES: &[(&str, &[&str], &str)] = &[
    (
        "research",
        &["research", "find", "search", "investigate", "gather", "look up"],
        "Gather the information the task needs",
    ),
    (
        "build",
        &["build", "implement", "create", "develop", "generate", "make"],
        "Produce the requested artifact",
    ),
    (
        "write",
        &["write", "draft", "document", "summarize", "compose"],
        "Write the requested content",
    ),
    (
        "analyze",
        &["analyze", "analyse", "compare", "evaluate", "measure", "assess"],
        "Analyze the gathered material",
    ),
    (
        "review",
        &["review", "check", "verify", "validate", "audit"],
        "Review the work for correctness",
    ),
];

impl Planner {
    pub fn new(source: Option<Arc<dyn PlanSource>>, attempts: u32) -> Self {
        Self {
            source,
            attempts,
            fallback_enabled: true,
        }
    }

    /// Disable the deterministic fallback; exhausted generative attempts then
    /// surface as `PlanningError::Exhausted`.
    pub fn without_fallback(mut self) -> Self {
        self.fallback_enabled = false;
        self
    }

    pub async fn plan(&self, prompt: &str) -> Result<Plan, ConductorError> {
        let mut last_reason = String::from("no plan source configured");

        if let Some(source) = &self.source {
            for attempt in 1..=self.attempts.max(1) {
                match source.generate(prompt).await {
                    Ok(plan) => match validate_generated(&plan) {
                        Ok(()) => {
                            info!(phases = plan.len(), attempt, "generated plan accepted");
                            return Ok(plan);
                        }
                        Err(err) => {
                            warn!(attempt, error = %err, "generated plan rejected");
                            last_reason = err.to_string();
                        }
                    },
                    Err(err) => {
                        warn!(attempt, error = %err, "plan source failed");
                        last_reason = err.to_string();
                    }
                }
            }
        }

        if !self.fallback_enabled {
            return Err(PlanningError::Exhausted {
                attempts: self.attempts,
                reason: last_reason,
            }
            .into());
        }

        let plan = fallback_plan(prompt);
        info!(phases = plan.len(), "using deterministic fallback plan");
        Ok(plan)
    }
}

/// Checks a generated plan beyond structural validity: at least two phases,
/// with a delivery phase last. Anything else counts as a failed attempt.
fn validate_generated(plan: &Plan) -> Result<(), PlanningError> {
    plan.validate()?;
    if plan.len() < 2 {
        return Err(PlanningError::Invalid {
            reason: format!("plan has {} phase(s), need at least 2", plan.len()),
        });
    }
    if let Some(last) = plan.phases.last() {
        if !is_delivery_phase(last) {
            return Err(PlanningError::Invalid {
                reason: format!("final phase '{}' is not a delivery phase", last.id),
            });
        }
    }
    Ok(())
}

fn is_delivery_phase(phase: &Phase) -> bool {
    let text = format!("{} {}", phase.id, phase.title).to_lowercase();
    ["deliver", "synthes", "report", "summar", "present"]
        .iter()
        .any(|kw| text.contains(kw))
}

/// Deterministic keyword synthesis. Always yields a valid plan: at least one
/// work phase plus a final delivery phase.
pub fn fallback_plan(prompt: &str) -> Plan {
    let lowered = prompt.to_lowercase();
    let mut phases: Vec<Phase> = KEYWORD_PHASES
        .iter()
        .filter(|(_, keywords, _)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(id, _, description)| Phase::new(*id, title_case(id), *description))
        .collect();

    if phases.is_empty() {
        phases.push(Phase::new("work", "Work", "Carry out the requested task"));
    }

    let prior: Vec<String> = phases.iter().map(|p| p.id.clone()).collect();
    phases.push(
        Phase::new("deliver", "Deliver", "Synthesize results and report back")
            .with_depends_on(prior),
    );
    Plan::new(phases)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    /// Scripted source: yields each result once, in order.
    struct SequencePlanSource {
        results: Mutex<Vec<Result<Plan, ConductorError>>>,
    }

    impl SequencePlanSource {
        fn new(results: Vec<Result<Plan, ConductorError>>) -> Self {
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl PlanSource for SequencePlanSource {
        async fn generate(&self, _prompt: &str) -> Result<Plan, ConductorError> {
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return Err(PlanningError::Unavailable {
                    reason: "sequence exhausted".into(),
                }
                .into());
            }
            results.remove(0)
        }
    }

    fn valid_plan() -> Plan {
        Plan::new(vec![
            Phase::new("research", "Research", "gather"),
            Phase::new("deliver", "Deliver", "wrap up"),
        ])
    }

    #[tokio::test]
    async fn accepts_first_valid_generated_plan() {
        let source = Arc::new(SequencePlanSource::new(vec![Ok(valid_plan())]));
        let planner = Planner::new(Some(source), 3);
        let plan = planner.plan("research rust").await.expect("plan");
        assert_eq!(plan.len(), 2);
    }

    #[tokio::test]
    async fn invalid_plans_are_retried_then_fall_back() {
        let source = Arc::new(SequencePlanSource::new(vec![
            Ok(Plan::new(vec![])),
            Ok(Plan::new(vec![])),
            Ok(Plan::new(vec![])),
        ]));
        let planner = Planner::new(Some(source), 3);

        let plan = planner.plan("anything at all").await.expect("fallback");
        assert!(plan.validate().is_ok());
        assert_eq!(plan.phases.last().expect("phase").id, "deliver");
    }

    #[tokio::test]
    async fn single_phase_generated_plan_is_rejected() {
        let source = Arc::new(SequencePlanSource::new(vec![Ok(Plan::new(vec![
            Phase::new("only", "Only", "do everything at once"),
        ]))]));
        let planner = Planner::new(Some(source), 1);

        let plan = planner.plan("do the thing").await.expect("fallback");
        assert!(plan.len() >= 2);
        assert_eq!(plan.phases.last().expect("phase").id, "deliver");
    }

    #[tokio::test]
    async fn generated_plan_without_final_delivery_phase_is_rejected() {
        let source = Arc::new(SequencePlanSource::new(vec![Ok(Plan::new(vec![
            Phase::new("research", "Research", "gather"),
            Phase::new("build", "Build", "construct"),
        ]))]));
        let planner = Planner::new(Some(source), 1).without_fallback();

        let err = planner.plan("build a widget").await.expect_err("rejected");
        assert!(matches!(
            err,
            ConductorError::Planning(PlanningError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn exhaustion_without_fallback_fails_planning() {
        let source = Arc::new(SequencePlanSource::new(vec![]));
        let planner = Planner::new(Some(source), 2).without_fallback();

        let err = planner.plan("anything").await.expect_err("exhausted");
        assert!(matches!(
            err,
            ConductorError::Planning(PlanningError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(err.kind(), "planning_failed");
    }

    #[tokio::test]
    async fn no_source_goes_straight_to_fallback() {
        let planner = Planner::new(None, 3);
        let plan = planner.plan("please summarize and review the report").await.expect("plan");

        let ids: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["write", "review", "deliver"]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn fallback_without_keywords_yields_default_work_phase() {
        let plan = fallback_plan("xyzzy");
        let ids: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["work", "deliver"]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn fallback_delivery_depends_on_all_prior_phases() {
        let plan = fallback_plan("research and build the widget");
        let deliver = plan.phases.last().expect("deliver");
        assert_eq!(deliver.depends_on, vec!["research", "build"]);
    }
}
