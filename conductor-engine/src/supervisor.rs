use std::sync::Arc;

use conductor_core::action::{Action, DecisionSource};
use conductor_core::artifact::NewArtifact;
use conductor_core::config::EngineConfig;
use conductor_core::error::{ConductorError, DecisionError, LedgerError, TransitionError};
use conductor_core::run::{Run, RunId, RunStatus};
use conductor_core::step::Step;
use conductor_core::thread::ThreadMessage;
use conductor_core::tool::{ToolContext, ToolExecutionResult};
use conductor_store::{ArtifactStore, CreditLedger, RunStore, StepStore, ThreadStore};
use tracing::{error, info, warn};

use crate::conversation::ConversationContext;
use crate::planner::Planner;
use crate::router::ToolRouter;
use crate::state::{RunStateMachine, StepStateMachine};

/// Drives runs through their lifecycle: planning, the bounded decide-act
/// loop, and every terminal transition. One supervisor can serve many runs;
/// per-run safety comes from the CAS-guarded state machines, not from any
/// lock held here.
pub struct Supervisor {
    runs: RunStore,
    steps: StepStore,
    threads: ThreadStore,
    ledger: CreditLedger,
    artifacts: ArtifactStore,
    router: ToolRouter,
    decisions: Arc<dyn DecisionSource>,
    planner: Planner,
    run_machine: RunStateMachine,
    step_machine: StepStateMachine,
    config: EngineConfig,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: RunStore,
        steps: StepStore,
        threads: ThreadStore,
        ledger: CreditLedger,
        artifacts: ArtifactStore,
        router: ToolRouter,
        decisions: Arc<dyn DecisionSource>,
        planner: Planner,
        config: EngineConfig,
    ) -> Self {
        let run_machine = RunStateMachine::new(
            runs.clone(),
            steps.clone(),
            ledger.clone(),
            threads.clone(),
        );
        let step_machine = StepStateMachine::new(steps.clone());
        Self {
            runs,
            steps,
            threads,
            ledger,
            artifacts,
            router,
            decisions,
            planner,
            run_machine,
            step_machine,
            config,
        }
    }

    /// Create a run and queue it. The prompt becomes the first transcript
    /// message.
    pub async fn submit(
        &self,
        tenant_id: &str,
        prompt: &str,
    ) -> Result<Run, ConductorError> {
        let run = Run::new(tenant_id, prompt);
        self.runs.insert_run(&run).await?;
        self.threads
            .append(run.id, &ThreadMessage::user(prompt))
            .await?;
        self.run_machine
            .transition(run.id, RunStatus::Created, RunStatus::Queued, "submit", None)
            .await?;
        info!(run_id = %run.id, tenant_id, "run submitted");
        Ok(run)
    }

    /// Take a queued run through planning into execution and drive the loop
    /// until it stops. Returns the status the run stopped in.
    pub async fn start(&self, run_id: RunId) -> Result<RunStatus, ConductorError> {
        let run = self.load(run_id).await?;
        self.run_machine
            .transition(run_id, run.status, RunStatus::Planning, "start", None)
            .await?;

        if let Err(err) = self
            .ledger
            .reserve(
                &run.tenant_id,
                run_id,
                self.config.initial_reserve,
                self.config.max_reserve,
                self.config.reservation_ttl,
            )
            .await
        {
            return self.fail_run(run_id, RunStatus::Planning, "reserve", err).await;
        }

        let plan = match self.planner.plan(&run.prompt).await {
            Ok(plan) => plan,
            Err(err) => {
                return self.fail_run(run_id, RunStatus::Planning, "plan", err).await;
            }
        };
        self.runs.update_plan(run_id, &plan).await?;
        self.threads
            .append(run_id, &ThreadMessage::system(render_plan_summary(&plan)))
            .await?;

        self.run_machine
            .transition(
                run_id,
                RunStatus::Planning,
                RunStatus::Executing,
                "plan_ready",
                Some(serde_json::json!({ "phases": plan.len() })),
            )
            .await?;

        self.run_loop(run_id).await
    }

    /// Re-enter the loop from `waiting_user` with the user's answer.
    pub async fn resume(
        &self,
        run_id: RunId,
        user_input: &str,
    ) -> Result<RunStatus, ConductorError> {
        let run = self.load(run_id).await?;
        self.threads
            .append(run_id, &ThreadMessage::user(user_input))
            .await?;
        self.run_machine
            .transition(run_id, run.status, RunStatus::Executing, "resume", None)
            .await?;
        self.run_loop(run_id).await
    }

    /// Cancel a run from whatever non-terminal status it is in. Terminal
    /// runs are left as they are.
    pub async fn cancel(&self, run_id: RunId) -> Result<RunStatus, ConductorError> {
        let run = self.load(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run.status);
        }
        self.run_machine
            .transition(run_id, run.status, RunStatus::Cancelled, "cancel", None)
            .await?;
        Ok(RunStatus::Cancelled)
    }

    /// Cooperative pause: takes effect before the next loop iteration, never
    /// mid tool call.
    pub async fn pause(&self, run_id: RunId) -> Result<(), ConductorError> {
        let run = self.load(run_id).await?;
        self.run_machine
            .transition(run_id, run.status, RunStatus::Paused, "pause", None)
            .await
    }

    /// The decide-act loop. Stops on any terminal status, `waiting_user`,
    /// an externally observed `paused`/`cancelled`, or iteration exhaustion
    /// (which is a `timeout` transition, not an error).
    async fn run_loop(&self, run_id: RunId) -> Result<RunStatus, ConductorError> {
        let transcript = self.threads.messages(run_id).await?;
        let mut context =
            ConversationContext::with_messages(transcript, self.config.context_token_budget);

        for iteration in 0..self.config.max_iterations {
            let run = self.load(run_id).await?;
            if run.status != RunStatus::Executing {
                info!(run_id = %run_id, status = %run.status, "loop observed non-executing status, stopping");
                return Ok(run.status);
            }

            match self.ledger.available(run_id).await {
                Ok(available) if available > 0 => {}
                Ok(available) => {
                    let err = LedgerError::InsufficientCredits {
                        tenant_id: run.tenant_id.clone(),
                        requested: 1,
                        available,
                    };
                    return self.fail_run(run_id, run.status, "credits", err.into()).await;
                }
                Err(err) => {
                    return self.fail_run(run_id, run.status, "credits", err).await;
                }
            }

            let phase = match run.plan.as_ref().and_then(|p| p.phase(run.current_phase)) {
                Some(phase) => phase.clone(),
                None => {
                    let err = DecisionError::InvalidPhase {
                        run_id,
                        phase: run.current_phase,
                    };
                    return self.fail_run(run_id, run.status, "phase", err.into()).await;
                }
            };

            let decided = tokio::time::timeout(
                self.config.decision_timeout,
                self.decisions.decide(context.messages(), &phase),
            )
            .await;
            let action = match decided {
                Ok(Ok(action)) => action,
                Ok(Err(err)) => {
                    return self.fail_run(run_id, run.status, "decide", err).await;
                }
                Err(_) => {
                    let err = DecisionError::TimedOut {
                        elapsed: self.config.decision_timeout,
                    };
                    return self.fail_run(run_id, run.status, "decide", err.into()).await;
                }
            };
            info!(run_id = %run_id, iteration, action = action.label(), "decision");

            match action {
                Action::Tool { tool_name, input } => {
                    let outcome = self
                        .execute_tool(&run, iteration, &tool_name, input, &mut context)
                        .await;
                    if let Err(err) = outcome {
                        return self.fail_run(run_id, run.status, "tool", err).await;
                    }
                }
                Action::Message { content } => {
                    let message = ThreadMessage::assistant(content);
                    self.threads.append(run_id, &message).await?;
                    context.push(message);
                }
                Action::PhaseComplete => {
                    let plan_len = run.plan.as_ref().map(|p| p.len()).unwrap_or(0);
                    let next = run.current_phase + 1;
                    if next >= plan_len {
                        self.run_machine
                            .transition(
                                run_id,
                                run.status,
                                RunStatus::Completed,
                                "phase_complete",
                                None,
                            )
                            .await?;
                        return Ok(RunStatus::Completed);
                    }
                    self.runs.set_current_phase(run_id, next).await?;
                }
                Action::TaskComplete => {
                    self.run_machine
                        .transition(run_id, run.status, RunStatus::Completed, "task_complete", None)
                        .await?;
                    return Ok(RunStatus::Completed);
                }
                Action::RequestInput { prompt } => {
                    self.run_machine
                        .wait_for_user(run_id, run.status, "request_input", &prompt)
                        .await?;
                    return Ok(RunStatus::WaitingUser);
                }
            }
        }

        warn!(run_id = %run_id, max_iterations = self.config.max_iterations, "iteration budget exhausted");
        self.run_machine
            .transition(
                run_id,
                RunStatus::Executing,
                RunStatus::Timeout,
                "iterations_exhausted",
                None,
            )
            .await?;
        Ok(RunStatus::Timeout)
    }

    /// One tool call: step record, routed execution, credit consumption,
    /// artifact persistence, transcript update. The idempotency key is
    /// stable for the logical call (run, phase, iteration), so a crash-retry
    /// of the same iteration replays the cached result instead of
    /// re-invoking the backend.
    async fn execute_tool(
        &self,
        run: &Run,
        iteration: u32,
        tool_name: &str,
        input: serde_json::Value,
        context: &mut ConversationContext,
    ) -> Result<(), ConductorError> {
        let step = Step::new(run.id, run.current_phase, tool_name, input.clone());
        self.steps.insert_step(&step).await?;
        self.step_machine.start(step.id).await?;

        let tool_ctx = ToolContext {
            tenant_id: run.tenant_id.clone(),
            run_id: run.id,
            step_id: step.id,
        };
        let key = format!("{}:{}:{}", run.id, run.current_phase, iteration);

        let routed = match self.router.execute(tool_name, &input, &tool_ctx, &key).await {
            Ok(routed) => routed,
            Err(err) => {
                if let Err(mark) = self.step_machine.fail(step.id, &err.to_string()).await {
                    error!(step_id = %step.id, error = %mark, "failed to mark step failed");
                }
                return Err(err);
            }
        };
        let result = routed.result;

        // A cache hit was paid for when it first executed.
        let charged = if routed.cache_hit { 0 } else { result.credits_used };
        if charged > 0 {
            if let Err(err) = self.ledger.consume(run.id, charged).await {
                if let Err(mark) = self.step_machine.fail(step.id, &err.to_string()).await {
                    error!(step_id = %step.id, error = %mark, "failed to mark step failed");
                }
                return Err(err);
            }
            self.runs.add_credits_consumed(run.id, charged).await?;
        }

        self.step_machine
            .complete(step.id, &result.output, charged)
            .await?;

        self.persist_artifacts(run, step.id, tool_name, &result).await?;

        let message = ThreadMessage::tool_result(tool_name, &result.output);
        self.threads.append(run.id, &message).await?;
        context.push(message);
        Ok(())
    }

    async fn persist_artifacts(
        &self,
        run: &Run,
        step_id: conductor_core::step::StepId,
        tool_name: &str,
        result: &ToolExecutionResult,
    ) -> Result<(), ConductorError> {
        for artifact in &result.artifacts {
            let outcome = self
                .artifacts
                .put(
                    &artifact.bytes,
                    NewArtifact {
                        mime_type: artifact.mime_type.clone(),
                        run_id: run.id,
                        step_id: Some(step_id),
                        tool_name: Some(tool_name.to_string()),
                        metadata: Some(serde_json::json!({ "name": artifact.name })),
                        parent_hashes: Vec::new(),
                    },
                )
                .await?;
            info!(
                run_id = %run.id,
                hash = %outcome.hash,
                deduplicated = outcome.deduplicated,
                name = %artifact.name,
                "artifact stored"
            );
        }
        Ok(())
    }

    /// Fail the run, stamping the error's kind and message. Returns the
    /// terminal status so loop callers can surface it.
    async fn fail_run(
        &self,
        run_id: RunId,
        observed: RunStatus,
        trigger: &str,
        cause: ConductorError,
    ) -> Result<RunStatus, ConductorError> {
        warn!(run_id = %run_id, kind = cause.kind(), error = %cause, "failing run");
        self.run_machine.fail(run_id, observed, trigger, &cause).await?;
        Ok(RunStatus::Failed)
    }

    async fn load(&self, run_id: RunId) -> Result<Run, ConductorError> {
        self.runs.get_run(run_id).await?.ok_or_else(|| {
            TransitionError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            }
            .into()
        })
    }
}

fn render_plan_summary(plan: &conductor_core::plan::Plan) -> String {
    let mut summary = String::from("Plan:\n");
    for (index, phase) in plan.phases.iter().enumerate() {
        summary.push_str(&format!("{}. {}: {}\n", index + 1, phase.title, phase.description));
    }
    summary
}
