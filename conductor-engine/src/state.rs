use std::sync::Arc;

use conductor_core::error::{ConductorError, TransitionError};
use conductor_core::run::{RunId, RunStatus};
use conductor_core::step::{StepId, StepStatus};
use conductor_core::thread::ThreadMessage;
use conductor_store::{CreditLedger, RunStore, StepStore, ThreadStore};
use tracing::{error, info};

/// Validated, CAS-guarded run transitions plus their side effects.
///
/// The order is fixed: table check, CAS write, transition log, side effects.
/// Once the CAS commits the transition stands; a side-effect failure is
/// logged and never rolls it back.
#[derive(Clone)]
pub struct RunStateMachine {
    runs: RunStore,
    steps: StepStore,
    ledger: CreditLedger,
    threads: ThreadStore,
}

impl RunStateMachine {
    pub fn new(runs: RunStore, steps: StepStore, ledger: CreditLedger, threads: ThreadStore) -> Self {
        Self {
            runs,
            steps,
            ledger,
            threads,
        }
    }

    /// Move a run from the status the caller observed to `to`. An edge not
    /// in the transition table is `InvalidTransition`; a CAS loss to another
    /// worker is `ConcurrentModification` (reload and decide, do not retry
    /// blindly).
    pub async fn transition(
        &self,
        run_id: RunId,
        observed: RunStatus,
        to: RunStatus,
        trigger: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), ConductorError> {
        self.transition_inner(run_id, observed, to, trigger, metadata, None)
            .await
    }

    /// Terminal failure: like [`transition`](Self::transition) to `Failed`,
    /// stamping the error's stable kind label and message on the run.
    pub async fn fail(
        &self,
        run_id: RunId,
        observed: RunStatus,
        trigger: &str,
        error: &ConductorError,
    ) -> Result<(), ConductorError> {
        self.transition_inner(
            run_id,
            observed,
            RunStatus::Failed,
            trigger,
            Some(serde_json::json!({ "error_kind": error.kind() })),
            Some((error.kind(), &error.to_string())),
        )
        .await
    }

    /// Suspend for user input: transition to `waiting_user` and persist the
    /// prompt to the transcript so the question survives a restart.
    pub async fn wait_for_user(
        &self,
        run_id: RunId,
        observed: RunStatus,
        trigger: &str,
        prompt: &str,
    ) -> Result<(), ConductorError> {
        self.transition_inner(run_id, observed, RunStatus::WaitingUser, trigger, None, None)
            .await?;
        if let Err(err) = self
            .threads
            .append(run_id, &ThreadMessage::assistant(prompt))
            .await
        {
            error!(run_id = %run_id, error = %err, "failed to persist waiting_user prompt");
        }
        Ok(())
    }

    async fn transition_inner(
        &self,
        run_id: RunId,
        observed: RunStatus,
        to: RunStatus,
        trigger: &str,
        metadata: Option<serde_json::Value>,
        error: Option<(&str, &str)>,
    ) -> Result<(), ConductorError> {
        if !observed.can_transition(to) {
            return Err(TransitionError::Invalid {
                entity: "run",
                id: run_id.to_string(),
                from: observed.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        let moved = self.runs.cas_status(run_id, observed, to, error).await?;
        if !moved {
            let actual = self.runs.get_run(run_id).await?;
            return Err(match actual {
                Some(run) => TransitionError::Concurrent {
                    entity: "run",
                    id: run_id.to_string(),
                    observed: observed.to_string(),
                    actual: run.status.to_string(),
                }
                .into(),
                None => TransitionError::NotFound {
                    entity: "run",
                    id: run_id.to_string(),
                }
                .into(),
            });
        }

        self.runs
            .record_transition(run_id, observed, to, trigger, metadata)
            .await?;
        info!(run_id = %run_id, from = %observed, to = %to, trigger, "run transition");

        if to.is_terminal() {
            self.run_terminal_side_effects(run_id).await;
        }
        Ok(())
    }

    /// Release the reservation and cancel any in-flight steps. Failures here
    /// are logged; the committed transition stands regardless.
    async fn run_terminal_side_effects(&self, run_id: RunId) {
        match self.ledger.release(run_id).await {
            Ok(refund) => info!(run_id = %run_id, refund, "released credit reservation"),
            Err(err) => error!(run_id = %run_id, error = %err, "reservation release failed"),
        }
        match self.steps.cancel_in_flight(run_id).await {
            Ok(0) => {}
            Ok(cancelled) => info!(run_id = %run_id, cancelled, "cancelled in-flight steps"),
            Err(err) => error!(run_id = %run_id, error = %err, "step cancellation failed"),
        }
    }
}

/// Validated step transitions. Same CAS discipline as the run machine;
/// durations are stamped by the store on completion and failure.
#[derive(Clone)]
pub struct StepStateMachine {
    steps: StepStore,
}

impl StepStateMachine {
    pub fn new(steps: StepStore) -> Self {
        Self { steps }
    }

    pub async fn start(&self, step_id: StepId) -> Result<(), ConductorError> {
        if self.steps.cas_start(step_id).await? {
            return Ok(());
        }
        Err(self.stale(step_id, StepStatus::Pending).await?)
    }

    pub async fn complete(
        &self,
        step_id: StepId,
        output: &serde_json::Value,
        credits_charged: i64,
    ) -> Result<(), ConductorError> {
        if self.steps.cas_complete(step_id, output, credits_charged).await? {
            return Ok(());
        }
        Err(self.stale(step_id, StepStatus::Running).await?)
    }

    pub async fn fail(&self, step_id: StepId, error: &str) -> Result<(), ConductorError> {
        if self.steps.cas_fail(step_id, error).await? {
            return Ok(());
        }
        Err(self.stale(step_id, StepStatus::Running).await?)
    }

    async fn stale(
        &self,
        step_id: StepId,
        observed: StepStatus,
    ) -> Result<ConductorError, ConductorError> {
        let actual = self.steps.get_step(step_id).await?;
        Ok(match actual {
            Some(step) => TransitionError::Concurrent {
                entity: "step",
                id: step_id.to_string(),
                observed: observed.to_string(),
                actual: step.status.to_string(),
            }
            .into(),
            None => TransitionError::NotFound {
                entity: "step",
                id: step_id.to_string(),
            }
            .into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use conductor_core::error::{DecisionError, LedgerError};
    use conductor_core::run::Run;
    use conductor_core::step::Step;
    use conductor_store::in_memory_pool;

    struct Fixture {
        machine: RunStateMachine,
        runs: RunStore,
        steps: StepStore,
        ledger: CreditLedger,
        threads: ThreadStore,
    }

    async fn fixture() -> Fixture {
        let pool = in_memory_pool().await.expect("pool");
        let runs = RunStore::new(pool.clone());
        let steps = StepStore::new(pool.clone());
        let ledger = CreditLedger::new(pool.clone());
        let threads = ThreadStore::new(pool);
        let machine = RunStateMachine::new(
            runs.clone(),
            steps.clone(),
            ledger.clone(),
            threads.clone(),
        );
        Fixture {
            machine,
            runs,
            steps,
            ledger,
            threads,
        }
    }

    async fn executing_run(fx: &Fixture) -> Run {
        let mut run = Run::new("tenant-a", "do the thing");
        run.status = RunStatus::Executing;
        fx.runs.insert_run(&run).await.expect("insert");
        run
    }

    #[tokio::test]
    async fn illegal_edge_is_rejected_before_any_write() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        let err = fx
            .machine
            .transition(run.id, RunStatus::Executing, RunStatus::Queued, "test", None)
            .await
            .expect_err("illegal edge");
        assert!(matches!(
            err,
            ConductorError::Transition(TransitionError::Invalid { .. })
        ));
        assert!(fx.runs.list_transitions(run.id).await.expect("log").is_empty());
    }

    #[tokio::test]
    async fn concurrent_cas_has_exactly_one_winner() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        let first = fx
            .machine
            .transition(run.id, RunStatus::Executing, RunStatus::Paused, "worker-1", None)
            .await;
        let second = fx
            .machine
            .transition(run.id, RunStatus::Executing, RunStatus::Completed, "worker-2", None)
            .await;

        assert!(first.is_ok());
        assert!(matches!(
            second.expect_err("stale observation"),
            ConductorError::Transition(TransitionError::Concurrent { .. })
        ));

        let loaded = fx.runs.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::Paused);
        assert_eq!(fx.runs.list_transitions(run.id).await.expect("log").len(), 1);
    }

    #[tokio::test]
    async fn terminal_transition_releases_reservation_and_cancels_steps() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        fx.ledger.grant(&run.tenant_id, 100).await.expect("grant");
        fx.ledger
            .reserve(&run.tenant_id, run.id, 50, 100, Duration::from_secs(3600))
            .await
            .expect("reserve");
        fx.ledger.consume(run.id, 20).await.expect("consume");

        let step = Step::new(run.id, 0, "search", serde_json::json!({}));
        fx.steps.insert_step(&step).await.expect("insert step");
        fx.steps.cas_start(step.id).await.expect("start step");

        fx.machine
            .transition(run.id, RunStatus::Executing, RunStatus::Cancelled, "user", None)
            .await
            .expect("cancel");

        // 30 unconsumed credits refunded; the in-flight step is cancelled.
        assert_eq!(fx.ledger.balance(&run.tenant_id).await.expect("balance"), 80);
        let step = fx.steps.get_step(step.id).await.expect("get").expect("present");
        assert_eq!(step.status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn fail_stamps_error_kind_and_message() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        let cause = ConductorError::Decision(DecisionError::Empty);
        fx.machine
            .fail(run.id, RunStatus::Executing, "supervisor", &cause)
            .await
            .expect("fail");

        let loaded = fx.runs.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error_kind.as_deref(), Some("decision_failed"));
        assert!(loaded.error_message.is_some());
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn failure_with_missing_reservation_still_commits() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        // No reservation exists; the release side effect logs and moves on.
        let cause = ConductorError::Ledger(LedgerError::ReservationMissing { run_id: run.id });
        fx.machine
            .fail(run.id, RunStatus::Executing, "supervisor", &cause)
            .await
            .expect("fail");

        let loaded = fx.runs.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn wait_for_user_persists_prompt() {
        let fx = fixture().await;
        let run = executing_run(&fx).await;

        fx.machine
            .wait_for_user(run.id, RunStatus::Executing, "supervisor", "which region?")
            .await
            .expect("wait");

        let loaded = fx.runs.get_run(run.id).await.expect("get").expect("present");
        assert_eq!(loaded.status, RunStatus::WaitingUser);
        let transcript = fx.threads.messages(run.id).await.expect("messages");
        assert_eq!(transcript.last().expect("message").content, "which region?");
    }

    #[tokio::test]
    async fn step_machine_surfaces_stale_observation() {
        let fx = fixture().await;
        let machine = StepStateMachine::new(fx.steps.clone());

        let step = Step::new(RunId::new_v4(), 0, "search", serde_json::json!({}));
        fx.steps.insert_step(&step).await.expect("insert");

        machine.start(step.id).await.expect("start");
        let err = machine.start(step.id).await.expect_err("already running");
        assert!(matches!(
            err,
            ConductorError::Transition(TransitionError::Concurrent { .. })
        ));

        machine
            .complete(step.id, &serde_json::json!({"ok": true}), 2)
            .await
            .expect("complete");
        let err = machine.fail(step.id, "late failure").await.expect_err("terminal");
        assert!(matches!(
            err,
            ConductorError::Transition(TransitionError::Concurrent { .. })
        ));
    }
}
