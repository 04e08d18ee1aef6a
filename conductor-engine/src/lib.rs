//! Execution engine for Conductor runs.
//!
//! The [`supervisor::Supervisor`] owns the decide-act loop; everything it
//! touches goes through the CAS-guarded state machines in [`state`], the
//! retrying [`router::ToolRouter`], and the planner in [`planner`]. LLM
//! access stays behind the `DecisionSource`/`PlanSource` traits, with rig
//! bindings in [`llm`].

pub mod capability;
pub mod conversation;
pub mod llm;
pub mod planner;
pub mod router;
pub mod state;
pub mod supervisor;

pub use capability::{Capability, CapabilityBackend};
pub use conversation::ConversationContext;
pub use llm::{MockDecisionSource, MockPlanSource, RigDecisionSource, RigPlanSource};
pub use planner::{PlanSource, Planner};
pub use router::{RoutedCall, ToolRoute, ToolRouter};
pub use state::{RunStateMachine, StepStateMachine};
pub use supervisor::Supervisor;
