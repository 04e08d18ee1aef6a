//! SQLite persistence for the Conductor engine.
//!
//! One pool, one schema (see [`db::migrate`]); each store wraps the shared
//! pool. Status columns hold the enum labels from `conductor-core`; rich
//! payloads (plan, tool input/output, metadata) are JSON text columns.

pub mod artifact_store;
pub mod db;
pub mod idempotency;
pub mod ledger;
pub mod run_store;
pub mod step_store;
pub mod thread_store;

pub use artifact_store::{ArtifactStore, MemoryBlobStore, PutOutcome};
pub use db::{in_memory_pool, open_pool};
pub use idempotency::IdempotencyCache;
pub use ledger::CreditLedger;
pub use run_store::RunStore;
pub use step_store::StepStore;
pub use thread_store::ThreadStore;
