//! Core domain types for the Conductor agent execution engine.
//!
//! This crate is I/O-free: run/step records and their transition tables, the
//! plan model, the action sum type, the error taxonomy, and the capability
//! traits (`DecisionSource`, `ToolBackend`, `BlobStore`) that the engine and
//! stores are built against.

pub mod action;
pub mod artifact;
pub mod config;
pub mod credit;
pub mod error;
pub mod plan;
pub mod run;
pub mod step;
pub mod thread;
pub mod tool;
