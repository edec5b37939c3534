//! Testing utilities for code built on the orchestrator.
//!
//! This module provides:
//! - A scripted stage that replays queued results and records its inputs
//! - A document store that fails writes to chosen collections
//! - A harness wiring an executor to in-memory collaborators

mod fixtures;
mod mocks;

pub use fixtures::TestHarness;
pub use mocks::{FlakyDocumentStore, RecordedInput, ScriptedStage};
