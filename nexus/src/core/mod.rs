//! Core domain model types for the orchestration core.
//!
//! This module contains the fundamental types shared by every component:
//! - The closed set of stage names and their fixed order
//! - Pipeline and stage status enums
//! - Stage output with provider and quality bookkeeping
//! - The run-wide quality context

mod output;
mod quality_context;
mod stage_name;
mod status;

pub use output::{ProviderInfo, ProviderTier, QualityMetrics, StageOutput};
pub use quality_context::QualityContext;
pub use stage_name::{StageName, DEFAULT_CRITICAL_STAGES, STAGE_ORDER};
pub use status::{PipelineStatus, StageRunStatus};
