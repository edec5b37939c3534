//! # Nexus
//!
//! Orchestration core for the Nexus daily content-production pipeline.
//!
//! Eleven stages turn a news topic into a published video: sourcing,
//! research, script generation, pronunciation, text-to-speech, visuals,
//! rendering, thumbnails, upload, a social post, and notifications. This
//! crate runs them in that fixed order with:
//!
//! - **Retry and fallback**: exponential backoff for transient failures and
//!   ordered provider chains for outages
//! - **Severity-driven control flow**: errors decide whether a run
//!   continues, fails, or is skipped and its topic re-queued
//! - **Resumability**: state is persisted after every transition
//! - **Quality gate**: a pre-publish checkpoint that can pause a run for
//!   human review
//! - **Incidents and events**: structured records of everything that went
//!   wrong, plus a lifecycle event stream
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nexus::prelude::*;
//!
//! let executor = PipelineExecutor::builder()
//!     .with_stage(Arc::new(NewsSourcingStage::new(client)))
//!     // ... one stage per StageName ...
//!     .with_stage(Arc::new(NotificationsStage::default()))
//!     .with_document_store(Arc::new(FileDocumentStore::new("state")))
//!     .build()?;
//!
//! let result = executor.execute_pipeline("2026-01-22").await?;
//! if result.status == PipelineStatus::Failed {
//!     executor.resume_pipeline("2026-01-22", None).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod incidents;
pub mod notifications;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod quality;
pub mod review;
pub mod stages;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{PipelineConfig, StageConfig};
    pub use crate::core::{
        PipelineStatus, ProviderInfo, ProviderTier, QualityContext, QualityMetrics, StageName,
        StageOutput, StageRunStatus, STAGE_ORDER,
    };
    pub use crate::errors::{NexusError, Severity};
    pub use crate::events::{EventKind, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::incidents::IncidentLogger;
    pub use crate::notifications::{LogChannel, NotificationChannel, NotificationsStage};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        with_fallback, with_retry, ExecutorBuilder, FallbackOptions, PipelineExecutor, PipelineResult,
        RetryOptions,
    };
    pub use crate::ports::{BudgetTracker, TopicQueue};
    pub use crate::quality::{QualityDecision, QualityDecisionKind, QualityGateConfig};
    pub use crate::review::{ReviewQueue, StoredReviewQueue};
    pub use crate::stages::{Stage, StageInput, StageRegistry};
    pub use crate::state::{DocumentStore, FileDocumentStore, InMemoryDocumentStore, StateStore};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_exposes_stage_order() {
        assert_eq!(STAGE_ORDER.len(), 11);
        assert_eq!(StageName::production_stages().len(), 10);
    }
}
