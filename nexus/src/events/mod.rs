//! Pipeline lifecycle events.
//!
//! The executor reports every transition as a [`PipelineEvent`] to an
//! injected [`EventSink`]. Sinks are observers only: emitting never fails
//! and never influences the run.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::StageName;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `pipeline.started`
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// `pipeline.resumed`
    #[serde(rename = "pipeline.resumed")]
    PipelineResumed,
    /// `stage.started`
    #[serde(rename = "stage.started")]
    StageStarted,
    /// `stage.retry`
    #[serde(rename = "stage.retry")]
    StageRetry,
    /// `stage.completed`
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// `stage.degraded`
    #[serde(rename = "stage.degraded")]
    StageDegraded,
    /// `stage.skipped`
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// `stage.failed`
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// `quality.decision`
    #[serde(rename = "quality.decision")]
    QualityDecision,
    /// `pipeline.completed`
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    /// `pipeline.failed`
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    /// `pipeline.skipped`
    #[serde(rename = "pipeline.skipped")]
    PipelineSkipped,
    /// `pipeline.paused`
    #[serde(rename = "pipeline.paused")]
    PipelinePaused,
    /// `notifications.failed`
    #[serde(rename = "notifications.failed")]
    NotificationsFailed,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineResumed => "pipeline.resumed",
            Self::StageStarted => "stage.started",
            Self::StageRetry => "stage.retry",
            Self::StageCompleted => "stage.completed",
            Self::StageDegraded => "stage.degraded",
            Self::StageSkipped => "stage.skipped",
            Self::StageFailed => "stage.failed",
            Self::QualityDecision => "quality.decision",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::PipelineSkipped => "pipeline.skipped",
            Self::PipelinePaused => "pipeline.paused",
            Self::NotificationsFailed => "notifications.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Kind.
    pub kind: EventKind,
    /// Pipeline the event belongs to.
    pub pipeline_id: String,
    /// Stage, for stage events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// Creates a pipeline-level event.
    #[must_use]
    pub fn new(kind: EventKind, pipeline_id: impl Into<String>) -> Self {
        Self {
            kind,
            pipeline_id: pipeline_id.into(),
            stage: None,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Creates a stage event.
    #[must_use]
    pub fn for_stage(kind: EventKind, pipeline_id: impl Into<String>, stage: StageName) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(kind, pipeline_id)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
