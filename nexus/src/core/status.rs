//! Pipeline and stage status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a whole pipeline run.
///
/// `pending → running → {completed | failed | skipped | paused}`. Resume is
/// accepted from `failed`, `skipped` and (once reviews are cleared) `paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created but not started.
    #[default]
    Pending,
    /// A run is actively writing this pipeline.
    Running,
    /// Every stage finished.
    Completed,
    /// Aborted on a critical error.
    Failed,
    /// A critical stage exhausted its retries or providers.
    Skipped,
    /// Halted before publishing, waiting for human review.
    Paused,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl PipelineStatus {
    /// Returns true for statuses no run will move out of on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Status of a single stage within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    /// Not yet attempted.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Finished with output.
    Completed,
    /// Partially succeeded.
    Degraded,
    /// Failed but non-essential.
    Skipped,
    /// Failed and stopped the pipeline.
    Failed,
}

impl fmt::Display for StageRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Degraded => write!(f, "degraded"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_status_terminal() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Skipped.is_terminal());
        assert!(!PipelineStatus::Paused.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        assert_eq!(serde_json::to_string(&PipelineStatus::Skipped).unwrap(), r#""skipped""#);
        assert_eq!(StageRunStatus::Degraded.to_string(), "degraded");
    }
}
