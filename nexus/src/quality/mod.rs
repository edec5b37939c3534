//! Pre-publish quality gate.
//!
//! The gate turns stage quality measurements and the run's
//! [`QualityContext`](crate::core::QualityContext) into a
//! [`QualityDecision`]: publish, publish with a warning, or pause for a
//! human.

mod gate;
mod rules;

pub use gate::{QualityGate, QUALITY_DECISIONS_COLLECTION};
pub use rules::{evaluate_issues, QualityGateConfig, QualityRule};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::StageName;

/// How serious a quality issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Publish with a warning.
    Minor,
    /// Requires human review.
    Major,
}

/// A single finding of the quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityIssue {
    /// Minor or major.
    pub severity: IssueSeverity,
    /// Stage the issue is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Machine-readable code, e.g. `METRIC_ABOVE_MAX`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl QualityIssue {
    /// Creates a minor issue.
    #[must_use]
    pub fn minor(stage: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Minor,
            stage,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a major issue.
    #[must_use]
    pub fn major(stage: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Major,
            stage,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns true for major issues.
    #[must_use]
    pub fn is_major(&self) -> bool {
        self.severity == IssueSeverity::Major
    }
}

/// Outcome of the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityDecisionKind {
    /// No issues.
    AutoPublish,
    /// Minor issues only.
    AutoPublishWithWarning,
    /// Major issues or pending critical reviews.
    HumanReview,
}

impl fmt::Display for QualityDecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoPublish => write!(f, "AUTO_PUBLISH"),
            Self::AutoPublishWithWarning => write!(f, "AUTO_PUBLISH_WITH_WARNING"),
            Self::HumanReview => write!(f, "HUMAN_REVIEW"),
        }
    }
}

/// Counters attached to every decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateMetrics {
    /// All issues.
    pub total_issues: usize,
    /// Major issues.
    pub major_issues: usize,
    /// Minor issues.
    pub minor_issues: usize,
    /// Entries in `fallbacksUsed`.
    pub fallback_count: usize,
    /// Entries in `degradedStages`.
    pub degraded_count: usize,
    /// Entries in `flags`.
    pub flag_count: usize,
    /// Pending critical review items found.
    pub pending_reviews: usize,
}

/// A quality gate decision. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDecision {
    /// The decision.
    pub decision: QualityDecisionKind,
    /// One-line explanation.
    pub reason: String,
    /// Findings behind the decision.
    #[serde(default)]
    pub issues: Vec<QualityIssue>,
    /// Review items blocking publication.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_item_ids: Vec<String>,
    /// Stage the pipeline must halt before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_before_stage: Option<StageName>,
    /// Counters.
    pub metrics: QualityGateMetrics,
    /// Result of the issue computation; absent when pending reviews short-circuit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_decision: Option<QualityDecisionKind>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

impl QualityDecision {
    /// Returns true if publication must wait for a human.
    #[must_use]
    pub fn requires_review(&self) -> bool {
        self.decision == QualityDecisionKind::HumanReview
    }
}
