//! Operational incidents and the daily digest.
//!
//! Incidents are independent of pipeline state: they outlive the run that
//! raised them and feed post-mortems and the daily digest.

mod logger;

pub use logger::{IncidentLogger, INCIDENTS_COLLECTION};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::{ErrorSummary, NexusError, Severity};

/// Severity of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    /// Pipeline-stopping.
    Critical,
    /// Degraded output or provider trouble.
    Warning,
    /// Transient or non-essential.
    Recoverable,
}

impl fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Recoverable => write!(f, "RECOVERABLE"),
        }
    }
}

/// Maps an error severity onto an incident severity.
#[must_use]
pub fn map_severity(severity: Severity) -> IncidentSeverity {
    match severity {
        Severity::Critical => IncidentSeverity::Critical,
        Severity::Degraded | Severity::Fallback => IncidentSeverity::Warning,
        Severity::Recoverable | Severity::Retryable => IncidentSeverity::Recoverable,
    }
}

/// Root-cause category inferred from an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    /// Deadline or timeout.
    Timeout,
    /// Provider throttling.
    RateLimit,
    /// Quota used up.
    QuotaExceeded,
    /// Credentials rejected.
    AuthFailure,
    /// Connectivity.
    NetworkError,
    /// Misconfiguration.
    ConfigError,
    /// Bad or unparseable data.
    DataError,
    /// Memory, disk or similar.
    ResourceExhausted,
    /// An upstream dependency failed.
    DependencyFailure,
    /// Provider outage.
    ApiOutage,
    /// No keyword matched.
    Unknown,
}

impl RootCause {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::AuthFailure => "auth_failure",
            Self::NetworkError => "network_error",
            Self::ConfigError => "config_error",
            Self::DataError => "data_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::DependencyFailure => "dependency_failure",
            Self::ApiOutage => "api_outage",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order; the first matching keyword wins.
const ROOT_CAUSE_KEYWORDS: &[(RootCause, &[&str])] = &[
    (RootCause::Timeout, &["timeout", "timed_out", "deadline"]),
    (RootCause::RateLimit, &["rate_limit", "ratelimit", "too_many_requests", "429"]),
    (RootCause::QuotaExceeded, &["quota"]),
    (
        RootCause::AuthFailure,
        &["auth", "unauthorized", "forbidden", "credential", "401", "403"],
    ),
    (
        RootCause::NetworkError,
        &["network", "connection", "econn", "dns", "socket"],
    ),
    (RootCause::ConfigError, &["config", "missing_env", "invalid_option"]),
    (
        RootCause::DataError,
        &["invalid", "parse", "validation", "malformed", "schema"],
    ),
    (
        RootCause::ResourceExhausted,
        &["resource_exhausted", "out_of_memory", "oom", "disk_full"],
    ),
    (
        RootCause::DependencyFailure,
        &["dependency", "upstream", "fallback_exhausted", "all_providers"],
    ),
    (
        RootCause::ApiOutage,
        &["outage", "unavailable", "server_error", "500", "502", "503"],
    ),
];

/// Classifies an error code by case-insensitive keyword match.
#[must_use]
pub fn infer_root_cause(code: &str) -> RootCause {
    let code = code.to_ascii_lowercase();
    ROOT_CAUSE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| code.contains(k)))
        .map_or(RootCause::Unknown, |(cause, _)| *cause)
}

/// An incident to be logged.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    /// Pipeline the incident belongs to.
    pub pipeline_id: String,
    /// Stage or component that failed.
    pub stage: String,
    /// The failure.
    pub error: ErrorSummary,
    /// Incident severity.
    pub severity: IncidentSeverity,
    /// When the failure was detected; defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    /// Extra context.
    pub context: Value,
}

impl NewIncident {
    /// Builds an incident from a classified error.
    #[must_use]
    pub fn from_error(pipeline_id: impl Into<String>, error: &NexusError) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage: error.stage.clone(),
            error: ErrorSummary {
                code: error.code.clone(),
                message: error.message.clone(),
                stage: None,
            },
            severity: map_severity(error.severity),
            start_time: None,
            context: serde_json::to_value(&error.context).unwrap_or(Value::Null),
        }
    }

    /// Overrides the detection time.
    #[must_use]
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }
}

/// Post-mortem timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortemTimeline {
    /// Detection time.
    pub detected: DateTime<Utc>,
    /// Impact statement.
    pub impact: String,
}

/// Post-mortem impact section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortemImpact {
    /// Affected pipeline.
    pub pipeline_affected: String,
    /// Affected stage.
    pub stage_affected: String,
    /// Expected effect on the day's video.
    pub potential_video_impact: String,
}

/// Post-mortem template attached to CRITICAL incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortem {
    /// Timeline.
    pub timeline: PostMortemTimeline,
    /// Summary.
    pub summary: String,
    /// Impact.
    pub impact: PostMortemImpact,
    /// Filled in by the operator.
    pub root_cause_analysis: String,
    /// Filled in by the operator.
    #[serde(default)]
    pub action_items: Vec<String>,
    /// Filled in by the operator.
    pub lessons_learned: String,
}

/// A persisted incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    /// `{date}-{sequence}`, e.g. `2026-01-22-001`.
    pub id: String,
    /// `YYYY-MM-DD` of detection.
    pub date: String,
    /// Pipeline id.
    pub pipeline_id: String,
    /// Stage or component.
    pub stage: String,
    /// The failure.
    pub error: ErrorSummary,
    /// Severity.
    pub severity: IncidentSeverity,
    /// Detection time.
    pub start_time: DateTime<Utc>,
    /// Resolution time.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time` in ms.
    #[serde(default)]
    pub duration: Option<u64>,
    /// Inferred root cause.
    pub root_cause: RootCause,
    /// Extra context.
    #[serde(default)]
    pub context: Value,
    /// False once resolved.
    pub is_open: bool,
    /// Resolution note.
    #[serde(default)]
    pub resolution: Option<String>,
    /// Present for CRITICAL incidents.
    #[serde(default)]
    pub post_mortem: Option<PostMortem>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// One incident as shown in the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestIncident {
    /// Incident id.
    pub id: String,
    /// Stage or component.
    pub stage: String,
    /// Severity.
    pub severity: IncidentSeverity,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Inferred root cause.
    pub root_cause: RootCause,
    /// Still open.
    pub is_open: bool,
    /// Resolution time in ms.
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Incident aggregate for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentDigestSummary {
    /// Day summarized.
    pub date: String,
    /// All incidents.
    pub total_count: usize,
    /// CRITICAL incidents.
    pub critical_count: usize,
    /// WARNING incidents.
    pub warning_count: usize,
    /// RECOVERABLE incidents.
    pub recoverable_count: usize,
    /// Distinct stages, in first-seen order.
    pub stages_affected: Vec<String>,
    /// Mean resolution time over resolved incidents.
    pub avg_resolution_time_ms: Option<f64>,
    /// Incidents still open.
    pub open_incidents: usize,
    /// Digest entries.
    pub incidents: Vec<DigestIncident>,
}
