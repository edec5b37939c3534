//! Error taxonomy for the Nexus orchestration core.
//!
//! Every failure that crosses a component boundary is a [`NexusError`]: a
//! code, a message, the stage it came from, a [`Severity`] decided once at
//! construction, and a structured context map. Severity drives what the
//! rest of the system does with the error:
//!
//! | Severity      | Meaning                                             |
//! |---------------|-----------------------------------------------------|
//! | `CRITICAL`    | abort the current unit of work                      |
//! | `RETRYABLE`   | transient; retried, escalates to `CRITICAL`         |
//! | `FALLBACK`    | provider-specific; try the next provider            |
//! | `DEGRADED`    | partial success; pipeline continues                 |
//! | `RECOVERABLE` | non-essential stage failed; pipeline continues      |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Structured context attached to an error.
pub type ErrorContext = BTreeMap<String, serde_json::Value>;

/// Code used when wrapping errors that carry no classification.
pub const UNKNOWN_ERROR_CODE: &str = "NEXUS_UNKNOWN_ERROR";

/// Severity of a [`NexusError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Abort the current unit of work.
    Critical,
    /// Stage partially succeeded.
    Degraded,
    /// Stage failed but is non-essential.
    Recoverable,
    /// Transient failure, eligible for retry.
    Retryable,
    /// Provider failure, eligible for provider switch.
    Fallback,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "CRITICAL"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Recoverable => write!(f, "RECOVERABLE"),
            Self::Retryable => write!(f, "RETRYABLE"),
            Self::Fallback => write!(f, "FALLBACK"),
        }
    }
}

impl Severity {
    /// Returns true if the severity stops the pipeline when it escapes a stage.
    #[must_use]
    pub fn aborts_pipeline(&self) -> bool {
        matches!(self, Self::Critical | Self::Retryable | Self::Fallback)
    }
}

/// The error type threaded through every Nexus component.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{stage}] {code}: {message}")]
pub struct NexusError {
    /// Machine-readable code, e.g. `TTS_TIMEOUT`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Stage (or component) that raised the error.
    pub stage: String,
    /// Severity classification.
    pub severity: Severity,
    /// Additional structured context.
    #[serde(default)]
    pub context: ErrorContext,
}

impl NexusError {
    /// Creates an error with an explicit severity.
    #[must_use]
    pub fn new(
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stage: stage.into(),
            severity,
            context: ErrorContext::new(),
        }
    }

    /// Creates a `CRITICAL` error.
    #[must_use]
    pub fn critical(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(Severity::Critical, code, message, stage)
    }

    /// Creates a `RETRYABLE` error.
    #[must_use]
    pub fn retryable(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(Severity::Retryable, code, message, stage)
    }

    /// Creates a `FALLBACK` error.
    #[must_use]
    pub fn fallback(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(Severity::Fallback, code, message, stage)
    }

    /// Creates a `DEGRADED` error.
    #[must_use]
    pub fn degraded(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(Severity::Degraded, code, message, stage)
    }

    /// Creates a `RECOVERABLE` error.
    #[must_use]
    pub fn recoverable(code: impl Into<String>, message: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::new(Severity::Recoverable, code, message, stage)
    }

    /// Wraps an unclassified error as `CRITICAL`, keeping its message.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static), stage: impl Into<String>) -> Self {
        if let Some(nexus) = err.downcast_ref::<Self>() {
            return nexus.clone();
        }
        Self::critical(UNKNOWN_ERROR_CODE, err.to_string(), stage)
    }

    /// Wraps an `anyhow` error, returning it unchanged if it already is a `NexusError`.
    #[must_use]
    pub fn from_anyhow(err: anyhow::Error, stage: impl Into<String>) -> Self {
        match err.downcast::<Self>() {
            Ok(nexus) => nexus,
            Err(other) => Self::critical(UNKNOWN_ERROR_CODE, format!("{other:#}"), stage),
        }
    }

    /// Replaces the context.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Returns true if the severity is `CRITICAL`.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Returns true if the severity is `RETRYABLE`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.severity == Severity::Retryable
    }

    /// Returns true if the context marks retries as exhausted.
    #[must_use]
    pub fn exhausted_retries(&self) -> bool {
        self.context
            .get("exhaustedRetries")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns true if the code signals that every provider failed.
    #[must_use]
    pub fn indicates_fallback_exhaustion(&self) -> bool {
        self.code.contains("FALLBACK_EXHAUSTED") || self.code.contains("ALL_PROVIDERS_FAILED")
    }

    /// Compact `{code, message}` summary used in histories and records.
    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            code: self.code.clone(),
            message: self.message.clone(),
            stage: Some(self.stage.clone()),
        }
    }
}

/// A code/message pair detached from the full error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Originating stage, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl From<std::io::Error> for NexusError {
    fn from(err: std::io::Error) -> Self {
        Self::critical("STORE_IO_ERROR", err.to_string(), "state-store")
    }
}

impl From<serde_json::Error> for NexusError {
    fn from(err: serde_json::Error) -> Self {
        Self::critical("STORE_SERIALIZATION_ERROR", err.to_string(), "state-store")
    }
}
