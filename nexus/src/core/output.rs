//! Stage output and provider bookkeeping.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::NexusError;
use crate::pipeline::FallbackResult;

/// Whether the first provider served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    /// The first provider in the list succeeded.
    #[default]
    Primary,
    /// A later provider succeeded.
    Fallback,
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Which provider produced a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Provider name, e.g. `gemini-2.5-pro-tts`.
    pub name: String,
    /// Primary or fallback.
    pub tier: ProviderTier,
    /// Provider attempts made before success.
    pub attempts: u32,
}

impl ProviderInfo {
    /// A primary provider that succeeded on the first attempt.
    #[must_use]
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: ProviderTier::Primary,
            attempts: 1,
        }
    }

    /// A fallback provider reached after `attempts` provider attempts.
    #[must_use]
    pub fn fallback(name: impl Into<String>, attempts: u32) -> Self {
        Self {
            name: name.into(),
            tier: ProviderTier::Fallback,
            attempts,
        }
    }

    /// Derives provider info from a fallback run.
    #[must_use]
    pub fn from_fallback<T>(result: &FallbackResult<T>) -> Self {
        Self {
            name: result.provider.clone(),
            tier: result.tier,
            attempts: u32::try_from(result.attempts.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Quality measurements reported by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// Stage that took the measurements.
    pub stage: String,
    /// When the measurements were taken.
    pub timestamp: DateTime<Utc>,
    /// Named numeric measurements, e.g. `wordCount`.
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
}

impl QualityMetrics {
    /// Creates an empty measurement set for a stage.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            timestamp: Utc::now(),
            measurements: BTreeMap::new(),
        }
    }

    /// Adds a measurement.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }

    /// Looks up a measurement.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.measurements.get(key).copied()
    }
}

/// The result of a stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    /// False when the stage produced usable but incomplete output.
    pub success: bool,
    /// Payload handed to the next stage.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Quality measurements, if the stage took any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityMetrics>,
    /// Cost in USD.
    #[serde(default)]
    pub cost: f64,
    /// Wall-clock duration.
    #[serde(default)]
    pub duration_ms: u64,
    /// Provider that served the stage.
    pub provider: ProviderInfo,
    /// Non-fatal warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageOutput {
    /// Creates a successful output served by a primary provider.
    #[must_use]
    pub fn ok(data: serde_json::Value, provider: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            quality: None,
            cost: 0.0,
            duration_ms: 0,
            provider: ProviderInfo::primary(provider),
            warnings: Vec::new(),
        }
    }

    /// Sets the provider info.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderInfo) -> Self {
        self.provider = provider;
        self
    }

    /// Sets the quality measurements.
    #[must_use]
    pub fn with_quality(mut self, quality: QualityMetrics) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Marks the output as partial.
    #[must_use]
    pub fn partial(mut self) -> Self {
        self.success = false;
        self
    }

    /// Returns true if a fallback provider served the stage.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.provider.tier == ProviderTier::Fallback
    }

    /// Deserializes the payload into a typed view.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, NexusError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            NexusError::critical("STAGE_OUTPUT_TYPE_MISMATCH", e.to_string(), "orchestrator")
        })
    }
}
