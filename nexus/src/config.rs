//! Pipeline configuration.
//!
//! Every field has a serde default so a partial JSON document is a valid
//! configuration. Environment overrides are read through an injected lookup
//! so they can be exercised without touching the process environment.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::core::{StageName, DEFAULT_CRITICAL_STAGES};
use crate::errors::NexusError;
use crate::pipeline::RetryOptions;
use crate::quality::QualityGateConfig;

/// Override for the queued-topic retry bound.
pub const ENV_QUEUE_MAX_RETRIES: &str = "NEXUS_QUEUE_MAX_RETRIES";
/// Override for the default stage retry count.
pub const ENV_RETRY_MAX_RETRIES: &str = "NEXUS_RETRY_MAX_RETRIES";
/// Override for the default stage base delay.
pub const ENV_RETRY_BASE_DELAY_MS: &str = "NEXUS_RETRY_BASE_DELAY_MS";
/// Override for the default stage maximum delay.
pub const ENV_RETRY_MAX_DELAY_MS: &str = "NEXUS_RETRY_MAX_DELAY_MS";

/// Per-stage configuration handed to the stage through its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    /// Retry policy applied by the executor.
    #[serde(default)]
    pub retry: RetryOptions,
    /// Timeout the stage enforces on itself.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Stage-specific settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_queue_max_retries() -> u32 {
    2
}

fn default_critical_stages() -> Vec<StageName> {
    DEFAULT_CRITICAL_STAGES.to_vec()
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            timeout_ms: default_timeout_ms(),
            settings: serde_json::Map::new(),
        }
    }
}

impl StageConfig {
    /// Creates the default stage configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Adds a stage setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

/// Configuration for a pipeline executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Applied to stages without an override.
    #[serde(default)]
    pub default_stage: StageConfig,
    /// Per-stage overrides.
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageConfig>,
    /// How many times a queued topic may be retried.
    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,
    /// Stages whose exhausted retries skip rather than fail the pipeline.
    #[serde(default = "default_critical_stages")]
    pub critical_stages: Vec<StageName>,
    /// Quality gate rules.
    #[serde(default)]
    pub quality: QualityGateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_stage: StageConfig::default(),
            stages: BTreeMap::new(),
            queue_max_retries: default_queue_max_retries(),
            critical_stages: default_critical_stages(),
            quality: QualityGateConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, NexusError> {
        serde_json::from_str(json)
            .map_err(|e| NexusError::critical("CONFIG_INVALID", e.to_string(), "config"))
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))?;
        Ok(config)
    }

    /// Applies `NEXUS_*` overrides read through `lookup`.
    ///
    /// Values that fail to parse are logged and ignored.
    #[must_use]
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override::<u32>(&lookup, ENV_QUEUE_MAX_RETRIES) {
            self.queue_max_retries = v;
        }
        if let Some(v) = parse_override::<i64>(&lookup, ENV_RETRY_MAX_RETRIES) {
            self.default_stage.retry.max_retries = v;
        }
        if let Some(v) = parse_override::<i64>(&lookup, ENV_RETRY_BASE_DELAY_MS) {
            self.default_stage.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_override::<i64>(&lookup, ENV_RETRY_MAX_DELAY_MS) {
            self.default_stage.retry.max_delay_ms = v;
        }
        self
    }

    /// Applies overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Returns the effective configuration for a stage.
    #[must_use]
    pub fn stage_config(&self, stage: StageName) -> StageConfig {
        let mut config = self
            .stages
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| self.default_stage.clone());
        config.retry.stage = stage.as_str().to_string();
        config
    }

    /// Returns true if exhausting `stage` skips the pipeline.
    #[must_use]
    pub fn is_critical_stage(&self, stage: StageName) -> bool {
        self.critical_stages.contains(&stage)
    }

    /// Sets the default stage configuration.
    #[must_use]
    pub fn with_default_stage(mut self, config: StageConfig) -> Self {
        self.default_stage = config;
        self
    }

    /// Overrides one stage's configuration.
    #[must_use]
    pub fn with_stage_config(mut self, stage: StageName, config: StageConfig) -> Self {
        self.stages.insert(stage, config);
        self
    }

    /// Sets the queued-topic retry bound.
    #[must_use]
    pub fn with_queue_max_retries(mut self, retries: u32) -> Self {
        self.queue_max_retries = retries;
        self
    }

    /// Sets the quality gate configuration.
    #[must_use]
    pub fn with_quality(mut self, quality: QualityGateConfig) -> Self {
        self.quality = quality;
        self
    }
}

fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}
