//! Stage contract and registry.
//!
//! Stages are the units of work the executor drives. Each one implements
//! [`Stage`] for exactly one [`StageName`]; the [`StageRegistry`] maps the
//! closed set of names to implementations.

mod registry;

pub use registry::StageRegistry;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::config::StageConfig;
use crate::core::{QualityContext, StageName, StageOutput};
use crate::errors::NexusError;

/// Input handed to a stage.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Pipeline being executed.
    pub pipeline_id: String,
    /// Stage that produced `data`, `None` for the first stage.
    pub previous_stage: Option<StageName>,
    /// Previous stage's output payload.
    pub data: serde_json::Value,
    /// Effective configuration for this stage.
    pub config: StageConfig,
    /// Quality context accumulated so far.
    pub quality_context: QualityContext,
}

impl StageInput {
    /// Deserializes the payload into a typed view.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, NexusError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            NexusError::critical(
                "STAGE_INPUT_TYPE_MISMATCH",
                e.to_string(),
                self.previous_stage.map_or("orchestrator", |s| s.as_str()),
            )
        })
    }
}

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// The stage this implementation serves.
    fn name(&self) -> StageName;

    /// Executes the stage.
    ///
    /// Failures must be classified; the executor decides what to do with
    /// them from their severity alone.
    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError>;
}

/// Bounds a stage's own work by its configured timeout.
///
/// An elapsed timeout is reported as `RETRYABLE` `{STAGE}_TIMEOUT`.
pub async fn enforce_timeout<T, Fut>(stage: StageName, timeout_ms: u64, work: Fut) -> Result<T, NexusError>
where
    Fut: Future<Output = Result<T, NexusError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
        Ok(result) => result,
        Err(_) => Err(NexusError::retryable(
            format!("{}_TIMEOUT", stage.code_prefix()),
            format!("Stage timed out after {timeout_ms}ms"),
            stage.as_str(),
        )
        .with_context_entry("timeoutMs", timeout_ms)),
    }
}
