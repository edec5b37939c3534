//! Aggregate outcome of a pipeline run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::{PipelineStatus, ProviderInfo, QualityContext, QualityMetrics, StageName, StageOutput};
use crate::errors::ErrorSummary;
use crate::quality::QualityDecision;
use crate::state::SkipInfo;

/// What a call to `execute_pipeline` or `resume_pipeline` produced.
///
/// This is also the payload handed to the notifications stage, so it
/// serializes with the same camelCase field names as persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Pipeline id.
    pub pipeline_id: String,
    /// Final status. `paused` when the quality gate asked for a human.
    pub status: PipelineStatus,
    /// Stages that produced output, in execution order.
    #[serde(default)]
    pub completed_stages: Vec<StageName>,
    /// Stages that failed with a `RECOVERABLE` error.
    #[serde(default)]
    pub skipped_stages: Vec<StageName>,
    /// Cost per completed stage.
    #[serde(default)]
    pub stage_costs: BTreeMap<StageName, f64>,
    /// Quality measurements per completed stage.
    #[serde(default)]
    pub stage_quality: BTreeMap<StageName, QualityMetrics>,
    /// Provider per completed stage.
    #[serde(default)]
    pub stage_providers: BTreeMap<StageName, ProviderInfo>,
    /// Run-wide quality record.
    #[serde(default)]
    pub quality_context: QualityContext,
    /// Sum of stage costs.
    #[serde(default)]
    pub total_cost: f64,
    /// Wall-clock duration of this call.
    #[serde(default)]
    pub duration_ms: u64,
    /// Originating error of a failed run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    /// Why a skipped run was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_info: Option<SkipInfo>,
    /// Quality gate decision, when the checkpoint ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_decision: Option<QualityDecision>,
    /// Stage a paused run is waiting before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_before_stage: Option<StageName>,
    /// Per-channel outcome reported by the notifications stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
}

impl PipelineResult {
    /// Empty `running` result.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Running,
            completed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            stage_costs: BTreeMap::new(),
            stage_quality: BTreeMap::new(),
            stage_providers: BTreeMap::new(),
            quality_context: QualityContext::new(),
            total_cost: 0.0,
            duration_ms: 0,
            error: None,
            skip_info: None,
            quality_decision: None,
            pause_before_stage: None,
            notifications: None,
        }
    }

    /// Folds a stage's output into the aggregate.
    pub fn record_stage(&mut self, stage: StageName, output: &StageOutput) {
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
        self.stage_costs.insert(stage, output.cost);
        self.stage_providers.insert(stage, output.provider.clone());
        if let Some(quality) = &output.quality {
            self.stage_quality.insert(stage, quality.clone());
        }
        self.total_cost = self.stage_costs.values().sum();
    }

    /// Records a stage that failed without stopping the run.
    pub fn record_skipped(&mut self, stage: StageName) {
        if !self.skipped_stages.contains(&stage) {
            self.skipped_stages.push(stage);
        }
    }

    /// True for `completed` runs.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// True when the run is waiting on a human reviewer.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status == PipelineStatus::Paused
    }

    /// True if `stage` produced output in this run or an earlier one.
    #[must_use]
    pub fn completed(&self, stage: StageName) -> bool {
        self.completed_stages.contains(&stage)
    }
}
