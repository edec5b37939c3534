//! Persisted pipeline state documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{PipelineStatus, ProviderTier, QualityContext, StageName, StageRunStatus, STAGE_ORDER};
use crate::errors::{ErrorSummary, NexusError};
use crate::quality::QualityDecision;

/// Why a run ended `skipped`, and what happened to its topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipInfo {
    /// Critical stage that exhausted its retries or providers.
    pub stage: StageName,
    /// Failure message.
    pub reason: String,
    /// Whether the topic was re-queued.
    #[serde(default)]
    pub topic_queued: bool,
    /// Date the topic was queued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_for_date: Option<String>,
}

impl SkipInfo {
    /// Skip info with no re-queue recorded yet.
    #[must_use]
    pub fn new(stage: StageName, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            topic_queued: false,
            queued_for_date: None,
        }
    }
}

/// Per-stage record in [`PipelineState::stages`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// Run status.
    pub status: StageRunStatus,
    /// When the stage last started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage last finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration of the last run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Provider that served the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Provider tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ProviderTier>,
    /// Calls made, counting the first as 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Retries beyond the first call.
    #[serde(default)]
    pub retry_attempts: u32,
    /// Cost in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Failure, if the stage did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

impl StageRecord {
    /// True if a resume can start after this stage.
    ///
    /// Only completed stages and stages that degraded while still producing
    /// output qualify. Skipped, failed and error-degraded stages run again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match self.status {
            StageRunStatus::Completed => true,
            StageRunStatus::Degraded => self.error.is_none(),
            _ => false,
        }
    }
}

/// Metadata applied alongside a stage status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    /// Provider that served the stage.
    pub provider: Option<String>,
    /// Provider tier.
    pub tier: Option<ProviderTier>,
    /// Calls made.
    pub attempts: Option<u32>,
    /// Duration.
    pub duration_ms: Option<u64>,
    /// Cost.
    pub cost: Option<f64>,
    /// Failure.
    pub error: Option<ErrorSummary>,
}

impl StageUpdate {
    /// No metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure.
    #[must_use]
    pub fn with_error(mut self, error: &NexusError) -> Self {
        self.error = Some(error.summary());
        self
    }
}

/// The durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    /// Pipeline id.
    pub pipeline_id: String,
    /// Overall status.
    pub status: PipelineStatus,
    /// Stage most recently transitioned.
    #[serde(default)]
    pub current_stage: Option<StageName>,
    /// When the run (or latest resume) started.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Per-stage records.
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageRecord>,
    /// Accumulated quality context.
    #[serde(default)]
    pub quality_context: QualityContext,
    /// Present when the run was skipped.
    #[serde(default)]
    pub skip_info: Option<SkipInfo>,
    /// Present when the run failed.
    #[serde(default)]
    pub error: Option<NexusError>,
    /// Sum of stage costs.
    #[serde(default)]
    pub total_cost: f64,
    /// Latest quality gate decision.
    #[serde(default)]
    pub quality_decision: Option<QualityDecision>,
    /// Stage the run is paused before.
    #[serde(default)]
    pub pause_before_stage: Option<StageName>,
    /// True while a queued topic seeds this run.
    #[serde(default)]
    pub processing_queued_topic: bool,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh `pending` state with every stage pending.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            status: PipelineStatus::Pending,
            current_stage: None,
            start_time: now,
            end_time: None,
            stages: STAGE_ORDER.iter().map(|s| (*s, StageRecord::default())).collect(),
            quality_context: QualityContext::new(),
            skip_info: None,
            error: None,
            total_cost: 0.0,
            quality_decision: None,
            pause_before_stage: None,
            processing_queued_topic: false,
            updated_at: now,
        }
    }

    /// Status of a stage, `Pending` if unrecorded.
    #[must_use]
    pub fn stage_status(&self, stage: StageName) -> StageRunStatus {
        self.stages.get(&stage).map(|r| r.status).unwrap_or_default()
    }

    /// Earliest production stage that has not finished.
    ///
    /// See [`StageRecord::is_finished`]; a skipped stage is never finished.
    #[must_use]
    pub fn first_incomplete_stage(&self) -> Option<StageName> {
        StageName::production_stages()
            .iter()
            .copied()
            .find(|s| !self.stages.get(s).is_some_and(StageRecord::is_finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_pending_with_pending_stages() {
        let state = PipelineState::new("2026-01-22");
        assert_eq!(state.status, PipelineStatus::Pending);
        assert_eq!(state.stages.len(), STAGE_ORDER.len());
        assert_eq!(state.first_incomplete_stage(), Some(StageName::NewsSourcing));
    }

    #[test]
    fn test_first_incomplete_stage_skips_completed_prefix() {
        let mut state = PipelineState::new("p");
        for stage in [StageName::NewsSourcing, StageName::Research, StageName::ScriptGen] {
            state.stages.entry(stage).or_default().status = StageRunStatus::Completed;
        }
        assert_eq!(state.first_incomplete_stage(), Some(StageName::Pronunciation));

        state.stages.entry(StageName::Pronunciation).or_default().status = StageRunStatus::Skipped;
        state.stages.entry(StageName::Tts).or_default().status = StageRunStatus::Completed;
        state.stages.entry(StageName::VisualGen).or_default().status = StageRunStatus::Failed;
        assert_eq!(state.first_incomplete_stage(), Some(StageName::Pronunciation));

        state.stages.entry(StageName::Pronunciation).or_default().status = StageRunStatus::Completed;
        state.stages.entry(StageName::Tts).or_default().status = StageRunStatus::Degraded;
        assert_eq!(state.first_incomplete_stage(), Some(StageName::VisualGen));

        let tts = state.stages.entry(StageName::Tts).or_default();
        tts.error = Some(NexusError::degraded("TTS_QUALITY_LOW", "clipping", "tts").summary());
        assert_eq!(state.first_incomplete_stage(), Some(StageName::Tts));

        for stage in StageName::production_stages() {
            state.stages.entry(*stage).or_default().status = StageRunStatus::Completed;
        }
        assert_eq!(state.first_incomplete_stage(), None);
    }

    #[test]
    fn test_serializes_camel_case_with_kebab_stage_keys() {
        let mut state = PipelineState::new("p");
        state.skip_info = Some(SkipInfo::new(StageName::Tts, "exhausted"));
        let doc = serde_json::to_value(&state).unwrap();
        assert_eq!(doc["pipelineId"], "p");
        assert_eq!(doc["status"], "pending");
        assert_eq!(doc["stages"]["script-gen"]["status"], "pending");
        assert_eq!(doc["skipInfo"]["topicQueued"], false);

        let back: PipelineState = serde_json::from_value(doc).unwrap();
        assert_eq!(back, state);
    }
}
