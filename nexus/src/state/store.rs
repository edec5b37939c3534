//! The State Store: sole owner of [`PipelineState`] documents.

use chrono::Utc;
use std::sync::Arc;

use super::document::DocumentStore;
use super::model::{PipelineState, SkipInfo, StageUpdate};
use crate::core::{PipelineStatus, QualityContext, StageName, StageOutput, StageRunStatus};
use crate::errors::NexusError;
use crate::quality::QualityDecision;

/// Collection holding pipeline state documents.
pub const PIPELINES_COLLECTION: &str = "pipelines";

/// Collection holding a pipeline's stage outputs, keyed by stage name.
#[must_use]
pub fn outputs_collection(pipeline_id: &str) -> String {
    format!("{PIPELINES_COLLECTION}/{pipeline_id}/outputs")
}

/// Typed access to pipeline state over a [`DocumentStore`].
///
/// Every operation acts on exactly one pipeline id. Mutations read the
/// current document, apply the change and write it back; callers must not
/// run two writers for the same id concurrently.
#[derive(Debug, Clone)]
pub struct StateStore {
    store: Arc<dyn DocumentStore>,
}

impl StateStore {
    /// Creates a state store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying document store.
    #[must_use]
    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Writes a fresh `pending` state, replacing any previous one.
    ///
    /// Stage outputs left by an earlier run under the same id are deleted
    /// so a later resume cannot fold them in.
    pub async fn initialize_pipeline(&self, pipeline_id: &str) -> Result<PipelineState, NexusError> {
        let outputs = outputs_collection(pipeline_id);
        let stale = self.store.query(&outputs, &[]).await?;
        for (id, _) in &stale {
            self.store.delete(&outputs, id).await?;
        }

        let state = PipelineState::new(pipeline_id);
        self.save(&state).await?;
        tracing::debug!(pipeline_id, cleared_outputs = stale.len(), "Pipeline state initialized");
        Ok(state)
    }

    /// Loads state, failing with `PIPELINE_NOT_FOUND` if absent.
    pub async fn get_state(&self, pipeline_id: &str) -> Result<PipelineState, NexusError> {
        self.try_get_state(pipeline_id).await?.ok_or_else(|| {
            NexusError::critical(
                "PIPELINE_NOT_FOUND",
                format!("No state for pipeline '{pipeline_id}'"),
                "state-store",
            )
            .with_context_entry("pipelineId", pipeline_id)
        })
    }

    /// Loads state if it exists.
    pub async fn try_get_state(&self, pipeline_id: &str) -> Result<Option<PipelineState>, NexusError> {
        match self.store.get(PIPELINES_COLLECTION, pipeline_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &PipelineState) -> Result<(), NexusError> {
        self.store
            .set(PIPELINES_COLLECTION, &state.pipeline_id, serde_json::to_value(state)?)
            .await
    }

    async fn mutate<F>(&self, pipeline_id: &str, apply: F) -> Result<PipelineState, NexusError>
    where
        F: FnOnce(&mut PipelineState) + Send,
    {
        let mut state = self.get_state(pipeline_id).await?;
        apply(&mut state);
        state.updated_at = Utc::now();
        self.save(&state).await?;
        Ok(state)
    }

    /// Records a stage status transition with its metadata.
    pub async fn update_stage_status(
        &self,
        pipeline_id: &str,
        stage: StageName,
        status: StageRunStatus,
        update: StageUpdate,
    ) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| {
            state.current_stage = Some(stage);
            let record = state.stages.entry(stage).or_default();
            record.status = status;
            let now = Utc::now();
            match status {
                StageRunStatus::Running => {
                    record.started_at = Some(now);
                    record.completed_at = None;
                    record.error = None;
                }
                StageRunStatus::Pending => {}
                _ => record.completed_at = Some(now),
            }
            if update.provider.is_some() {
                record.provider = update.provider;
            }
            if update.tier.is_some() {
                record.tier = update.tier;
            }
            if update.attempts.is_some() {
                record.attempts = update.attempts;
            }
            if update.duration_ms.is_some() {
                record.duration_ms = update.duration_ms;
            }
            if update.cost.is_some() {
                record.cost = update.cost;
            }
            if update.error.is_some() {
                record.error = update.error;
            }
        })
        .await?;
        Ok(())
    }

    /// Returns a paused or terminal pipeline to `running` for a resume.
    pub async fn mark_running(&self, pipeline_id: &str) -> Result<PipelineState, NexusError> {
        self.mutate(pipeline_id, |state| {
            state.status = PipelineStatus::Running;
            state.start_time = Utc::now();
            state.end_time = None;
            state.error = None;
            state.skip_info = None;
            state.pause_before_stage = None;
        })
        .await
    }

    /// Marks the run completed.
    pub async fn mark_complete(&self, pipeline_id: &str) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| {
            state.status = PipelineStatus::Completed;
            state.end_time = Some(Utc::now());
            state.pause_before_stage = None;
        })
        .await?;
        Ok(())
    }

    /// Marks the run failed with `error`.
    pub async fn mark_failed(&self, pipeline_id: &str, error: &NexusError) -> Result<(), NexusError> {
        let error = error.clone();
        self.mutate(pipeline_id, move |state| {
            state.status = PipelineStatus::Failed;
            state.end_time = Some(Utc::now());
            state.error = Some(error);
        })
        .await?;
        Ok(())
    }

    /// Marks the run skipped because `stage` could not complete.
    pub async fn mark_skipped(&self, pipeline_id: &str, reason: &str, stage: StageName) -> Result<(), NexusError> {
        let info = SkipInfo::new(stage, reason);
        self.mutate(pipeline_id, move |state| {
            state.status = PipelineStatus::Skipped;
            state.end_time = Some(Utc::now());
            state.skip_info = Some(info);
        })
        .await?;
        Ok(())
    }

    /// Records that the skipped run's topic was re-queued.
    pub async fn record_topic_requeue(&self, pipeline_id: &str, queued_for_date: &str) -> Result<(), NexusError> {
        let date = queued_for_date.to_string();
        self.mutate(pipeline_id, move |state| {
            if let Some(info) = state.skip_info.as_mut() {
                info.topic_queued = true;
                info.queued_for_date = Some(date);
            }
        })
        .await?;
        Ok(())
    }

    /// Pauses the run before `stage` pending human review.
    pub async fn mark_paused(&self, pipeline_id: &str, stage: StageName) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| {
            state.status = PipelineStatus::Paused;
            state.pause_before_stage = Some(stage);
        })
        .await?;
        Ok(())
    }

    /// Persists the quality context.
    pub async fn update_quality_context(&self, pipeline_id: &str, quality_context: &QualityContext) -> Result<(), NexusError> {
        let ctx = quality_context.clone();
        self.mutate(pipeline_id, move |state| state.quality_context = ctx).await?;
        Ok(())
    }

    /// Records how many retries a stage needed.
    pub async fn update_retry_attempts(&self, pipeline_id: &str, stage: StageName, retries: u32) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| {
            state.stages.entry(stage).or_default().retry_attempts = retries;
        })
        .await?;
        Ok(())
    }

    /// Records the latest quality gate decision.
    pub async fn record_quality_decision(&self, pipeline_id: &str, decision: &QualityDecision) -> Result<(), NexusError> {
        let decision = decision.clone();
        self.mutate(pipeline_id, move |state| state.quality_decision = Some(decision))
            .await?;
        Ok(())
    }

    /// Marks whether a queued topic seeds this run.
    pub async fn set_processing_queued_topic(&self, pipeline_id: &str, processing: bool) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| state.processing_queued_topic = processing)
            .await?;
        Ok(())
    }

    /// Records the running cost total.
    pub async fn update_total_cost(&self, pipeline_id: &str, total_cost: f64) -> Result<(), NexusError> {
        self.mutate(pipeline_id, |state| state.total_cost = total_cost).await?;
        Ok(())
    }

    /// Persists a stage's output so a resume can skip the stage.
    pub async fn persist_stage_output(&self, pipeline_id: &str, stage: StageName, output: &StageOutput) -> Result<(), NexusError> {
        self.store
            .set(&outputs_collection(pipeline_id), stage.as_str(), serde_json::to_value(output)?)
            .await
    }

    /// Loads a previously persisted stage output.
    pub async fn load_stage_output(&self, pipeline_id: &str, stage: StageName) -> Result<Option<StageOutput>, NexusError> {
        match self.store.get(&outputs_collection(pipeline_id), stage.as_str()).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }
}
