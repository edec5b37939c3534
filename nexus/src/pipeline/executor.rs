//! The pipeline executor.
//!
//! Drives the fixed stage order as a resumable state machine. Each stage
//! runs under [`with_retry`]; its final error severity decides whether the
//! run continues, fails, or is skipped. State is persisted after every
//! transition so a crashed or failed run can be resumed without re-running
//! completed stages. The notifications stage always runs last and never
//! changes the terminal status.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use super::result::PipelineResult;
use super::retry::with_retry;
use crate::config::PipelineConfig;
use crate::core::{PipelineStatus, StageName, StageOutput, StageRunStatus};
use crate::errors::{NexusError, Severity};
use crate::events::{EventKind, EventSink, NoOpEventSink, PipelineEvent};
use crate::incidents::{IncidentLogger, NewIncident};
use crate::observability::SpanTimer;
use crate::ports::{
    BudgetTracker, CostStatus, FailedTopic, InMemoryBudgetTracker, InMemoryTopicQueue, QueuedTopic, TopicQueue,
};
use crate::quality::QualityGate;
use crate::review::{ReviewQueue, StoredReviewQueue};
use crate::stages::{Stage, StageInput, StageRegistry};
use crate::state::{DocumentStore, InMemoryDocumentStore, PipelineState, SkipInfo, StageUpdate, StateStore};

const COMPONENT: &str = "orchestrator";

/// Provider name recorded when a queued topic stands in for news sourcing.
const TOPIC_QUEUE_PROVIDER: &str = "topic-queue";

/// How a pass over the stage list ended.
enum Outcome {
    Completed,
    Failed(NexusError),
    Skipped(StageName, NexusError),
    Paused(StageName),
}

/// Mutable state of one `execute_pipeline` / `resume_pipeline` call.
struct RunContext {
    pipeline_id: String,
    result: PipelineResult,
    outputs: BTreeMap<StageName, StageOutput>,
    previous_stage: Option<StageName>,
    last_attempted: Option<StageName>,
    data: Value,
    queued_topic: Option<QueuedTopic>,
    processing_queued_topic: bool,
    gate_cleared: bool,
    timer: SpanTimer,
}

impl RunContext {
    fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            result: PipelineResult::new(pipeline_id),
            outputs: BTreeMap::new(),
            previous_stage: None,
            last_attempted: None,
            data: Value::Null,
            queued_topic: None,
            processing_queued_topic: false,
            gate_cleared: false,
            timer: SpanTimer::start(format!("pipeline:{pipeline_id}")),
        }
    }

    /// Makes `output` the input of the next stage.
    fn accept(&mut self, stage: StageName, output: StageOutput) {
        self.result.record_stage(stage, &output);
        self.previous_stage = Some(stage);
        self.data = output.data.clone();
        self.outputs.insert(stage, output);
    }
}

/// Runs pipelines over a [`StageRegistry`] and its collaborators.
///
/// The executor holds no per-run state and can be shared. It does not lock
/// pipeline ids: callers must not run two invocations for the same id at
/// once.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    registry: StageRegistry,
    config: PipelineConfig,
    state: StateStore,
    quality_gate: QualityGate,
    review_queue: Arc<dyn ReviewQueue>,
    topic_queue: Arc<dyn TopicQueue>,
    budget: Arc<dyn BudgetTracker>,
    incidents: IncidentLogger,
    events: Arc<dyn EventSink>,
}

impl PipelineExecutor {
    /// Starts building an executor.
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// The executor configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The State Store runs are persisted to.
    #[must_use]
    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    /// The incident logger.
    #[must_use]
    pub fn incidents(&self) -> &IncidentLogger {
        &self.incidents
    }

    /// Runs a pipeline from the first stage.
    ///
    /// Returns `Err` only when the run could not be initialized. Stage
    /// failures are reported through the result's status.
    pub async fn execute_pipeline(&self, pipeline_id: &str) -> Result<PipelineResult, NexusError> {
        let span = tracing::info_span!("pipeline", pipeline_id);
        self.execute_inner(pipeline_id).instrument(span).await
    }

    /// Resumes a failed, skipped or paused pipeline.
    ///
    /// Without `from_stage` the run restarts at the earliest stage that is
    /// not completed; skipped stages run again. Stages before the resume point are not re-run; their
    /// persisted outputs are folded into the result.
    pub async fn resume_pipeline(&self, pipeline_id: &str, from_stage: Option<&str>) -> Result<PipelineResult, NexusError> {
        let span = tracing::info_span!("pipeline", pipeline_id, resume = true);
        self.resume_inner(pipeline_id, from_stage).instrument(span).await
    }

    async fn execute_inner(&self, pipeline_id: &str) -> Result<PipelineResult, NexusError> {
        self.state.initialize_pipeline(pipeline_id).await?;
        self.state.mark_running(pipeline_id).await?;
        info!("Pipeline started");
        self.emit(PipelineEvent::new(EventKind::PipelineStarted, pipeline_id)).await;

        let mut ctx = RunContext::new(pipeline_id);
        let outcome = match self.seed_from_queue(&mut ctx).await {
            Ok(true) => self.run_stages(&mut ctx, Some(StageName::Research)).await,
            Ok(false) => self.run_stages(&mut ctx, Some(StageName::NewsSourcing)).await,
            Err(err) => Outcome::Failed(err),
        };
        Ok(self.finalize(ctx, outcome).await)
    }

    async fn resume_inner(&self, pipeline_id: &str, from_stage: Option<&str>) -> Result<PipelineResult, NexusError> {
        let state = self.state.get_state(pipeline_id).await?;
        match state.status {
            PipelineStatus::Running => {
                return Err(guard_error("PIPELINE_ALREADY_RUNNING", pipeline_id, "is already running"));
            }
            PipelineStatus::Completed => {
                return Err(guard_error("PIPELINE_COMPLETED", pipeline_id, "has already completed"));
            }
            PipelineStatus::Pending => {
                return Err(guard_error("PIPELINE_NOT_RESUMABLE", pipeline_id, "has not started"));
            }
            PipelineStatus::Paused => self.ensure_reviews_cleared(pipeline_id).await?,
            PipelineStatus::Failed | PipelineStatus::Skipped => {}
        }

        let resume_point = match from_stage {
            Some(raw) => Some(parse_resume_stage(raw)?),
            None => state.first_incomplete_stage(),
        };

        let mut ctx = RunContext::new(pipeline_id);
        self.fold_finished(&mut ctx, &state, resume_point).await?;
        ctx.result.quality_context = state.quality_context.clone();
        ctx.result.quality_decision = state.quality_decision.clone();
        ctx.gate_cleared = state.status == PipelineStatus::Paused;
        ctx.processing_queued_topic = state.processing_queued_topic;
        if ctx.processing_queued_topic {
            ctx.queued_topic = match self.topic_queue.check_today_queued_topic(pipeline_id).await {
                Ok(topic) => topic,
                Err(err) => {
                    warn!(code = %err.code, error = %err, "Could not reload queued topic");
                    None
                }
            };
        }

        self.state.mark_running(pipeline_id).await?;
        info!(from_stage = ?resume_point, previous_status = %state.status, "Pipeline resumed");
        self.emit(PipelineEvent::new(EventKind::PipelineResumed, pipeline_id).with_data(json!({
            "fromStage": resume_point,
            "previousStatus": state.status,
        })))
        .await;

        let outcome = self.run_stages(&mut ctx, resume_point).await;
        Ok(self.finalize(ctx, outcome).await)
    }

    async fn ensure_reviews_cleared(&self, pipeline_id: &str) -> Result<(), NexusError> {
        let pending = match self.review_queue.get_pending_critical_items(pipeline_id).await {
            Ok(items) => items,
            Err(err) => {
                warn!(code = %err.code, error = %err, "Review queue check failed; treating as none pending");
                Vec::new()
            }
        };
        if pending.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = pending.iter().map(|item| item.id.as_str()).collect();
        Err(NexusError::critical(
            "PIPELINE_AWAITING_REVIEW",
            format!("{} critical review item(s) still pending", pending.len()),
            COMPONENT,
        )
        .with_context_entry("pipelineId", pipeline_id)
        .with_context_entry("reviewItemIds", ids))
    }

    /// Loads the outputs of every stage before `resume_point`.
    async fn fold_finished(
        &self,
        ctx: &mut RunContext,
        state: &PipelineState,
        resume_point: Option<StageName>,
    ) -> Result<(), NexusError> {
        let production = StageName::production_stages();
        let end = resume_point.map_or(production.len(), |s| s.index());

        for &stage in &production[..end] {
            let status = state.stage_status(stage);
            if status == StageRunStatus::Skipped {
                ctx.result.record_skipped(stage);
                continue;
            }
            match self.state.load_stage_output(&ctx.pipeline_id, stage).await? {
                Some(output) => ctx.accept(stage, output),
                None if status == StageRunStatus::Degraded => {
                    debug!(stage = %stage, "Degraded stage left no output");
                }
                None => warn!(stage = %stage, status = %status, "No persisted output before resume point"),
            }
        }
        Ok(())
    }

    /// Seeds the run from a previously queued topic. Returns true when
    /// news sourcing was replaced by the queued topic.
    async fn seed_from_queue(&self, ctx: &mut RunContext) -> Result<bool, NexusError> {
        let id = ctx.pipeline_id.clone();
        let queued = match self.topic_queue.check_today_queued_topic(&id).await {
            Ok(queued) => queued,
            Err(err) => {
                warn!(code = %err.code, error = %err, "Queued topic check failed; sourcing fresh");
                None
            }
        };
        let Some(queued) = queued else {
            return Ok(false);
        };

        if queued.retry_count >= self.config.queue_max_retries {
            info!(retry_count = queued.retry_count, "Queued topic out of retries; sourcing fresh");
            if let Err(err) = self.topic_queue.clear_queued_topic(&id).await {
                warn!(code = %err.code, error = %err, "Failed to clear exhausted queued topic");
            }
            return Ok(false);
        }

        let topic = match self.topic_queue.increment_retry_count(&id).await {
            Ok(Some(topic)) => topic,
            Ok(None) => {
                info!("Queued topic reported exhausted; sourcing fresh");
                return Ok(false);
            }
            Err(err) => {
                warn!(code = %err.code, error = %err, "Failed to claim queued topic; sourcing fresh");
                return Ok(false);
            }
        };

        let stage = StageName::NewsSourcing;
        let output = StageOutput::ok(topic.topic.clone(), TOPIC_QUEUE_PROVIDER);
        self.state.set_processing_queued_topic(&id, true).await?;
        self.state.persist_stage_output(&id, stage, &output).await?;
        self.state
            .update_stage_status(
                &id,
                stage,
                StageRunStatus::Completed,
                StageUpdate {
                    provider: Some(TOPIC_QUEUE_PROVIDER.to_string()),
                    tier: Some(output.provider.tier),
                    attempts: Some(1),
                    ..StageUpdate::new()
                },
            )
            .await?;

        info!(retry_count = topic.retry_count, original_date = %topic.original_date, "Seeded run from queued topic");
        self.emit(PipelineEvent::for_stage(EventKind::StageCompleted, id.as_str(), stage).with_data(json!({
            "provider": TOPIC_QUEUE_PROVIDER,
            "retryCount": topic.retry_count,
        })))
        .await;

        ctx.accept(stage, output);
        ctx.processing_queued_topic = true;
        ctx.queued_topic = Some(topic);
        Ok(true)
    }

    async fn run_stages(&self, ctx: &mut RunContext, start: Option<StageName>) -> Outcome {
        let Some(start) = start else {
            return Outcome::Completed;
        };
        let pause_stage = self.quality_gate.config().pause_before_stage;

        for &stage in StageName::production_stages().iter().skip(start.index()) {
            if stage == pause_stage && !ctx.gate_cleared {
                if let Some(paused_at) = self.quality_checkpoint(ctx, stage).await {
                    return Outcome::Paused(paused_at);
                }
            }

            let span = tracing::info_span!("stage", stage = %stage);
            match self.run_stage(ctx, stage).instrument(span).await {
                Ok(None) => {}
                Ok(Some(outcome)) => return outcome,
                Err(err) => {
                    error!(stage = %stage, code = %err.code, error = %err, "State persistence failed; aborting run");
                    return Outcome::Failed(err);
                }
            }
        }
        Outcome::Completed
    }

    /// Runs the quality gate. Returns the stage to pause before, if any.
    async fn quality_checkpoint(&self, ctx: &mut RunContext, stage: StageName) -> Option<StageName> {
        let id = ctx.pipeline_id.clone();
        let decision = self
            .quality_gate
            .check(&id, &ctx.outputs, &ctx.result.quality_context)
            .await;

        if let Err(err) = self.state.record_quality_decision(&id, &decision).await {
            warn!(code = %err.code, error = %err, "Failed to record quality decision in state");
        }
        self.emit(PipelineEvent::new(EventKind::QualityDecision, id.as_str()).with_data(json!({
            "decision": decision.decision,
            "reason": decision.reason,
            "reviewItemIds": decision.review_item_ids,
        })))
        .await;

        let pause = decision
            .requires_review()
            .then(|| decision.pause_before_stage.unwrap_or(stage));
        ctx.result.quality_decision = Some(decision);
        if pause.is_none() {
            ctx.gate_cleared = true;
        }
        pause
    }

    /// Runs one stage. `Ok(Some(_))` ends the run; `Err` is a persistence
    /// failure.
    async fn run_stage(&self, ctx: &mut RunContext, stage: StageName) -> Result<Option<Outcome>, NexusError> {
        let id = ctx.pipeline_id.clone();
        let runner = self.registry.get(stage)?;
        let config = self.config.stage_config(stage);

        self.state
            .update_stage_status(&id, stage, StageRunStatus::Running, StageUpdate::new())
            .await?;
        self.emit(PipelineEvent::for_stage(EventKind::StageStarted, id.as_str(), stage).with_data(json!({
            "previousStage": ctx.previous_stage,
        })))
        .await;
        ctx.last_attempted = Some(stage);

        let input = StageInput {
            pipeline_id: id.clone(),
            previous_stage: ctx.previous_stage,
            data: ctx.data.clone(),
            config: config.clone(),
            quality_context: ctx.result.quality_context.clone(),
        };
        let events = &self.events;
        let on_retry = |attempt: u32, delay: Duration, err: &NexusError| {
            events.try_emit(
                &PipelineEvent::for_stage(EventKind::StageRetry, id.as_str(), stage).with_data(json!({
                    "attempt": attempt,
                    "delayMs": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "code": err.code,
                })),
            );
        };

        let timer = SpanTimer::start(stage.as_str());
        let attempt = with_retry(
            || {
                let runner = runner.clone();
                let input = input.clone();
                async move { runner.execute(input).await }
            },
            &config.retry,
            Some(&on_retry),
        )
        .await;
        let elapsed = timer.finish();

        match attempt {
            Ok(retry) => {
                self.complete_stage(ctx, stage, retry.result, retry.attempts, elapsed)
                    .await?;
                Ok(None)
            }
            Err(err) => self.fail_stage(ctx, stage, err, elapsed).await,
        }
    }

    async fn complete_stage(
        &self,
        ctx: &mut RunContext,
        stage: StageName,
        mut output: StageOutput,
        attempts: u32,
        elapsed_ms: u64,
    ) -> Result<(), NexusError> {
        let id = ctx.pipeline_id.clone();
        if output.duration_ms == 0 {
            output.duration_ms = elapsed_ms;
        }

        let quality_context = &mut ctx.result.quality_context;
        if output.used_fallback() {
            quality_context.record_fallback(stage, &output.provider.name);
        }
        let status = if output.success {
            StageRunStatus::Completed
        } else {
            quality_context.record_degraded(stage);
            StageRunStatus::Degraded
        };
        for warning in &output.warnings {
            quality_context.add_flag(format!("{stage}:{warning}"));
        }

        self.state.persist_stage_output(&id, stage, &output).await?;
        self.state
            .update_stage_status(
                &id,
                stage,
                status,
                StageUpdate {
                    provider: Some(output.provider.name.clone()),
                    tier: Some(output.provider.tier),
                    attempts: Some(attempts),
                    duration_ms: Some(output.duration_ms),
                    cost: Some(output.cost),
                    error: None,
                },
            )
            .await?;
        self.state
            .update_retry_attempts(&id, stage, attempts.saturating_sub(1))
            .await?;

        let event_data = json!({
            "provider": output.provider.name,
            "tier": output.provider.tier,
            "attempts": attempts,
            "cost": output.cost,
            "durationMs": output.duration_ms,
        });
        info!(
            stage = %stage,
            status = %status,
            provider = %output.provider.name,
            tier = %output.provider.tier,
            attempts,
            duration_ms = output.duration_ms,
            "Stage finished"
        );

        ctx.accept(stage, output);
        self.state
            .update_quality_context(&id, &ctx.result.quality_context)
            .await?;
        self.state.update_total_cost(&id, ctx.result.total_cost).await?;

        let kind = if status == StageRunStatus::Degraded {
            EventKind::StageDegraded
        } else {
            EventKind::StageCompleted
        };
        self.emit(PipelineEvent::for_stage(kind, id.as_str(), stage).with_data(event_data))
            .await;
        Ok(())
    }

    async fn fail_stage(
        &self,
        ctx: &mut RunContext,
        stage: StageName,
        err: NexusError,
        elapsed_ms: u64,
    ) -> Result<Option<Outcome>, NexusError> {
        let id = ctx.pipeline_id.clone();
        let attempts = attempts_made(&err);
        let update = StageUpdate {
            attempts: Some(attempts),
            duration_ms: Some(elapsed_ms),
            ..StageUpdate::new()
        }
        .with_error(&err);
        self.state
            .update_retry_attempts(&id, stage, attempts.saturating_sub(1))
            .await?;
        let event_data = json!({
            "code": err.code,
            "message": err.message,
            "severity": err.severity,
        });

        match err.severity {
            Severity::Degraded => {
                warn!(stage = %stage, code = %err.code, "Stage degraded; continuing");
                ctx.result.quality_context.record_degraded(stage);
                self.state
                    .update_stage_status(&id, stage, StageRunStatus::Degraded, update)
                    .await?;
                self.state
                    .update_quality_context(&id, &ctx.result.quality_context)
                    .await?;
                self.log_incident(&id, &err).await;
                self.emit(PipelineEvent::for_stage(EventKind::StageDegraded, id.as_str(), stage).with_data(event_data))
                    .await;
                Ok(None)
            }
            severity if severity.aborts_pipeline() => {
                self.state
                    .update_stage_status(&id, stage, StageRunStatus::Failed, update)
                    .await?;
                self.emit(PipelineEvent::for_stage(EventKind::StageFailed, id.as_str(), stage).with_data(event_data))
                    .await;

                let exhausted = err.exhausted_retries() || err.indicates_fallback_exhaustion();
                if exhausted && self.config.is_critical_stage(stage) {
                    Ok(Some(Outcome::Skipped(stage, err)))
                } else {
                    Ok(Some(Outcome::Failed(err)))
                }
            }
            _ => {
                warn!(stage = %stage, code = %err.code, "Non-essential stage failed; skipping it");
                ctx.result.record_skipped(stage);
                self.state
                    .update_stage_status(&id, stage, StageRunStatus::Skipped, update)
                    .await?;
                self.log_incident(&id, &err).await;
                self.emit(PipelineEvent::for_stage(EventKind::StageSkipped, id.as_str(), stage).with_data(event_data))
                    .await;
                Ok(None)
            }
        }
    }

    async fn finalize(&self, mut ctx: RunContext, outcome: Outcome) -> PipelineResult {
        let id = ctx.pipeline_id.clone();

        match outcome {
            Outcome::Completed => {
                ctx.result.status = PipelineStatus::Completed;
                warn_on_error(self.state.mark_complete(&id).await, "mark pipeline completed");
                info!(
                    completed = ctx.result.completed_stages.len(),
                    skipped = ctx.result.skipped_stages.len(),
                    total_cost = ctx.result.total_cost,
                    "Pipeline completed"
                );
                self.emit(PipelineEvent::new(EventKind::PipelineCompleted, id.as_str()).with_data(json!({
                    "completedStages": ctx.result.completed_stages,
                    "skippedStages": ctx.result.skipped_stages,
                    "totalCost": ctx.result.total_cost,
                })))
                .await;
            }
            Outcome::Failed(err) => {
                ctx.result.status = PipelineStatus::Failed;
                ctx.result.error = Some(err.summary());
                warn_on_error(self.state.mark_failed(&id, &err).await, "mark pipeline failed");
                error!(stage = %err.stage, code = %err.code, error = %err, "Pipeline failed");
                self.log_incident(&id, &err).await;
                self.emit(PipelineEvent::new(EventKind::PipelineFailed, id.as_str()).with_data(json!({
                    "code": err.code,
                    "message": err.message,
                    "stage": err.stage,
                })))
                .await;
            }
            Outcome::Skipped(stage, err) => {
                ctx.result.status = PipelineStatus::Skipped;
                let mut info = SkipInfo::new(stage, err.message.clone());
                warn_on_error(
                    self.state.mark_skipped(&id, &err.message, stage).await,
                    "mark pipeline skipped",
                );
                self.log_incident(&id, &err).await;

                if let Some(date) = self.requeue_topic(&ctx, stage, &err).await {
                    warn_on_error(
                        self.state.record_topic_requeue(&id, &date).await,
                        "record topic re-queue",
                    );
                    info.topic_queued = true;
                    info.queued_for_date = Some(date);
                }

                warn!(
                    stage = %stage,
                    code = %err.code,
                    topic_queued = info.topic_queued,
                    queued_for_date = info.queued_for_date.as_deref().unwrap_or(""),
                    "Pipeline skipped"
                );
                self.emit(PipelineEvent::new(EventKind::PipelineSkipped, id.as_str()).with_data(json!(info)))
                    .await;
                ctx.result.skip_info = Some(info);
            }
            Outcome::Paused(stage) => {
                ctx.result.status = PipelineStatus::Paused;
                ctx.result.pause_before_stage = Some(stage);
                warn_on_error(self.state.mark_paused(&id, stage).await, "mark pipeline paused");
                let review_ids = ctx
                    .result
                    .quality_decision
                    .as_ref()
                    .map(|d| d.review_item_ids.clone())
                    .unwrap_or_default();
                info!(pause_before_stage = %stage, reviews = review_ids.len(), "Pipeline paused for human review");
                self.emit(PipelineEvent::new(EventKind::PipelinePaused, id.as_str()).with_data(json!({
                    "pauseBeforeStage": stage,
                    "reviewItemIds": review_ids,
                })))
                .await;
            }
        }

        if ctx.result.status.is_terminal() && ctx.processing_queued_topic {
            warn_on_error(self.topic_queue.clear_queued_topic(&id).await, "clear queued topic");
            warn_on_error(
                self.state.set_processing_queued_topic(&id, false).await,
                "reset queued topic marker",
            );
        }

        ctx.result.duration_ms = ctx.timer.elapsed_ms();
        self.notify(&mut ctx).await;
        self.track_budget(&ctx).await;

        ctx.result.duration_ms = ctx.timer.finish();
        ctx.result
    }

    /// Re-queues the run's topic after a skip. Returns the queued date.
    async fn requeue_topic(&self, ctx: &RunContext, stage: StageName, err: &NexusError) -> Option<String> {
        let (topic, retry_count) = if let Some(queued) = &ctx.queued_topic {
            (queued.topic.clone(), queued.retry_count)
        } else if let Some(sourced) = ctx.outputs.get(&StageName::NewsSourcing) {
            (sourced.data.clone(), 0)
        } else {
            debug!("No topic to re-queue");
            return None;
        };

        let failed = FailedTopic {
            topic,
            original_date: ctx.pipeline_id.clone(),
            failure_reason: err.message.clone(),
            failed_stage: stage,
            retry_count,
        };
        match self.topic_queue.queue_failed_topic(failed).await {
            Ok(date) => Some(date),
            Err(queue_err) => {
                warn!(code = %queue_err.code, error = %queue_err, "Failed to re-queue topic");
                None
            }
        }
    }

    /// Runs the notifications stage with the run's outcome. Never fails.
    async fn notify(&self, ctx: &mut RunContext) {
        let stage = StageName::Notifications;
        let id = ctx.pipeline_id.clone();
        let runner = match self.registry.get(stage) {
            Ok(runner) => runner,
            Err(err) => {
                warn!(code = %err.code, "No notifications stage registered");
                return;
            }
        };
        let payload = match serde_json::to_value(&ctx.result) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to serialize pipeline result for notifications");
                Value::Null
            }
        };
        let config = self.config.stage_config(stage);
        let input = StageInput {
            pipeline_id: id.clone(),
            previous_stage: ctx.last_attempted,
            data: payload,
            config: config.clone(),
            quality_context: ctx.result.quality_context.clone(),
        };

        warn_on_error(
            self.state
                .update_stage_status(&id, stage, StageRunStatus::Running, StageUpdate::new())
                .await,
            "mark notifications running",
        );
        let span = tracing::info_span!("stage", stage = %stage);
        let attempt = with_retry(
            || {
                let runner = runner.clone();
                let input = input.clone();
                async move { runner.execute(input).await }
            },
            &config.retry,
            None,
        )
        .instrument(span)
        .await;

        match attempt {
            Ok(retry) => {
                let output = retry.result;
                warn_on_error(
                    self.state.persist_stage_output(&id, stage, &output).await,
                    "persist notifications output",
                );
                warn_on_error(
                    self.state
                        .update_stage_status(
                            &id,
                            stage,
                            StageRunStatus::Completed,
                            StageUpdate {
                                provider: Some(output.provider.name.clone()),
                                tier: Some(output.provider.tier),
                                attempts: Some(retry.attempts),
                                duration_ms: Some(output.duration_ms),
                                cost: Some(output.cost),
                                error: None,
                            },
                        )
                        .await,
                    "mark notifications completed",
                );
                ctx.result.notifications = Some(output.data.clone());
                ctx.result.record_stage(stage, &output);
                warn_on_error(
                    self.state.update_total_cost(&id, ctx.result.total_cost).await,
                    "update total cost",
                );
                self.emit(PipelineEvent::for_stage(EventKind::StageCompleted, id.as_str(), stage)).await;
            }
            Err(err) => {
                warn!(code = %err.code, error = %err, "Notifications failed; terminal status unchanged");
                warn_on_error(
                    self.state
                        .update_stage_status(&id, stage, StageRunStatus::Failed, StageUpdate::new().with_error(&err))
                        .await,
                    "mark notifications failed",
                );
                self.emit(PipelineEvent::new(EventKind::NotificationsFailed, id.as_str()).with_data(json!({
                    "code": err.code,
                    "message": err.message,
                })))
                .await;
            }
        }
    }

    async fn track_budget(&self, ctx: &RunContext) {
        match self
            .budget
            .update_budget_spent(&ctx.pipeline_id, ctx.result.total_cost)
            .await
        {
            Ok(total) => debug!(run_cost = ctx.result.total_cost, total_spent = total, "Budget updated"),
            Err(err) => warn!(code = %err.code, error = %err, "Failed to update budget"),
        }
        match self.budget.check_cost_thresholds().await {
            Ok(CostStatus::Ok) => {}
            Ok(status) => warn!(status = %status, "Cost threshold reached"),
            Err(err) => warn!(code = %err.code, error = %err, "Failed to check cost thresholds"),
        }
    }

    async fn log_incident(&self, pipeline_id: &str, err: &NexusError) {
        if let Err(log_err) = self
            .incidents
            .log_incident(NewIncident::from_error(pipeline_id, err))
            .await
        {
            warn!(code = %log_err.code, error = %log_err, "Failed to log incident");
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        self.events.emit(&event).await;
    }
}

fn guard_error(code: &str, pipeline_id: &str, what: &str) -> NexusError {
    NexusError::critical(code, format!("Pipeline '{pipeline_id}' {what}"), COMPONENT)
        .with_context_entry("pipelineId", pipeline_id)
}

fn parse_resume_stage(raw: &str) -> Result<StageName, NexusError> {
    let stage: StageName = raw.parse()?;
    if stage == StageName::Notifications {
        return Err(NexusError::critical(
            "INVALID_STAGE",
            "Cannot resume from the notifications stage",
            COMPONENT,
        )
        .with_context_entry("stage", raw));
    }
    Ok(stage)
}

/// Calls made before `err` escaped: the retry count on exhaustion, else 1.
fn attempts_made(err: &NexusError) -> u32 {
    err.context
        .get("retryAttempts")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1)
}

fn warn_on_error(result: Result<(), NexusError>, action: &str) {
    if let Err(err) = result {
        warn!(action, code = %err.code, error = %err, "Side effect failed");
    }
}

/// Builds a [`PipelineExecutor`].
///
/// Collaborators left unset default to in-memory implementations sharing
/// one [`InMemoryDocumentStore`].
#[derive(Debug, Default)]
pub struct ExecutorBuilder {
    registry: StageRegistry,
    config: PipelineConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    review_queue: Option<Arc<dyn ReviewQueue>>,
    topic_queue: Option<Arc<dyn TopicQueue>>,
    budget: Option<Arc<dyn BudgetTracker>>,
    events: Option<Arc<dyn EventSink>>,
}

impl ExecutorBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stage registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.registry.register(stage);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the document store backing state, incidents and decisions.
    #[must_use]
    pub fn with_document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Sets the review queue.
    #[must_use]
    pub fn with_review_queue(mut self, review_queue: Arc<dyn ReviewQueue>) -> Self {
        self.review_queue = Some(review_queue);
        self
    }

    /// Sets the queued-topic backend.
    #[must_use]
    pub fn with_topic_queue(mut self, topic_queue: Arc<dyn TopicQueue>) -> Self {
        self.topic_queue = Some(topic_queue);
        self
    }

    /// Sets the budget backend.
    #[must_use]
    pub fn with_budget_tracker(mut self, budget: Arc<dyn BudgetTracker>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the registry and builds the executor.
    ///
    /// Fails with `STAGE_NOT_REGISTERED` if any stage lacks an implementation.
    pub fn build(self) -> Result<PipelineExecutor, NexusError> {
        self.registry.validate()?;

        let documents: Arc<dyn DocumentStore> = match self.documents {
            Some(documents) => documents,
            None => Arc::new(InMemoryDocumentStore::new()),
        };
        let review_queue: Arc<dyn ReviewQueue> = match self.review_queue {
            Some(queue) => queue,
            None => Arc::new(StoredReviewQueue::new(documents.clone())),
        };
        let topic_queue: Arc<dyn TopicQueue> = match self.topic_queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryTopicQueue::new(self.config.queue_max_retries)),
        };
        let budget: Arc<dyn BudgetTracker> = match self.budget {
            Some(budget) => budget,
            None => Arc::new(InMemoryBudgetTracker::default()),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(NoOpEventSink),
        };

        Ok(PipelineExecutor {
            quality_gate: QualityGate::new(review_queue.clone(), documents.clone(), self.config.quality.clone()),
            incidents: IncidentLogger::new(documents.clone()),
            state: StateStore::new(documents),
            registry: self.registry,
            config: self.config,
            review_queue,
            topic_queue,
            budget,
            events,
        })
    }
}
