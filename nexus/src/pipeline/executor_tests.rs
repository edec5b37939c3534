//! Scenario tests for the pipeline executor.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use crate::core::{PipelineStatus, ProviderInfo, StageName, StageOutput, StageRunStatus, STAGE_ORDER};
use crate::errors::NexusError;
use crate::events::EventKind;
use crate::incidents::IncidentSeverity;
use crate::notifications::NotificationsStage;
use crate::ports::{CostStatus, MockBudgetTracker, MockTopicQueue, QueuedTopic};
use crate::quality::QualityDecisionKind;
use crate::review::ReviewQueue;
use crate::testing::TestHarness;

const ID: &str = "2026-01-22";

fn transient(stage: StageName) -> NexusError {
    NexusError::retryable(format!("{}_RATE_LIMIT", stage.code_prefix()), "429 Too Many Requests", stage.as_str())
}

#[tokio::test]
async fn test_all_stages_succeed_in_order() {
    let harness = TestHarness::new();
    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.completed_stages, STAGE_ORDER.to_vec());
    assert!(result.skipped_stages.is_empty());
    assert!(result.error.is_none());

    for pair in STAGE_ORDER.windows(2) {
        let input = harness.stage(pair[1]).last_input().unwrap();
        assert_eq!(input.previous_stage, Some(pair[0]), "input of {}", pair[1]);
    }
    assert_eq!(harness.stage(StageName::NewsSourcing).last_input().unwrap().previous_stage, None);
    for stage in STAGE_ORDER {
        assert_eq!(harness.stage(stage).call_count(), 1, "{stage}");
    }

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
    assert!(state.end_time.is_some());
    assert_eq!(state.stage_status(StageName::Twitter), StageRunStatus::Completed);
    assert_eq!(state.stage_status(StageName::Notifications), StageRunStatus::Completed);

    let kinds = harness.events.kinds();
    assert_eq!(kinds.first(), Some(&EventKind::PipelineStarted));
    assert!(kinds.contains(&EventKind::QualityDecision));
    assert!(kinds.contains(&EventKind::PipelineCompleted));
    assert_eq!(harness.events.of_kind(EventKind::StageStarted).len(), 10);
}

#[tokio::test]
async fn test_stage_data_flows_forward() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Research)
        .push_ok(StageOutput::ok(json!({"brief": "Mixture of experts"}), "gemini"));

    harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    let input = harness.stage(StageName::ScriptGen).last_input().unwrap();
    assert_eq!(input.data, json!({"brief": "Mixture of experts"}));
}

#[tokio::test]
async fn test_tts_fallback_recorded_in_quality_context() {
    let harness = TestHarness::new();
    harness.stage(StageName::Tts).push_ok(
        StageOutput::ok(json!({"audioUrl": "gs://audio.wav"}), "gemini-tts")
            .with_provider(ProviderInfo::fallback("chirp3-hd", 2)),
    );

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(result.quality_context.fallbacks_used.contains(&"tts:chirp3-hd".to_string()));
    assert_eq!(
        result.quality_decision.unwrap().decision,
        QualityDecisionKind::AutoPublishWithWarning
    );

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.quality_context.fallbacks_used, vec!["tts:chirp3-hd"]);
    assert_eq!(state.stages[&StageName::Tts].provider.as_deref(), Some("chirp3-hd"));
}

#[tokio::test]
async fn test_research_retries_then_succeeds() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Research)
        .push_err(transient(StageName::Research))
        .push_err(transient(StageName::Research));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(harness.stage(StageName::Research).call_count(), 3);
    assert_eq!(harness.events.of_kind(EventKind::StageRetry).len(), 2);

    let state = harness.state_store().get_state(ID).await.unwrap();
    let research = &state.stages[&StageName::Research];
    assert_eq!(research.retry_attempts, 2);
    assert_eq!(research.attempts, Some(3));
}

#[tokio::test]
async fn test_recoverable_twitter_failure_is_skipped() {
    let harness = TestHarness::new();
    harness.stage(StageName::Twitter).always_fail(NexusError::recoverable(
        "TWITTER_POST_FAILED",
        "duplicate status",
        "twitter",
    ));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.skipped_stages, vec![StageName::Twitter]);
    assert!(!result.completed(StageName::Twitter));
    assert_eq!(harness.stage(StageName::Twitter).call_count(), 1);
    assert_eq!(
        harness.stage(StageName::Notifications).last_input().unwrap().previous_stage,
        Some(StageName::Twitter)
    );

    let incidents = harness.incidents().get_open_incidents().await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, IncidentSeverity::Recoverable);
    assert_eq!(incidents[0].stage, "twitter");
}

#[tokio::test]
async fn test_tts_retry_exhaustion_skips_pipeline_and_requeues_topic() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::NewsSourcing)
        .push_ok(StageOutput::ok(json!({"title": "Sparse attention"}), "hacker-news"));
    harness.stage(StageName::Tts).always_fail(transient(StageName::Tts));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Skipped);
    assert_eq!(harness.stage(StageName::Tts).call_count(), 4);
    assert_eq!(harness.stage(StageName::VisualGen).call_count(), 0);

    let skip = result.skip_info.unwrap();
    assert_eq!(skip.stage, StageName::Tts);
    assert_eq!(skip.reason, "429 Too Many Requests");
    assert!(skip.topic_queued);
    assert_eq!(skip.queued_for_date.as_deref(), Some("2026-01-23"));

    let queued = harness.topic_queue.get("2026-01-23").unwrap();
    assert_eq!(queued.topic, json!({"title": "Sparse attention"}));
    assert_eq!(queued.retry_count, 0);
    assert_eq!(queued.failed_stage, Some(StageName::Tts));

    let notified = harness.stage(StageName::Notifications).last_input().unwrap();
    assert_eq!(notified.data["status"], "skipped");
    assert_eq!(notified.data["skipInfo"]["stage"], "tts");

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Skipped);
    assert!(state.skip_info.unwrap().topic_queued);
    assert_eq!(state.stages[&StageName::Tts].retry_attempts, 3);
}

#[tokio::test]
async fn test_fallback_exhaustion_on_critical_stage_skips() {
    let harness = TestHarness::new();
    harness.stage(StageName::VisualGen).always_fail(NexusError::critical(
        "FALLBACK_EXHAUSTED",
        "All 2 providers failed",
        "visual-gen",
    ));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Skipped);
    assert_eq!(harness.stage(StageName::VisualGen).call_count(), 1);
    assert_eq!(result.skip_info.unwrap().stage, StageName::VisualGen);
}

#[tokio::test]
async fn test_critical_non_exhaustion_error_fails_pipeline() {
    let harness = TestHarness::new();
    harness.stage(StageName::ScriptGen).always_fail(NexusError::critical(
        "SCRIPT_INVALID_INPUT",
        "research brief is empty",
        "script-gen",
    ));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.code, "SCRIPT_INVALID_INPUT");
    assert_eq!(error.stage.as_deref(), Some("script-gen"));
    assert!(result.skip_info.is_none());
    assert_eq!(harness.stage(StageName::Pronunciation).call_count(), 0);
    assert_eq!(harness.stage(StageName::Notifications).call_count(), 1);

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.error.as_ref().unwrap().code, "SCRIPT_INVALID_INPUT");
    assert_eq!(state.stage_status(StageName::ScriptGen), StageRunStatus::Failed);

    let incidents = harness.incidents().get_open_incidents().await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, IncidentSeverity::Critical);
    assert!(incidents[0].post_mortem.is_some());
    assert!(harness.topic_queue.is_empty());
}

#[tokio::test]
async fn test_exhaustion_on_non_critical_stage_fails() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Pronunciation)
        .always_fail(transient(StageName::Pronunciation));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.error.unwrap().code, "PRONUNCIATION_RATE_LIMIT");
}

#[tokio::test]
async fn test_degraded_error_continues() {
    let harness = TestHarness::new();
    harness.stage(StageName::VisualGen).always_fail(NexusError::degraded(
        "VISUAL_PARTIAL",
        "2 of 9 scenes used stock footage",
        "visual-gen",
    ));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.quality_context.degraded_stages, vec!["visual-gen"]);
    assert!(!result.completed(StageName::VisualGen));
    assert_eq!(
        harness.stage(StageName::Render).last_input().unwrap().previous_stage,
        Some(StageName::Tts)
    );
    assert_eq!(harness.events.of_kind(EventKind::StageDegraded).len(), 1);

    let incidents = harness.incidents().get_open_incidents().await.unwrap();
    assert_eq!(incidents[0].severity, IncidentSeverity::Warning);
}

#[tokio::test]
async fn test_unsuccessful_output_counts_as_degraded() {
    let harness = TestHarness::new();
    harness.stage(StageName::Thumbnail).push_ok(
        StageOutput::ok(json!({"variants": 1}), "imagen")
            .partial()
            .with_warning("low contrast"),
    );

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert!(result.completed(StageName::Thumbnail));
    assert_eq!(result.quality_context.degraded_stages, vec!["thumbnail"]);
    assert_eq!(result.quality_context.flags, vec!["thumbnail:low contrast"]);
    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.stage_status(StageName::Thumbnail), StageRunStatus::Degraded);
}

#[tokio::test]
async fn test_human_review_pauses_before_youtube_until_resolved() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::ScriptGen)
        .push_ok(StageOutput::ok(json!({"script": "..."}), "gemini").partial());
    let executor = harness.executor().unwrap();

    let paused = executor.execute_pipeline(ID).await.unwrap();
    assert_eq!(paused.status, PipelineStatus::Paused);
    assert_eq!(paused.pause_before_stage, Some(StageName::Youtube));
    assert_eq!(harness.stage(StageName::Youtube).call_count(), 0);
    assert_eq!(harness.stage(StageName::Notifications).call_count(), 1);

    let decision = paused.quality_decision.unwrap();
    assert_eq!(decision.decision, QualityDecisionKind::HumanReview);
    assert_eq!(decision.review_item_ids.len(), 1);

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Paused);
    assert_eq!(state.pause_before_stage, Some(StageName::Youtube));

    let blocked = executor.resume_pipeline(ID, None).await.unwrap_err();
    assert_eq!(blocked.code, "PIPELINE_AWAITING_REVIEW");

    harness
        .review_queue
        .resolve_review_item(&decision.review_item_ids[0], "approved", "editor")
        .await
        .unwrap();
    let resumed = executor.resume_pipeline(ID, None).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert_eq!(resumed.completed_stages, STAGE_ORDER.to_vec());
    assert_eq!(harness.stage(StageName::ScriptGen).call_count(), 1);
    assert_eq!(harness.stage(StageName::Thumbnail).call_count(), 1);
    assert_eq!(harness.stage(StageName::Youtube).call_count(), 1);
    assert_eq!(harness.stage(StageName::Notifications).call_count(), 2);
    assert_eq!(harness.events.of_kind(EventKind::QualityDecision).len(), 1);
    assert_eq!(resumed.quality_context.degraded_stages, vec!["script-gen"]);
}

#[tokio::test]
async fn test_resume_after_failure_skips_completed_stages() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::ScriptGen)
        .push_err(NexusError::critical("SCRIPT_MODEL_ERROR", "safety block", "script-gen"));
    let executor = harness.executor().unwrap();

    let failed = executor.execute_pipeline(ID).await.unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);

    let resumed = executor.resume_pipeline(ID, None).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert_eq!(resumed.completed_stages, STAGE_ORDER.to_vec());
    assert_eq!(harness.stage(StageName::NewsSourcing).call_count(), 1);
    assert_eq!(harness.stage(StageName::Research).call_count(), 1);
    assert_eq!(harness.stage(StageName::ScriptGen).call_count(), 2);
    assert_eq!(harness.stage(StageName::Pronunciation).call_count(), 1);
    assert_eq!(
        harness.stage(StageName::ScriptGen).last_input().unwrap().previous_stage,
        Some(StageName::Research)
    );
    assert!(harness.events.kinds().contains(&EventKind::PipelineResumed));
}

#[tokio::test]
async fn test_resume_reruns_skipped_stage_before_failure() {
    let harness = TestHarness::new();
    harness.stage(StageName::Pronunciation).push_err(NexusError::recoverable(
        "PRONUNCIATION_LEXICON_UNAVAILABLE",
        "lexicon service returned 503",
        "pronunciation",
    ));
    harness
        .stage(StageName::Render)
        .push_err(NexusError::critical("RENDER_CRASHED", "ffmpeg exited 1", "render"));
    let executor = harness.executor().unwrap();

    let failed = executor.execute_pipeline(ID).await.unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(failed.skipped_stages, vec![StageName::Pronunciation]);

    let resumed = executor.resume_pipeline(ID, None).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert!(resumed.skipped_stages.is_empty());
    assert_eq!(resumed.completed_stages, STAGE_ORDER.to_vec());
    assert_eq!(harness.stage(StageName::ScriptGen).call_count(), 1);
    for stage in [StageName::Pronunciation, StageName::Tts, StageName::VisualGen, StageName::Render] {
        assert_eq!(harness.stage(stage).call_count(), 2, "{stage}");
    }
    assert_eq!(
        harness.stage(StageName::Pronunciation).last_input().unwrap().previous_stage,
        Some(StageName::ScriptGen)
    );

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.stage_status(StageName::Pronunciation), StageRunStatus::Completed);
}

#[tokio::test]
async fn test_rerun_fallback_stage_is_counted_once() {
    let harness = TestHarness::new();
    harness.stage(StageName::Tts).set_default(Ok(
        StageOutput::ok(json!({}), "gemini-tts").with_provider(ProviderInfo::fallback("chirp3-hd", 2)),
    ));
    harness
        .stage(StageName::Youtube)
        .push_err(NexusError::critical("YOUTUBE_UPLOAD_REJECTED", "invalid metadata", "youtube"));
    let executor = harness.executor().unwrap();

    assert_eq!(executor.execute_pipeline(ID).await.unwrap().status, PipelineStatus::Failed);
    let resumed = executor.resume_pipeline(ID, Some("tts")).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert_eq!(harness.stage(StageName::Tts).call_count(), 2);
    assert_eq!(resumed.quality_context.fallbacks_used, vec!["tts:chirp3-hd"]);
}

#[tokio::test]
async fn test_resume_from_explicit_stage() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Tts)
        .push_ok(StageOutput::ok(json!({}), "gemini-tts").with_provider(ProviderInfo::fallback("chirp3-hd", 2)));
    harness
        .stage(StageName::Youtube)
        .push_err(NexusError::critical("YOUTUBE_UPLOAD_REJECTED", "invalid metadata", "youtube"));
    let executor = harness.executor().unwrap();

    let failed = executor.execute_pipeline(ID).await.unwrap();
    assert_eq!(failed.status, PipelineStatus::Failed);

    let resumed = executor.resume_pipeline(ID, Some("tts")).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    for stage in [
        StageName::NewsSourcing,
        StageName::Research,
        StageName::ScriptGen,
        StageName::Pronunciation,
    ] {
        assert_eq!(harness.stage(stage).call_count(), 1, "{stage} re-run");
    }
    for stage in [StageName::Tts, StageName::VisualGen, StageName::Render, StageName::Thumbnail] {
        assert_eq!(harness.stage(stage).call_count(), 2, "{stage} not re-run");
    }
    assert_eq!(harness.stage(StageName::Youtube).call_count(), 2);
    assert_eq!(harness.stage(StageName::Twitter).call_count(), 1);
    assert_eq!(
        harness.stage(StageName::Tts).last_input().unwrap().previous_stage,
        Some(StageName::Pronunciation)
    );
}

#[tokio::test]
async fn test_resume_restores_quality_context() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Tts)
        .push_ok(StageOutput::ok(json!({}), "gemini-tts").with_provider(ProviderInfo::fallback("chirp3-hd", 2)));
    harness
        .stage(StageName::Twitter)
        .push_err(NexusError::critical("TWITTER_AUTH", "token revoked", "twitter"));
    let executor = harness.executor().unwrap();

    assert_eq!(executor.execute_pipeline(ID).await.unwrap().status, PipelineStatus::Failed);
    let resumed = executor.resume_pipeline(ID, None).await.unwrap();

    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert_eq!(resumed.quality_context.fallbacks_used, vec!["tts:chirp3-hd"]);
    assert_eq!(harness.stage(StageName::Tts).call_count(), 1);
    assert_eq!(harness.stage(StageName::Twitter).call_count(), 2);
    assert_eq!(resumed.stage_providers[&StageName::Tts].name, "chirp3-hd");
}

#[tokio::test]
async fn test_resume_guards() {
    let harness = TestHarness::new();
    let executor = harness.executor().unwrap();

    let missing = executor.resume_pipeline("nope", None).await.unwrap_err();
    assert_eq!(missing.code, "PIPELINE_NOT_FOUND");

    harness.state_store().initialize_pipeline("pending").await.unwrap();
    let pending = executor.resume_pipeline("pending", None).await.unwrap_err();
    assert_eq!(pending.code, "PIPELINE_NOT_RESUMABLE");

    harness.state_store().initialize_pipeline("running").await.unwrap();
    harness.state_store().mark_running("running").await.unwrap();
    let running = executor.resume_pipeline("running", None).await.unwrap_err();
    assert_eq!(running.code, "PIPELINE_ALREADY_RUNNING");

    executor.execute_pipeline(ID).await.unwrap();
    let completed = executor.resume_pipeline(ID, None).await.unwrap_err();
    assert_eq!(completed.code, "PIPELINE_COMPLETED");
}

#[tokio::test]
async fn test_resume_rejects_unknown_and_terminal_stage() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::Render)
        .push_err(NexusError::critical("RENDER_CRASHED", "ffmpeg exited 1", "render"));
    let executor = harness.executor().unwrap();
    executor.execute_pipeline(ID).await.unwrap();

    let unknown = executor.resume_pipeline(ID, Some("mastering")).await.unwrap_err();
    assert_eq!(unknown.code, "INVALID_STAGE");
    let terminal = executor.resume_pipeline(ID, Some("notifications")).await.unwrap_err();
    assert_eq!(terminal.code, "INVALID_STAGE");

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
}

#[tokio::test]
async fn test_queued_topic_seeds_run() {
    let harness = TestHarness::new();
    harness
        .topic_queue
        .insert(ID, QueuedTopic::new(json!({"title": "Queued topic"}), "2026-01-21"));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(harness.stage(StageName::NewsSourcing).call_count(), 0);
    assert_eq!(result.stage_providers[&StageName::NewsSourcing].name, "topic-queue");
    assert_eq!(result.completed_stages, STAGE_ORDER.to_vec());

    let research = harness.stage(StageName::Research).last_input().unwrap();
    assert_eq!(research.previous_stage, Some(StageName::NewsSourcing));
    assert_eq!(research.data, json!({"title": "Queued topic"}));

    assert!(harness.topic_queue.get(ID).is_none());
    let state = harness.state_store().get_state(ID).await.unwrap();
    assert!(!state.processing_queued_topic);
}

#[tokio::test]
async fn test_exhausted_queued_topic_is_cleared() {
    let harness = TestHarness::new();
    harness.topic_queue.insert(
        ID,
        QueuedTopic::new(json!({"title": "Stale"}), "2026-01-20").with_retry_count(2),
    );

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(harness.stage(StageName::NewsSourcing).call_count(), 1);
    assert!(harness.topic_queue.is_empty());
}

#[tokio::test]
async fn test_queued_topic_requeued_with_retry_count() {
    let harness = TestHarness::new();
    harness
        .topic_queue
        .insert(ID, QueuedTopic::new(json!({"title": "Queued topic"}), "2026-01-21"));
    harness.stage(StageName::Render).always_fail(
        NexusError::critical("RENDER_ALL_PROVIDERS_FAILED", "All 2 providers failed", "render"),
    );

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Skipped);
    let skip = result.skip_info.unwrap();
    assert!(skip.topic_queued);
    assert_eq!(skip.queued_for_date.as_deref(), Some("2026-01-23"));

    let requeued = harness.topic_queue.get("2026-01-23").unwrap();
    assert_eq!(requeued.retry_count, 1);
    assert_eq!(requeued.topic, json!({"title": "Queued topic"}));
    assert!(harness.topic_queue.get(ID).is_none());
}

#[tokio::test]
async fn test_topic_queue_outage_sources_fresh() {
    let harness = TestHarness::new();
    let mut queue = MockTopicQueue::new();
    queue
        .expect_check_today_queued_topic()
        .times(1)
        .returning(|_| Err(NexusError::critical("QUEUE_UNAVAILABLE", "firestore down", "topic-queue")));

    let executor = harness.builder().with_topic_queue(Arc::new(queue)).build().unwrap();
    let result = executor.execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(harness.stage(StageName::NewsSourcing).call_count(), 1);
}

#[tokio::test]
async fn test_notifications_failure_keeps_terminal_status() {
    let harness = TestHarness::new();
    harness.stage(StageName::Notifications).always_fail(NexusError::critical(
        "NOTIFY_CRASH",
        "smtp refused",
        "notifications",
    ));

    let result = harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(result.notifications.is_none());
    assert!(!result.completed(StageName::Notifications));
    assert_eq!(harness.events.of_kind(EventKind::NotificationsFailed).len(), 1);

    let state = harness.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_real_notifications_stage_reports_channels() {
    let harness = TestHarness::new();
    let executor = harness
        .builder()
        .with_stage(Arc::new(NotificationsStage::default()))
        .build()
        .unwrap();

    let result = executor.execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.notifications.unwrap()["channels"]["log"]["sent"], true);
    assert_eq!(
        result.stage_quality[&StageName::Notifications].get("notificationsSent"),
        Some(1.0)
    );
}

#[tokio::test]
async fn test_costs_reported_to_budget() {
    let harness = TestHarness::new();
    harness
        .stage(StageName::ScriptGen)
        .push_ok(StageOutput::ok(json!({}), "gemini").with_cost(0.5));
    harness
        .stage(StageName::Tts)
        .push_ok(StageOutput::ok(json!({}), "gemini-tts").with_cost(1.0));

    let mut budget = MockBudgetTracker::new();
    budget
        .expect_update_budget_spent()
        .withf(|id, amount| id == ID && (amount - 1.5).abs() < 1e-9)
        .times(1)
        .returning(|_, amount| Ok(amount));
    budget
        .expect_check_cost_thresholds()
        .times(1)
        .returning(|| Ok(CostStatus::Warning));

    let executor = harness.builder().with_budget_tracker(Arc::new(budget)).build().unwrap();
    let result = executor.execute_pipeline(ID).await.unwrap();

    assert!((result.total_cost - 1.5).abs() < 1e-9);
    assert_eq!(result.stage_costs[&StageName::Tts], 1.0);
    let state = harness.state_store().get_state(ID).await.unwrap();
    assert!((state.total_cost - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_budget_outage_is_swallowed() {
    let harness = TestHarness::new();
    let mut budget = MockBudgetTracker::new();
    budget
        .expect_update_budget_spent()
        .returning(|_, _| Err(NexusError::critical("BUDGET_UNAVAILABLE", "down", "budget")));
    budget
        .expect_check_cost_thresholds()
        .returning(|| Err(NexusError::critical("BUDGET_UNAVAILABLE", "down", "budget")));

    let executor = harness.builder().with_budget_tracker(Arc::new(budget)).build().unwrap();
    assert_eq!(executor.execute_pipeline(ID).await.unwrap().status, PipelineStatus::Completed);
}

#[tokio::test]
async fn test_build_requires_every_stage() {
    let err = crate::pipeline::PipelineExecutor::builder().build().unwrap_err();
    assert_eq!(err.code, "STAGE_NOT_REGISTERED");
}

#[tokio::test]
async fn test_stage_outputs_are_persisted() {
    let harness = TestHarness::new();
    harness.executor().unwrap().execute_pipeline(ID).await.unwrap();

    let store = harness.state_store();
    for stage in STAGE_ORDER {
        let output = store.load_stage_output(ID, stage).await.unwrap();
        assert!(output.is_some(), "{stage} output missing");
    }
    assert_eq!(harness.budget.spent_by(ID), Some(0.0));
}

#[tokio::test]
async fn test_persistence_failure_fails_run() {
    let harness = TestHarness::new();
    let outputs = crate::state::outputs_collection(ID);
    let documents = Arc::new(crate::testing::FlakyDocumentStore::failing_writes_to(&[outputs.as_str()]));

    let executor = harness.builder().with_document_store(documents.clone()).build().unwrap();
    let result = executor.execute_pipeline(ID).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert_eq!(result.error.unwrap().code, "STORE_IO_ERROR");
    assert_eq!(harness.stage(StageName::NewsSourcing).call_count(), 1);
    assert_eq!(harness.stage(StageName::Research).call_count(), 0);

    let state = executor.state_store().get_state(ID).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(documents.inner().count("incidents"), 1);
}
