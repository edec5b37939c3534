//! The quality gate checkpoint.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::rules::evaluate_issues;
use super::{QualityDecision, QualityDecisionKind, QualityGateConfig, QualityGateMetrics, QualityIssue};
use crate::core::{QualityContext, StageName, StageOutput};
use crate::review::{ReviewItem, ReviewItemType, ReviewQueue, ReviewRequest};
use crate::state::DocumentStore;

/// Collection holding persisted decisions, keyed by pipeline id.
pub const QUALITY_DECISIONS_COLLECTION: &str = "quality-decisions";

/// Decides whether a run may publish.
#[derive(Debug, Clone)]
pub struct QualityGate {
    review_queue: Arc<dyn ReviewQueue>,
    store: Arc<dyn DocumentStore>,
    config: QualityGateConfig,
}

impl QualityGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(review_queue: Arc<dyn ReviewQueue>, store: Arc<dyn DocumentStore>, config: QualityGateConfig) -> Self {
        Self {
            review_queue,
            store,
            config,
        }
    }

    /// Returns the gate configuration.
    #[must_use]
    pub fn config(&self) -> &QualityGateConfig {
        &self.config
    }

    /// Runs the checkpoint. Never fails: review-queue and persistence
    /// problems are logged and do not change the outcome.
    pub async fn check(
        &self,
        pipeline_id: &str,
        stage_outputs: &BTreeMap<StageName, StageOutput>,
        quality_context: &QualityContext,
    ) -> QualityDecision {
        let pending = match self.review_queue.get_pending_critical_items(pipeline_id).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(pipeline_id, code = %err.code, error = %err, "Review queue check failed; treating as none pending");
                Vec::new()
            }
        };

        let decision = if pending.is_empty() {
            self.decide(pipeline_id, stage_outputs, quality_context).await
        } else {
            self.pending_review_decision(&pending, quality_context)
        };

        tracing::info!(
            pipeline_id,
            decision = %decision.decision,
            issues = decision.issues.len(),
            reason = %decision.reason,
            "Quality gate decision"
        );

        self.persist(pipeline_id, &decision).await;
        decision
    }

    fn pending_review_decision(&self, pending: &[ReviewItem], quality_context: &QualityContext) -> QualityDecision {
        let issues: Vec<QualityIssue> = pending
            .iter()
            .map(|item| {
                QualityIssue::major(
                    Some(item.stage.clone()),
                    "PENDING_REVIEW",
                    format!("Pending {} review from {} stage", item.item_type, item.stage),
                )
            })
            .collect();

        QualityDecision {
            decision: QualityDecisionKind::HumanReview,
            reason: format!("{} pending critical review item(s)", pending.len()),
            metrics: metrics(&issues, quality_context, pending.len()),
            issues,
            review_item_ids: pending.iter().map(|item| item.id.clone()).collect(),
            pause_before_stage: Some(self.config.pause_before_stage),
            core_decision: None,
            timestamp: Utc::now(),
        }
    }

    async fn decide(
        &self,
        pipeline_id: &str,
        stage_outputs: &BTreeMap<StageName, StageOutput>,
        quality_context: &QualityContext,
    ) -> QualityDecision {
        let issues = evaluate_issues(&self.config, stage_outputs, quality_context);
        let metrics = metrics(&issues, quality_context, 0);

        let (kind, reason) = if issues.is_empty() {
            (QualityDecisionKind::AutoPublish, "All quality checks passed".to_string())
        } else if metrics.major_issues == 0 {
            (
                QualityDecisionKind::AutoPublishWithWarning,
                format!("{} minor issue(s) found", metrics.minor_issues),
            )
        } else {
            (
                QualityDecisionKind::HumanReview,
                format!("{} major issue(s) require human review", metrics.major_issues),
            )
        };

        let mut decision = QualityDecision {
            decision: kind,
            reason,
            issues,
            review_item_ids: Vec::new(),
            pause_before_stage: None,
            metrics,
            core_decision: Some(kind),
            timestamp: Utc::now(),
        };

        if kind == QualityDecisionKind::HumanReview {
            decision.pause_before_stage = Some(self.config.pause_before_stage);
            let request = ReviewRequest::new(ReviewItemType::Quality, pipeline_id, "quality-gate")
                .with_item(json!({ "issues": decision.issues }))
                .with_context(json!({ "metrics": decision.metrics, "qualityContext": quality_context }));
            match self.review_queue.add_to_review_queue(request).await {
                Ok(id) => decision.review_item_ids.push(id),
                Err(err) => {
                    tracing::warn!(pipeline_id, code = %err.code, error = %err, "Failed to create quality review item");
                }
            }
        }

        decision
    }

    async fn persist(&self, pipeline_id: &str, decision: &QualityDecision) {
        let result = match serde_json::to_value(decision) {
            Ok(doc) => self.store.set(QUALITY_DECISIONS_COLLECTION, pipeline_id, doc).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            tracing::warn!(pipeline_id, code = %err.code, error = %err, "Failed to persist quality decision");
        }
    }
}

fn metrics(issues: &[QualityIssue], quality_context: &QualityContext, pending_reviews: usize) -> QualityGateMetrics {
    let major_issues = issues.iter().filter(|i| i.is_major()).count();
    QualityGateMetrics {
        total_issues: issues.len(),
        major_issues,
        minor_issues: issues.len() - major_issues,
        fallback_count: quality_context.fallbacks_used.len(),
        degraded_count: quality_context.degraded_stages.len(),
        flag_count: quality_context.flags.len(),
        pending_reviews,
    }
}
