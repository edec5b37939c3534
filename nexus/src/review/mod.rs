//! Human review queue.
//!
//! Stages and the quality gate raise [`ReviewItem`]s when automated checks
//! are inconclusive. Items of a critical type block publication of their
//! pipeline until an operator resolves or dismisses them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use crate::errors::NexusError;
use crate::state::{DocumentStore, Filter};

/// Collection holding review items.
pub const REVIEW_COLLECTION: &str = "review-queue";

const COMPONENT: &str = "review-queue";

/// Kind of review requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewItemType {
    /// Uncertain pronunciation of a term.
    Pronunciation,
    /// Quality gate found major issues.
    Quality,
    /// Potentially controversial content.
    Controversial,
    /// Topic selection needs a human call.
    Topic,
    /// Compliance concern.
    Compliance,
}

impl ReviewItemType {
    /// Types that block publication while pending.
    pub const CRITICAL: [Self; 3] = [Self::Quality, Self::Controversial, Self::Compliance];

    /// Returns true if a pending item of this type blocks publication.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pronunciation => "pronunciation",
            Self::Quality => "quality",
            Self::Controversial => "controversial",
            Self::Topic => "topic",
            Self::Compliance => "compliance",
        }
    }
}

impl fmt::Display for ReviewItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Awaiting an operator.
    #[default]
    Pending,
    /// Acted upon.
    Resolved,
    /// Closed without action.
    Dismissed,
}

/// A queued review item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    /// Item id (uuid v4).
    pub id: String,
    /// Kind of review.
    #[serde(rename = "type")]
    pub item_type: ReviewItemType,
    /// Pipeline the item belongs to.
    pub pipeline_id: String,
    /// Stage or component that raised the item.
    pub stage: String,
    /// Current status.
    pub status: ReviewStatus,
    /// The thing under review.
    #[serde(default)]
    pub item: Value,
    /// Supporting context.
    #[serde(default)]
    pub context: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Operator's resolution or dismissal reason.
    #[serde(default)]
    pub resolution: Option<String>,
    /// When the item was closed.
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who closed it.
    #[serde(default)]
    pub resolved_by: Option<String>,
}

/// Request to enqueue a review item.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    /// Kind of review.
    pub item_type: ReviewItemType,
    /// Pipeline the item belongs to.
    pub pipeline_id: String,
    /// Stage or component raising it.
    pub stage: String,
    /// The thing under review.
    pub item: Value,
    /// Supporting context.
    pub context: Value,
}

impl ReviewRequest {
    /// Creates a request with empty item and context.
    #[must_use]
    pub fn new(item_type: ReviewItemType, pipeline_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            item_type,
            pipeline_id: pipeline_id.into(),
            stage: stage.into(),
            item: Value::Null,
            context: Value::Null,
        }
    }

    /// Sets the item under review.
    #[must_use]
    pub fn with_item(mut self, item: Value) -> Self {
        self.item = item;
        self
    }

    /// Sets the supporting context.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Review queue backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewQueue: Send + Sync + Debug {
    /// Enqueues an item and returns its id.
    async fn add_to_review_queue(&self, request: ReviewRequest) -> Result<String, NexusError>;

    /// Reads an item.
    async fn get_review_item(&self, id: &str) -> Result<Option<ReviewItem>, NexusError>;

    /// Pending items of a critical type for a pipeline, oldest first.
    async fn get_pending_critical_items(&self, pipeline_id: &str) -> Result<Vec<ReviewItem>, NexusError>;

    /// Resolves a pending item.
    async fn resolve_review_item(&self, id: &str, resolution: &str, resolved_by: &str) -> Result<(), NexusError>;

    /// Dismisses a pending item.
    async fn dismiss_review_item(&self, id: &str, reason: &str, dismissed_by: &str) -> Result<(), NexusError>;
}

/// [`ReviewQueue`] persisted in a [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct StoredReviewQueue {
    store: Arc<dyn DocumentStore>,
}

impl StoredReviewQueue {
    /// Creates a queue over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn load(&self, id: &str) -> Result<ReviewItem, NexusError> {
        let doc = self.store.get(REVIEW_COLLECTION, id).await?.ok_or_else(|| {
            NexusError::critical("REVIEW_ITEM_NOT_FOUND", format!("Review item '{id}' not found"), COMPONENT)
                .with_context_entry("id", id)
        })?;
        Ok(serde_json::from_value(doc)?)
    }

    async fn close(&self, id: &str, status: ReviewStatus, resolution: &str, by: &str) -> Result<(), NexusError> {
        let item = self.load(id).await?;
        if item.status != ReviewStatus::Pending {
            return Err(NexusError::critical(
                "REVIEW_ALREADY_RESOLVED",
                format!("Review item '{id}' is no longer pending"),
                COMPONENT,
            )
            .with_context_entry("status", serde_json::to_value(item.status)?));
        }

        let mut patch = Map::new();
        patch.insert("status".to_string(), serde_json::to_value(status)?);
        patch.insert("resolution".to_string(), Value::from(resolution));
        patch.insert("resolvedAt".to_string(), serde_json::to_value(Utc::now())?);
        patch.insert("resolvedBy".to_string(), Value::from(by));
        self.store.update(REVIEW_COLLECTION, id, patch).await?;

        tracing::info!(review_id = id, status = ?status, by, "Review item closed");
        Ok(())
    }
}

#[async_trait]
impl ReviewQueue for StoredReviewQueue {
    async fn add_to_review_queue(&self, request: ReviewRequest) -> Result<String, NexusError> {
        let item = ReviewItem {
            id: uuid::Uuid::new_v4().to_string(),
            item_type: request.item_type,
            pipeline_id: request.pipeline_id,
            stage: request.stage,
            status: ReviewStatus::Pending,
            item: request.item,
            context: request.context,
            created_at: Utc::now(),
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        };
        self.store
            .set(REVIEW_COLLECTION, &item.id, serde_json::to_value(&item)?)
            .await?;

        tracing::info!(
            review_id = %item.id,
            pipeline_id = %item.pipeline_id,
            item_type = %item.item_type,
            stage = %item.stage,
            "Review item queued"
        );
        Ok(item.id)
    }

    async fn get_review_item(&self, id: &str) -> Result<Option<ReviewItem>, NexusError> {
        match self.store.get(REVIEW_COLLECTION, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn get_pending_critical_items(&self, pipeline_id: &str) -> Result<Vec<ReviewItem>, NexusError> {
        let filters = [
            Filter::eq("pipelineId", pipeline_id),
            Filter::eq("status", "pending"),
        ];
        let mut items = self
            .store
            .query(REVIEW_COLLECTION, &filters)
            .await?
            .into_iter()
            .map(|(_, doc)| serde_json::from_value::<ReviewItem>(doc))
            .collect::<Result<Vec<_>, _>>()?;
        items.retain(|item| item.item_type.is_critical());
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn resolve_review_item(&self, id: &str, resolution: &str, resolved_by: &str) -> Result<(), NexusError> {
        self.close(id, ReviewStatus::Resolved, resolution, resolved_by).await
    }

    async fn dismiss_review_item(&self, id: &str, reason: &str, dismissed_by: &str) -> Result<(), NexusError> {
        self.close(id, ReviewStatus::Dismissed, reason, dismissed_by).await
    }
}
