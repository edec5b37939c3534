//! Queue of topics whose pipeline was skipped, retried on a later day.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::core::StageName;
use crate::errors::NexusError;

/// A topic waiting to seed a later pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTopic {
    /// News-sourcing payload used as the seed.
    pub topic: Value,
    /// Times the topic has been retried.
    pub retry_count: u32,
    /// Pipeline id the topic first failed under.
    pub original_date: String,
    /// When it was queued.
    pub queued_at: DateTime<Utc>,
    /// Why the original run was skipped.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Stage that exhausted.
    #[serde(default)]
    pub failed_stage: Option<StageName>,
}

impl QueuedTopic {
    /// A fresh queued topic.
    #[must_use]
    pub fn new(topic: Value, original_date: impl Into<String>) -> Self {
        Self {
            topic,
            retry_count: 0,
            original_date: original_date.into(),
            queued_at: Utc::now(),
            failure_reason: None,
            failed_stage: None,
        }
    }

    /// Sets the retry count.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Request to re-queue a topic after a skip.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTopic {
    /// The topic payload.
    pub topic: Value,
    /// Pipeline id of the skipped run.
    pub original_date: String,
    /// Skip reason.
    pub failure_reason: String,
    /// Stage that exhausted.
    pub failed_stage: StageName,
    /// Retry count carried over from the queued topic, 0 for a fresh one.
    pub retry_count: u32,
}

/// Queued-topic backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicQueue: Send + Sync + Debug {
    /// Returns the topic queued for `pipeline_id`, if any.
    async fn check_today_queued_topic(&self, pipeline_id: &str) -> Result<Option<QueuedTopic>, NexusError>;

    /// Bumps the retry count; `None` means the topic is exhausted or gone.
    async fn increment_retry_count(&self, pipeline_id: &str) -> Result<Option<QueuedTopic>, NexusError>;

    /// Removes the topic queued for `pipeline_id`.
    async fn clear_queued_topic(&self, pipeline_id: &str) -> Result<(), NexusError>;

    /// Queues a topic for a later run and returns the date it is queued for.
    async fn queue_failed_topic(&self, topic: FailedTopic) -> Result<String, NexusError>;
}

/// Date a topic from `pipeline_id` is retried on.
///
/// `YYYY-MM-DD` ids roll to the next day; anything else gets `-retry`.
#[must_use]
pub fn next_queue_date(pipeline_id: &str) -> String {
    NaiveDate::parse_from_str(pipeline_id, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.succ_opt())
        .map_or_else(|| format!("{pipeline_id}-retry"), |d| d.format("%Y-%m-%d").to_string())
}

/// In-memory [`TopicQueue`] keyed by date.
#[derive(Debug)]
pub struct InMemoryTopicQueue {
    max_retries: u32,
    topics: Mutex<HashMap<String, QueuedTopic>>,
}

impl Default for InMemoryTopicQueue {
    fn default() -> Self {
        Self::new(2)
    }
}

impl InMemoryTopicQueue {
    /// Creates a queue whose topics may be retried `max_retries` times.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Places a topic directly under `date`.
    pub fn insert(&self, date: impl Into<String>, topic: QueuedTopic) {
        self.topics.lock().insert(date.into(), topic);
    }

    /// Returns the topic queued under `date`.
    #[must_use]
    pub fn get(&self, date: &str) -> Option<QueuedTopic> {
        self.topics.lock().get(date).cloned()
    }

    /// Number of queued topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }
}

#[async_trait]
impl TopicQueue for InMemoryTopicQueue {
    async fn check_today_queued_topic(&self, pipeline_id: &str) -> Result<Option<QueuedTopic>, NexusError> {
        Ok(self.get(pipeline_id))
    }

    async fn increment_retry_count(&self, pipeline_id: &str) -> Result<Option<QueuedTopic>, NexusError> {
        let mut topics = self.topics.lock();
        let Some(topic) = topics.get_mut(pipeline_id) else {
            return Ok(None);
        };
        if topic.retry_count >= self.max_retries {
            return Ok(None);
        }
        topic.retry_count += 1;
        Ok(Some(topic.clone()))
    }

    async fn clear_queued_topic(&self, pipeline_id: &str) -> Result<(), NexusError> {
        self.topics.lock().remove(pipeline_id);
        Ok(())
    }

    async fn queue_failed_topic(&self, failed: FailedTopic) -> Result<String, NexusError> {
        let date = next_queue_date(&failed.original_date);
        let topic = QueuedTopic {
            topic: failed.topic,
            retry_count: failed.retry_count,
            original_date: failed.original_date,
            queued_at: Utc::now(),
            failure_reason: Some(failed.failure_reason),
            failed_stage: Some(failed.failed_stage),
        };
        tracing::info!(queued_for = %date, retry_count = topic.retry_count, "Topic queued for retry");
        self.insert(date.clone(), topic);
        Ok(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_queue_date() {
        assert_eq!(next_queue_date("2026-01-22"), "2026-01-23");
        assert_eq!(next_queue_date("2026-01-31"), "2026-02-01");
        assert_eq!(next_queue_date("adhoc-run"), "adhoc-run-retry");
    }

    #[tokio::test]
    async fn test_increment_respects_bound() {
        let queue = InMemoryTopicQueue::new(2);
        queue.insert("2026-01-22", QueuedTopic::new(json!({"title": "t"}), "2026-01-21"));

        assert_eq!(queue.increment_retry_count("2026-01-22").await.unwrap().unwrap().retry_count, 1);
        assert_eq!(queue.increment_retry_count("2026-01-22").await.unwrap().unwrap().retry_count, 2);
        assert!(queue.increment_retry_count("2026-01-22").await.unwrap().is_none());
        assert!(queue.increment_retry_count("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_and_clear() {
        let queue = InMemoryTopicQueue::default();
        let date = queue
            .queue_failed_topic(FailedTopic {
                topic: json!({"title": "t"}),
                original_date: "2026-01-22".to_string(),
                failure_reason: "All 2 providers failed".to_string(),
                failed_stage: StageName::Tts,
                retry_count: 1,
            })
            .await
            .unwrap();
        assert_eq!(date, "2026-01-23");

        let queued = queue.check_today_queued_topic("2026-01-23").await.unwrap().unwrap();
        assert_eq!(queued.retry_count, 1);
        assert_eq!(queued.failed_stage, Some(StageName::Tts));

        queue.clear_queued_topic("2026-01-23").await.unwrap();
        assert!(queue.is_empty());
    }
}
