//! The terminal notifications stage.
//!
//! Runs after every pipeline outcome. Channels are delivered concurrently
//! and each failure is captured on its own, so the stage always reports
//! success; the run's terminal status never depends on delivery.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{QualityMetrics, StageName, StageOutput};
use crate::errors::NexusError;
use crate::pipeline::PipelineResult;
use crate::stages::{Stage, StageInput};

/// A delivery channel (email, chat webhook, ...).
#[async_trait]
pub trait NotificationChannel: Send + Sync + Debug {
    /// Key used in the per-channel report.
    fn name(&self) -> &str;

    /// Delivers a summary of `result`.
    async fn send(&self, result: &PipelineResult) -> Result<(), NexusError>;
}

/// Channel that writes the outcome to `tracing`.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    /// Creates a channel reporting under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, result: &PipelineResult) -> Result<(), NexusError> {
        tracing::info!(
            pipeline_id = %result.pipeline_id,
            status = %result.status,
            completed = result.completed_stages.len(),
            skipped = result.skipped_stages.len(),
            total_cost = result.total_cost,
            "Pipeline finished"
        );
        Ok(())
    }
}

/// [`Stage`] implementation for [`StageName::Notifications`].
#[derive(Debug, Clone)]
pub struct NotificationsStage {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Default for NotificationsStage {
    fn default() -> Self {
        Self::new(vec![Arc::new(LogChannel::default())])
    }
}

impl NotificationsStage {
    /// Creates the stage over `channels`.
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Adds a channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    async fn deliver(&self, result: &PipelineResult) -> Vec<(String, Result<(), NexusError>)> {
        let sends = self.channels.iter().map(|channel| async move {
            (channel.name().to_string(), channel.send(result).await)
        });
        join_all(sends).await
    }
}

#[async_trait]
impl Stage for NotificationsStage {
    fn name(&self) -> StageName {
        StageName::Notifications
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        let outcomes = match input.data_as::<PipelineResult>() {
            Ok(result) => self.deliver(&result).await,
            Err(err) => {
                tracing::warn!(pipeline_id = %input.pipeline_id, error = %err, "Notification payload is not a pipeline result");
                self.channels
                    .iter()
                    .map(|c| (c.name().to_string(), Err(err.clone())))
                    .collect()
            }
        };

        let mut channels = Map::new();
        let mut sent = 0u32;
        let mut failed = 0u32;
        for (name, outcome) in outcomes {
            let report = match outcome {
                Ok(()) => {
                    sent += 1;
                    json!({ "sent": true })
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(
                        pipeline_id = %input.pipeline_id,
                        channel = %name,
                        code = %err.code,
                        "Notification channel failed"
                    );
                    json!({ "sent": false, "error": err.message })
                }
            };
            channels.insert(name, report);
        }

        let quality = QualityMetrics::new(StageName::Notifications.as_str())
            .with("notificationsSent", f64::from(sent))
            .with("notificationsFailed", f64::from(failed));

        Ok(StageOutput::ok(json!({ "channels": Value::Object(channels) }), "notifications").with_quality(quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::core::{PipelineStatus, QualityContext};

    #[derive(Debug)]
    struct DownChannel;

    #[async_trait]
    impl NotificationChannel for DownChannel {
        fn name(&self) -> &str {
            "discord"
        }

        async fn send(&self, _result: &PipelineResult) -> Result<(), NexusError> {
            Err(NexusError::recoverable("DISCORD_WEBHOOK_FAILED", "404 from webhook", "notifications"))
        }
    }

    fn input(data: Value) -> StageInput {
        StageInput {
            pipeline_id: "2026-01-22".to_string(),
            previous_stage: Some(StageName::Twitter),
            data,
            config: StageConfig::default(),
            quality_context: QualityContext::default(),
        }
    }

    fn result_payload() -> Value {
        let mut result = PipelineResult::new("2026-01-22");
        result.status = PipelineStatus::Completed;
        serde_json::to_value(result).unwrap()
    }

    #[tokio::test]
    async fn test_partial_failure_still_succeeds() {
        let stage = NotificationsStage::new(vec![Arc::new(LogChannel::new("email")), Arc::new(DownChannel)]);
        let output = stage.execute(input(result_payload())).await.unwrap();

        assert!(output.success);
        assert_eq!(output.data["channels"]["email"]["sent"], true);
        assert_eq!(output.data["channels"]["discord"]["sent"], false);
        assert_eq!(output.data["channels"]["discord"]["error"], "404 from webhook");

        let quality = output.quality.unwrap();
        assert_eq!(quality.get("notificationsSent"), Some(1.0));
        assert_eq!(quality.get("notificationsFailed"), Some(1.0));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_every_channel() {
        let stage = NotificationsStage::default().with_channel(Arc::new(DownChannel));
        let output = stage.execute(input(json!("not a result"))).await.unwrap();

        assert!(output.success);
        assert_eq!(output.data["channels"]["log"]["sent"], false);
        assert_eq!(output.quality.unwrap().get("notificationsFailed"), Some(2.0));
    }
}
