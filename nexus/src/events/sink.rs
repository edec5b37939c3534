//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt::Debug;
use tracing::{debug, info, Level};

use super::{EventKind, PipelineEvent};

/// Receives pipeline lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Emits an event.
    async fn emit(&self, event: &PipelineEvent);

    /// Emits an event without awaiting. Must never panic; failures are
    /// swallowed by the sink.
    fn try_emit(&self, event: &PipelineEvent);
}

/// Discards every event. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}

    fn try_emit(&self, _event: &PipelineEvent) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (DEBUG or INFO).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &PipelineEvent) {
        let stage = event.stage.map_or("", |s| s.as_str());
        if self.level == Level::DEBUG {
            debug!(
                event = %event.kind,
                pipeline_id = %event.pipeline_id,
                stage,
                data = %event.data,
                "Pipeline event"
            );
        } else {
            info!(
                event = %event.kind,
                pipeline_id = %event.pipeline_id,
                stage,
                data = %event.data,
                "Pipeline event"
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.log_event(event);
    }
}

/// Records events in memory for assertions.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Event kinds, in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageName;

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        let event = PipelineEvent::new(EventKind::PipelineStarted, "p");
        tokio_test::block_on(NoOpEventSink.emit(&event));
        tokio_test::block_on(LoggingEventSink::default().emit(&event));
        LoggingEventSink::debug().try_emit(&event);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&PipelineEvent::new(EventKind::PipelineStarted, "p")).await;
        sink.try_emit(&PipelineEvent::for_stage(EventKind::StageStarted, "p", StageName::Research));
        sink.try_emit(&PipelineEvent::for_stage(EventKind::StageStarted, "p", StageName::ScriptGen));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.of_kind(EventKind::StageStarted).len(), 2);
        assert_eq!(sink.kinds()[0], EventKind::PipelineStarted);

        sink.clear();
        assert!(sink.is_empty());
    }
}
