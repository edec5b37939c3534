//! Executor test harness.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ScriptedStage;
use crate::config::{PipelineConfig, StageConfig};
use crate::core::{StageName, STAGE_ORDER};
use crate::errors::NexusError;
use crate::events::CollectingEventSink;
use crate::incidents::IncidentLogger;
use crate::pipeline::{ExecutorBuilder, PipelineExecutor, RetryOptions};
use crate::ports::{InMemoryBudgetTracker, InMemoryTopicQueue};
use crate::review::StoredReviewQueue;
use crate::stages::StageRegistry;
use crate::state::{DocumentStore, InMemoryDocumentStore, StateStore};

/// An executor wired to in-memory collaborators and scripted stages.
///
/// Every stage in the fixed order is a [`ScriptedStage`] that succeeds by
/// default. Retries are immediate, so retry scenarios run without sleeping.
#[derive(Debug)]
pub struct TestHarness {
    /// Backing document store shared by every collaborator.
    pub documents: Arc<InMemoryDocumentStore>,
    /// Queued-topic backend.
    pub topic_queue: Arc<InMemoryTopicQueue>,
    /// Budget backend.
    pub budget: Arc<InMemoryBudgetTracker>,
    /// Review queue over [`TestHarness::documents`].
    pub review_queue: Arc<StoredReviewQueue>,
    /// Collected lifecycle events.
    pub events: Arc<CollectingEventSink>,
    /// Executor configuration.
    pub config: PipelineConfig,
    stages: BTreeMap<StageName, Arc<ScriptedStage>>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Creates a harness with three immediate retries per stage.
    #[must_use]
    pub fn new() -> Self {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let config = PipelineConfig::default()
            .with_default_stage(StageConfig::default().with_retry(RetryOptions::immediate(3)));
        Self {
            review_queue: Arc::new(StoredReviewQueue::new(documents.clone())),
            documents,
            topic_queue: Arc::new(InMemoryTopicQueue::new(config.queue_max_retries)),
            budget: Arc::new(InMemoryBudgetTracker::default()),
            events: Arc::new(CollectingEventSink::new()),
            config,
            stages: STAGE_ORDER
                .iter()
                .map(|s| (*s, Arc::new(ScriptedStage::new(*s))))
                .collect(),
        }
    }

    /// Replaces the configuration. The topic queue keeps its original bound.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// The scripted stage registered for `name`.
    #[must_use]
    pub fn stage(&self, name: StageName) -> &Arc<ScriptedStage> {
        &self.stages[&name]
    }

    /// A registry of every scripted stage.
    #[must_use]
    pub fn registry(&self) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for stage in self.stages.values() {
            registry.register(stage.clone());
        }
        registry
    }

    /// A builder preloaded with the harness collaborators.
    #[must_use]
    pub fn builder(&self) -> ExecutorBuilder {
        PipelineExecutor::builder()
            .with_registry(self.registry())
            .with_config(self.config.clone())
            .with_document_store(self.documents.clone())
            .with_review_queue(self.review_queue.clone())
            .with_topic_queue(self.topic_queue.clone())
            .with_budget_tracker(self.budget.clone())
            .with_event_sink(self.events.clone())
    }

    /// Builds the executor.
    pub fn executor(&self) -> Result<PipelineExecutor, NexusError> {
        self.builder().build()
    }

    /// State store over the harness documents.
    #[must_use]
    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.store())
    }

    /// Incident logger over the harness documents.
    #[must_use]
    pub fn incidents(&self) -> IncidentLogger {
        IncidentLogger::new(self.store())
    }

    fn store(&self) -> Arc<dyn DocumentStore> {
        self.documents.clone()
    }
}
