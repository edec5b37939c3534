//! Mock stages and stores for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;

use crate::core::{QualityContext, StageName, StageOutput};
use crate::errors::NexusError;
use crate::stages::{Stage, StageInput};
use crate::state::{DocumentStore, Filter, InMemoryDocumentStore};

/// What a [`ScriptedStage`] was called with.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInput {
    /// Stage whose output was handed in.
    pub previous_stage: Option<StageName>,
    /// Input data.
    pub data: Value,
    /// Quality context at call time.
    pub quality_context: QualityContext,
}

/// A stage that replays queued results, then a default, and records calls.
#[derive(Debug)]
pub struct ScriptedStage {
    name: StageName,
    script: Mutex<VecDeque<Result<StageOutput, NexusError>>>,
    default: Mutex<Result<StageOutput, NexusError>>,
    calls: Mutex<Vec<RecordedInput>>,
}

impl ScriptedStage {
    /// Creates a stage that succeeds with `{"stage": name}` from provider
    /// `{name}-primary`.
    #[must_use]
    pub fn new(name: StageName) -> Self {
        let output = StageOutput::ok(json!({ "stage": name.as_str() }), format!("{name}-primary"));
        Self {
            name,
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(output)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues a successful result.
    pub fn push_ok(&self, output: StageOutput) -> &Self {
        self.script.lock().push_back(Ok(output));
        self
    }

    /// Queues a failure.
    pub fn push_err(&self, error: NexusError) -> &Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Replaces the result returned once the script runs out.
    pub fn set_default(&self, result: Result<StageOutput, NexusError>) -> &Self {
        *self.default.lock() = result;
        self
    }

    /// Fails every call once the script runs out.
    pub fn always_fail(&self, error: NexusError) -> &Self {
        self.set_default(Err(error))
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Inputs of every call, in order.
    #[must_use]
    pub fn inputs(&self) -> Vec<RecordedInput> {
        self.calls.lock().clone()
    }

    /// Input of the most recent call.
    #[must_use]
    pub fn last_input(&self) -> Option<RecordedInput> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> StageName {
        self.name
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, NexusError> {
        self.calls.lock().push(RecordedInput {
            previous_stage: input.previous_stage,
            data: input.data,
            quality_context: input.quality_context,
        });
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.default.lock().clone())
    }
}

/// In-memory store whose writes to selected collections fail.
#[derive(Debug, Default)]
pub struct FlakyDocumentStore {
    inner: InMemoryDocumentStore,
    failing: Vec<String>,
}

impl FlakyDocumentStore {
    /// Fails `set`, `update` and `delete` on `collections` with `STORE_IO_ERROR`.
    #[must_use]
    pub fn failing_writes_to(collections: &[&str]) -> Self {
        Self {
            inner: InMemoryDocumentStore::new(),
            failing: collections.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn inner(&self) -> &InMemoryDocumentStore {
        &self.inner
    }

    fn check_write(&self, collection: &str) -> Result<(), NexusError> {
        if self.failing.iter().any(|c| c == collection) {
            Err(NexusError::critical(
                "STORE_IO_ERROR",
                format!("Write to '{collection}' refused"),
                "state-store",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, NexusError> {
        self.inner.get(collection, id).await
    }

    async fn set(&self, collection: &str, id: &str, document: Value) -> Result<(), NexusError> {
        self.check_write(collection)?;
        self.inner.set(collection, id, document).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<(), NexusError> {
        self.check_write(collection)?;
        self.inner.update(collection, id, patch).await
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>, NexusError> {
        self.inner.query(collection, filters).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), NexusError> {
        self.check_write(collection)?;
        self.inner.delete(collection, id).await
    }
}
