//! Registry mapping stage names to implementations.

use std::collections::HashMap;
use std::sync::Arc;

use super::Stage;
use crate::core::{StageName, STAGE_ORDER};
use crate::errors::NexusError;

/// Stage implementations keyed by [`StageName`].
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageName, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under its own name, replacing any previous one.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name(), stage);
        self
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    /// Looks up a stage.
    pub fn get(&self, name: StageName) -> Result<Arc<dyn Stage>, NexusError> {
        self.stages.get(&name).cloned().ok_or_else(|| not_registered(name))
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks that every stage in the fixed order is registered.
    pub fn validate(&self) -> Result<(), NexusError> {
        let missing: Vec<&str> = STAGE_ORDER
            .iter()
            .filter(|s| !self.stages.contains_key(*s))
            .map(StageName::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(NexusError::critical(
                "STAGE_NOT_REGISTERED",
                format!("Missing stage implementations: {}", missing.join(", ")),
                "orchestrator",
            )
            .with_context_entry("missing", missing))
        }
    }
}

fn not_registered(name: StageName) -> NexusError {
    NexusError::critical(
        "STAGE_NOT_REGISTERED",
        format!("No implementation registered for stage '{name}'"),
        name.as_str(),
    )
}
