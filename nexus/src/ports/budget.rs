//! Cost tracking. Informational only: nothing here gates execution.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use crate::errors::NexusError;

/// Spend relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostStatus {
    /// Below the warning threshold.
    Ok,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

impl fmt::Display for CostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Budget backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BudgetTracker: Send + Sync + Debug {
    /// Records what a pipeline has spent and returns total spend.
    async fn update_budget_spent(&self, pipeline_id: &str, amount: f64) -> Result<f64, NexusError>;

    /// Compares total spend against the thresholds.
    async fn check_cost_thresholds(&self) -> Result<CostStatus, NexusError>;
}

/// In-memory [`BudgetTracker`].
///
/// Spend is recorded per pipeline, so reporting the same pipeline twice (as
/// a resume does) replaces rather than double counts.
#[derive(Debug)]
pub struct InMemoryBudgetTracker {
    warning_threshold: f64,
    critical_threshold: f64,
    spent: Mutex<BTreeMap<String, f64>>,
}

impl Default for InMemoryBudgetTracker {
    fn default() -> Self {
        Self::new(40.0, 50.0)
    }
}

impl InMemoryBudgetTracker {
    /// Creates a tracker with absolute USD thresholds.
    #[must_use]
    pub fn new(warning_threshold: f64, critical_threshold: f64) -> Self {
        Self {
            warning_threshold,
            critical_threshold,
            spent: Mutex::new(BTreeMap::new()),
        }
    }

    /// Total spend.
    #[must_use]
    pub fn total_spent(&self) -> f64 {
        self.spent.lock().values().sum()
    }

    /// Spend recorded for a pipeline.
    #[must_use]
    pub fn spent_by(&self, pipeline_id: &str) -> Option<f64> {
        self.spent.lock().get(pipeline_id).copied()
    }
}

#[async_trait]
impl BudgetTracker for InMemoryBudgetTracker {
    async fn update_budget_spent(&self, pipeline_id: &str, amount: f64) -> Result<f64, NexusError> {
        let mut spent = self.spent.lock();
        spent.insert(pipeline_id.to_string(), amount);
        Ok(spent.values().sum())
    }

    async fn check_cost_thresholds(&self) -> Result<CostStatus, NexusError> {
        let total = self.total_spent();
        Ok(if total >= self.critical_threshold {
            CostStatus::Critical
        } else if total >= self.warning_threshold {
            CostStatus::Warning
        } else {
            CostStatus::Ok
        })
    }
}
