//! Run-wide quality accumulator.

use serde::{Deserialize, Serialize};

use super::StageName;

/// Degraded stages, fallback usage and flags accumulated over a run.
///
/// Append-only: entries are never removed during a run, and the whole
/// record is persisted and restored verbatim on resume. Each degraded stage
/// and each `stage:provider` pair is recorded once, so a stage re-run by a
/// resume does not count twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityContext {
    /// Stages that partially succeeded.
    #[serde(default)]
    pub degraded_stages: Vec<String>,
    /// `"stage:provider"` entries for stages served by a fallback provider.
    #[serde(default)]
    pub fallbacks_used: Vec<String>,
    /// Free-form quality flags, e.g. `"tts:long pause detected"`.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl QualityContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a degraded stage.
    pub fn record_degraded(&mut self, stage: StageName) {
        push_unique(&mut self.degraded_stages, stage.as_str().to_string());
    }

    /// Records a fallback provider used by a stage.
    pub fn record_fallback(&mut self, stage: StageName, provider: &str) {
        push_unique(&mut self.fallbacks_used, format!("{stage}:{provider}"));
    }

    /// Records a flag.
    pub fn add_flag(&mut self, flag: impl Into<String>) {
        self.flags.push(flag.into());
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.degraded_stages.is_empty() && self.fallbacks_used.is_empty() && self.flags.is_empty()
    }
}

fn push_unique(entries: &mut Vec<String>, entry: String) {
    if !entries.contains(&entry) {
        entries.push(entry);
    }
}
