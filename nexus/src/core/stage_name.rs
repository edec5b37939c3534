//! The closed set of pipeline stages and their fixed order.

use crate::errors::NexusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named unit of the content-production workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageName {
    /// Topic sourcing from news feeds.
    NewsSourcing,
    /// Topic research.
    Research,
    /// Script writing.
    ScriptGen,
    /// Pronunciation / SSML tagging.
    Pronunciation,
    /// Text-to-speech.
    Tts,
    /// Scene direction and visual asset enrichment.
    VisualGen,
    /// Video rendering.
    Render,
    /// Thumbnail generation.
    Thumbnail,
    /// Video publishing.
    Youtube,
    /// Social announcement.
    Twitter,
    /// Operator notification, always last.
    Notifications,
}

/// The workflow as a linear chain. `notifications` is always the terminal entry.
pub const STAGE_ORDER: [StageName; 11] = [
    StageName::NewsSourcing,
    StageName::Research,
    StageName::ScriptGen,
    StageName::Pronunciation,
    StageName::Tts,
    StageName::VisualGen,
    StageName::Render,
    StageName::Thumbnail,
    StageName::Youtube,
    StageName::Twitter,
    StageName::Notifications,
];

/// Stages whose exhausted retries/fallbacks skip the pipeline instead of failing it.
pub const DEFAULT_CRITICAL_STAGES: [StageName; 9] = [
    StageName::NewsSourcing,
    StageName::Research,
    StageName::ScriptGen,
    StageName::Tts,
    StageName::VisualGen,
    StageName::Render,
    StageName::Thumbnail,
    StageName::Youtube,
    StageName::Twitter,
];

impl StageName {
    /// Returns the wire name, e.g. `script-gen`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewsSourcing => "news-sourcing",
            Self::Research => "research",
            Self::ScriptGen => "script-gen",
            Self::Pronunciation => "pronunciation",
            Self::Tts => "tts",
            Self::VisualGen => "visual-gen",
            Self::Render => "render",
            Self::Thumbnail => "thumbnail",
            Self::Youtube => "youtube",
            Self::Twitter => "twitter",
            Self::Notifications => "notifications",
        }
    }

    /// Position in [`STAGE_ORDER`].
    #[must_use]
    pub fn index(&self) -> usize {
        STAGE_ORDER.iter().position(|s| s == self).unwrap_or(STAGE_ORDER.len())
    }

    /// The ten stages before `notifications`.
    #[must_use]
    pub fn production_stages() -> &'static [StageName] {
        &STAGE_ORDER[..STAGE_ORDER.len() - 1]
    }

    /// Upper-snake prefix used in stage error codes, e.g. `SCRIPT_GEN`.
    #[must_use]
    pub fn code_prefix(&self) -> String {
        self.as_str().replace('-', "_").to_uppercase()
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STAGE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                NexusError::critical("INVALID_STAGE", format!("Unknown stage '{s}'"), "orchestrator")
                    .with_context_entry("stage", s)
            })
    }
}
