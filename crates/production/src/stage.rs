use core::str::FromStr;

use serde::{Deserialize, Serialize};

use narrator_core::DomainError;

/// Pipeline stages, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    TextGeneration,
    Chunking,
    AudioSynthesis,
    Merge,
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Validation,
        Stage::TextGeneration,
        Stage::Chunking,
        Stage::AudioSynthesis,
        Stage::Merge,
        Stage::Upload,
    ];

    /// Stage every item enters first.
    pub fn first() -> Stage {
        Stage::Validation
    }

    /// Following stage, or `None` after the last one.
    pub fn next(&self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Queue name backing this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::TextGeneration => "text_generation",
            Stage::Chunking => "chunking",
            Stage::AudioSynthesis => "audio_synthesis",
            Stage::Merge => "merge",
            Stage::Upload => "upload",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown stage: {s}")))
    }
}
