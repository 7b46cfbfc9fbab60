//! Server-emitted job stage values.
//!
//! The server names its current activity with a free-form string such as
//! `running_market` or `synthesizing`. The few values with a fixed
//! meaning get their own variant; everything else is carried verbatim
//! and interpreted against a [`StageRegistry`](crate::registry::StageRegistry).

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Results are being persisted; every analysis step has finished.
pub const STAGE_SAVING: &str = "saving";

/// The job finished successfully.
pub const STAGE_COMPLETE: &str = "complete";

/// The job failed.
pub const STAGE_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// JobStage
// ---------------------------------------------------------------------------

/// Current pipeline activity as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStage {
    /// `saving`: terminal-success marker.
    Saving,
    /// `complete`: terminal-success marker.
    Complete,
    /// `error`: the server gave up on the job.
    Error,
    /// Any other stage. May or may not map to a sub-task.
    Named(String),
}

impl JobStage {
    /// Parse a raw stage string. Never fails.
    pub fn parse(raw: &str) -> Self {
        Self::from(raw.to_string())
    }

    /// The wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Saving => STAGE_SAVING,
            Self::Complete => STAGE_COMPLETE,
            Self::Error => STAGE_ERROR,
            Self::Named(name) => name,
        }
    }

    /// Whether this stage means every analysis step is done.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Saving | Self::Complete)
    }
}

impl From<String> for JobStage {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            STAGE_SAVING => Self::Saving,
            STAGE_COMPLETE => Self::Complete,
            STAGE_ERROR => Self::Error,
            _ => Self::Named(raw),
        }
    }
}

impl From<JobStage> for String {
    fn from(stage: JobStage) -> Self {
        match stage {
            JobStage::Named(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
