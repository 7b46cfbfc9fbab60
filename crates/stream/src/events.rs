//! Lifecycle updates broadcast by the controllers.
//!
//! Presentation code subscribes to these to know *when* to re-read a
//! snapshot; the snapshot itself stays the source of truth.

use analyst_core::types::SessionToken;
use serde::Serialize;

/// A state change in a controller-owned session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// A session was created and its stream is being opened.
    Started { token: SessionToken, input: String },

    /// A session was replaced by a newer start request.
    Superseded { token: SessionToken, input: String },

    /// Stage or progress changed.
    Progress {
        token: SessionToken,
        input: String,
        stage: String,
        /// Completion percentage (0-100).
        progress: f64,
    },

    /// A sub-task result arrived.
    TaskFinished {
        token: SessionToken,
        input: String,
        task: String,
        success: bool,
    },

    /// The session produced its final result.
    Completed { token: SessionToken, input: String },

    /// The session failed.
    Failed {
        token: SessionToken,
        input: String,
        /// Human-readable error description.
        error: String,
    },

    /// The session was cancelled locally.
    Cancelled { token: SessionToken, input: String },

    /// A batch received its final ranking.
    BatchCompleted { token: SessionToken, total: usize },
}

impl SessionUpdate {
    pub fn token(&self) -> SessionToken {
        match self {
            Self::Started { token, .. }
            | Self::Superseded { token, .. }
            | Self::Progress { token, .. }
            | Self::TaskFinished { token, .. }
            | Self::Completed { token, .. }
            | Self::Failed { token, .. }
            | Self::Cancelled { token, .. }
            | Self::BatchCompleted { token, .. } => *token,
        }
    }

    /// Whether this update ends the session it refers to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Superseded { .. }
                | Self::Completed { .. }
                | Self::Failed { .. }
                | Self::Cancelled { .. }
                | Self::BatchCompleted { .. }
        )
    }
}
