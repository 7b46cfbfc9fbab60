//! Per-input session records.
//!
//! A [`JobSession`] is one pipeline run for one input. The stream
//! controllers own the records and mutate them in response to transport
//! events; consumers only ever see [`SessionSnapshot`]s. Once a session
//! reaches a terminal phase every mutator becomes a no-op.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::registry::{StageKind, StageRegistry};
use crate::resolver::{resolve, PipelineStatus, ResolveInput};
use crate::stage::JobStage;
use crate::types::{SessionToken, Timestamp};

/// Message used when the stream is lost before a terminal event.
pub const CONNECTIVITY_MESSAGE: &str = "Lost connection to the analysis server";

/// Message used when the server reports an unsuccessful result without text.
pub const UNSUCCESSFUL_RESULT_MESSAGE: &str = "Analysis finished without a result";

// ---------------------------------------------------------------------------
// Results and outcomes
// ---------------------------------------------------------------------------

/// Authoritative outcome of one sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResult {
    pub success: bool,
    /// Wall time the sub-task took, in seconds.
    #[serde(default, alias = "duration")]
    pub duration_secs: Option<f64>,
    /// Whatever the sub-task produced.
    #[serde(default, alias = "data")]
    pub payload: Option<serde_json::Value>,
}

impl SubTaskResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            duration_secs: None,
            payload: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            ..Self::succeeded()
        }
    }
}

/// Final aggregate result of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub input: String,
    /// Remaining outcome fields exactly as the server sent them.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Which side of the wire a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stream never opened or was lost before a terminal event.
    Transport,
    /// The server reported the failure itself.
    Application,
}

/// Why a session ended unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SessionFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
        }
    }

    /// The generic connectivity failure.
    pub fn connectivity() -> Self {
        Self::transport(CONNECTIVITY_MESSAGE)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    /// Start requested; nothing received yet.
    Starting,
    /// At least one event has been applied.
    Streaming,
    Succeeded(JobOutcome),
    Failed(SessionFailure),
    /// Stopped locally before reaching a terminal event.
    Cancelled,
}

/// Serializable label for a [`SessionPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Streaming,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Cancelled)
    }

    pub fn state(&self) -> SessionState {
        match self {
            Self::Starting => SessionState::Starting,
            Self::Streaming => SessionState::Streaming,
            Self::Succeeded(_) => SessionState::Succeeded,
            Self::Failed(_) => SessionState::Failed,
            Self::Cancelled => SessionState::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// JobSession
// ---------------------------------------------------------------------------

/// One pipeline run for one input.
#[derive(Debug, Clone)]
pub struct JobSession {
    token: SessionToken,
    input: String,
    stage: Option<JobStage>,
    furthest_position: Option<usize>,
    progress: f64,
    results: HashMap<String, SubTaskResult>,
    phase: SessionPhase,
    started_at: Timestamp,
    finished_at: Option<Timestamp>,
}

impl JobSession {
    pub fn new(token: SessionToken, input: impl Into<String>) -> Self {
        Self {
            token,
            input: input.into(),
            stage: None,
            furthest_position: None,
            progress: 0.0,
            results: HashMap::new(),
            phase: SessionPhase::Starting,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn stage(&self) -> Option<&JobStage> {
        self.stage.as_ref()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn results(&self) -> &HashMap<String, SubTaskResult> {
        &self.results
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Overwrite stage and progress with a server update.
    ///
    /// The server is the ordering authority: values are taken as they
    /// come, even when they move backwards. Returns `false` when the
    /// session is already terminal.
    pub fn apply_progress(&mut self, registry: &StageRegistry, stage: JobStage, progress: f64) -> bool {
        if self.is_terminal() {
            return false;
        }
        if let StageKind::Subtask(task) = registry.classify(&stage) {
            self.furthest_position = Some(
                self.furthest_position
                    .map_or(task.position, |p| p.max(task.position)),
            );
        }
        self.stage = Some(stage);
        self.progress = clamp_progress(progress);
        self.phase = SessionPhase::Streaming;
        true
    }

    /// Record the outcome of one sub-task.
    pub fn record_result(&mut self, task: impl Into<String>, result: SubTaskResult) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.results.insert(task.into(), result);
        if self.phase == SessionPhase::Starting {
            self.phase = SessionPhase::Streaming;
        }
        true
    }

    /// Finish successfully.
    pub fn succeed(&mut self, outcome: JobOutcome) -> bool {
        self.finish(SessionPhase::Succeeded(outcome))
    }

    /// Finish with a failure.
    pub fn fail(&mut self, failure: SessionFailure) -> bool {
        self.finish(SessionPhase::Failed(failure))
    }

    /// Stop without a terminal event.
    pub fn cancel(&mut self) -> bool {
        self.finish(SessionPhase::Cancelled)
    }

    fn finish(&mut self, phase: SessionPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(phase, SessionPhase::Succeeded(_)) {
            self.progress = 100.0;
        }
        self.phase = phase;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Resolve the status of every sub-task in `registry`.
    pub fn status(&self, registry: &StageRegistry) -> PipelineStatus {
        let input = ResolveInput {
            current_stage: self.stage.as_ref(),
            results: &self.results,
            job_started: true,
            terminal_success: matches!(self.phase, SessionPhase::Succeeded(_)),
            furthest_position: self.furthest_position,
        };
        resolve(registry, &input)
    }

    /// Immutable view handed to consumers.
    pub fn snapshot(&self, registry: &StageRegistry) -> SessionSnapshot {
        let (outcome, error) = match &self.phase {
            SessionPhase::Succeeded(outcome) => (Some(outcome.clone()), None),
            SessionPhase::Failed(failure) => (None, Some(failure.clone())),
            _ => (None, None),
        };
        SessionSnapshot {
            token: self.token,
            input: self.input.clone(),
            state: self.phase.state(),
            stage: self.stage.as_ref().map(|s| s.as_str().to_string()),
            progress: self.progress,
            status: self.status(registry),
            terminal: self.is_terminal(),
            outcome,
            error,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Progress is a percentage; anything outside `0..=100` is pinned.
fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    progress.clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only view of a session for presentation code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub token: SessionToken,
    pub input: String,
    pub state: SessionState,
    pub stage: Option<String>,
    pub progress: f64,
    pub status: PipelineStatus,
    pub terminal: bool,
    pub outcome: Option<JobOutcome>,
    pub error: Option<SessionFailure>,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}
