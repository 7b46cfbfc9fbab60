//! Batch session records.
//!
//! A batch runs the same job over several inputs on one shared stream.
//! Each input keeps its own [`JobSession`]; the batch only adds the
//! counters, the batch-level phase and the final ranking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::StageRegistry;
use crate::session::{JobSession, SessionFailure, SessionPhase, SessionSnapshot};
use crate::types::SessionToken;

/// Failure recorded for inputs still running when the ranking arrives.
pub const NO_RESULT_MESSAGE: &str = "Batch finished without a result for this input";

/// One entry of the final ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub input: String,
    /// 1 is best.
    pub rank: u32,
    pub score: Option<f64>,
    /// Any further fields the server attached to the entry.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Batch-level lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPhase {
    Running,
    /// The final ranking arrived.
    Completed,
    Failed(SessionFailure),
    Cancelled,
}

impl BatchPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Serializable label for a [`BatchPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Several job sessions sharing one stream.
#[derive(Debug, Clone)]
pub struct BatchSession {
    token: SessionToken,
    inputs: Vec<String>,
    sessions: HashMap<String, JobSession>,
    phase: BatchPhase,
    ranked: Vec<RankedResult>,
}

impl BatchSession {
    /// Create a batch. Duplicate inputs are collapsed, first one wins.
    pub fn new<I, S>(token: SessionToken, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut sessions = HashMap::new();
        for input in inputs {
            let input = input.into();
            if sessions.contains_key(&input) {
                continue;
            }
            sessions.insert(input.clone(), JobSession::new(token, input.clone()));
            ordered.push(input);
        }
        Self {
            token,
            inputs: ordered,
            sessions,
            phase: BatchPhase::Running,
            ranked: Vec::new(),
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn phase(&self) -> &BatchPhase {
        &self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn ranked(&self) -> &[RankedResult] {
        &self.ranked
    }

    pub fn session(&self, input: &str) -> Option<&JobSession> {
        self.sessions.get(input)
    }

    /// Mutable access for routing an event. `None` once the batch is over.
    pub fn session_mut(&mut self, input: &str) -> Option<&mut JobSession> {
        if self.is_terminal() {
            return None;
        }
        self.sessions.get_mut(input)
    }

    pub fn total(&self) -> usize {
        self.inputs.len()
    }

    /// Inputs whose job reached a result or an error.
    pub fn completed(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| matches!(s.phase(), SessionPhase::Succeeded(_) | SessionPhase::Failed(_)))
            .count()
    }

    /// Store the final ranking and finish the batch.
    ///
    /// Inputs that never reached a result fail with
    /// [`NO_RESULT_MESSAGE`].
    pub fn complete(&mut self, mut ranked: Vec<RankedResult>) -> bool {
        if self.is_terminal() {
            return false;
        }
        for session in self.sessions.values_mut() {
            session.fail(SessionFailure::application(NO_RESULT_MESSAGE));
        }
        ranked.sort_by_key(|r| r.rank);
        self.ranked = ranked;
        self.phase = BatchPhase::Completed;
        true
    }

    /// Fail the batch and every input still in flight.
    pub fn fail(&mut self, failure: SessionFailure) -> bool {
        if self.is_terminal() {
            return false;
        }
        for session in self.sessions.values_mut() {
            session.fail(failure.clone());
        }
        self.phase = BatchPhase::Failed(failure);
        true
    }

    /// Stop the batch; inputs still in flight become cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        for session in self.sessions.values_mut() {
            session.cancel();
        }
        self.phase = BatchPhase::Cancelled;
        true
    }

    pub fn snapshot(&self, registry: &StageRegistry) -> BatchSnapshot {
        let sessions = self
            .inputs
            .iter()
            .filter_map(|input| self.sessions.get(input))
            .map(|s| s.snapshot(registry))
            .collect();
        let (state, error) = match &self.phase {
            BatchPhase::Running => (BatchState::Running, None),
            BatchPhase::Completed => (BatchState::Completed, None),
            BatchPhase::Failed(failure) => (BatchState::Failed, Some(failure.clone())),
            BatchPhase::Cancelled => (BatchState::Cancelled, None),
        };
        BatchSnapshot {
            token: self.token,
            inputs: self.inputs.clone(),
            sessions,
            completed: self.completed(),
            total: self.total(),
            state,
            terminal: self.is_terminal(),
            ranked: self.ranked.clone(),
            error,
        }
    }
}

/// Read-only view of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSnapshot {
    pub token: SessionToken,
    pub inputs: Vec<String>,
    /// Per-input snapshots in input order.
    pub sessions: Vec<SessionSnapshot>,
    pub completed: usize,
    pub total: usize,
    pub state: BatchState,
    pub terminal: bool,
    pub ranked: Vec<RankedResult>,
    pub error: Option<SessionFailure>,
}
