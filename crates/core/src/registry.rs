//! Static stage tables (the "stage registry").
//!
//! A registry is the fixed, ordered list of sub-tasks a deployment runs,
//! each with the stage string the server emits while that sub-task is
//! executing. Two tables ship built in; which one applies is a
//! deployment setting, not a per-session choice.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::stage::JobStage;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const TASK_MARKET: &str = "market";
pub const TASK_FUNDAMENTALS: &str = "fundamentals";
pub const TASK_NEWS: &str = "news";
pub const TASK_TECHNICAL: &str = "technical";
pub const TASK_SENTIMENT: &str = "sentiment";
pub const TASK_MACRO: &str = "macro";
pub const TASK_RISK: &str = "risk";
pub const TASK_SOLUTION: &str = "solution";

pub const PIPELINE_STANDARD: &str = "standard";
pub const PIPELINE_EXTENDED: &str = "extended";

/// `(task id, running-marker stage, synthesis)` rows of the 6-step table.
const STANDARD_TABLE: &[(&str, &str, bool)] = &[
    (TASK_MARKET, "running_market", false),
    (TASK_FUNDAMENTALS, "running_fundamentals", false),
    (TASK_NEWS, "running_news", false),
    (TASK_TECHNICAL, "running_technical", false),
    (TASK_SENTIMENT, "analyzing_sentiment", false),
    (TASK_SOLUTION, "synthesizing", true),
];

/// `(task id, running-marker stage, synthesis)` rows of the 8-step table.
const EXTENDED_TABLE: &[(&str, &str, bool)] = &[
    (TASK_MARKET, "running_market", false),
    (TASK_FUNDAMENTALS, "running_fundamentals", false),
    (TASK_NEWS, "running_news", false),
    (TASK_TECHNICAL, "running_technical", false),
    (TASK_SENTIMENT, "analyzing_sentiment", false),
    (TASK_MACRO, "running_macro", false),
    (TASK_RISK, "assessing_risk", false),
    (TASK_SOLUTION, "synthesizing", true),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One declared pipeline unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubTask {
    /// Stable identifier, also the key of per-task results on the wire.
    pub id: String,
    /// Zero-based display and execution order.
    pub position: usize,
    /// Stage emitted while this sub-task executes, if the server reports one.
    pub running_stage: Option<String>,
    /// The synthesis step has no discrete result; it finishes with the job.
    pub synthesis: bool,
}

/// How a stage relates to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind<'a> {
    /// The stage marks this sub-task as running.
    Subtask(&'a SubTask),
    /// `saving` / `complete`.
    TerminalSuccess,
    /// `error`.
    Failed,
    /// Not known to this registry.
    Unknown,
}

/// Which built-in table a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Six steps: five analysts plus synthesis.
    #[default]
    Standard,
    /// Eight steps: seven analysts plus synthesis.
    Extended,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => PIPELINE_STANDARD,
            Self::Extended => PIPELINE_EXTENDED,
        }
    }

    /// Build the registry for this pipeline.
    pub fn registry(&self) -> StageRegistry {
        let table = match self {
            Self::Standard => STANDARD_TABLE,
            Self::Extended => EXTENDED_TABLE,
        };
        StageRegistry::from_table(table)
    }
}

impl FromStr for PipelineKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            PIPELINE_STANDARD => Ok(Self::Standard),
            PIPELINE_EXTENDED => Ok(Self::Extended),
            other => Err(RegistryError::UnknownPipeline(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StageRegistry
// ---------------------------------------------------------------------------

/// Ordered sub-task table with stage and id lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRegistry {
    tasks: Vec<SubTask>,
    by_stage: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
}

impl StageRegistry {
    /// Build a registry from `(id, running_stage, synthesis)` tuples.
    ///
    /// Positions follow declaration order.
    pub fn new<I, S>(tasks: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, Option<S>, bool)>,
        S: Into<String>,
    {
        let mut registry = Self {
            tasks: Vec::new(),
            by_stage: HashMap::new(),
            by_id: HashMap::new(),
        };
        let mut synthesis: Option<String> = None;

        for (position, (id, running_stage, is_synthesis)) in tasks.into_iter().enumerate() {
            let id = id.into();
            let running_stage = running_stage.map(Into::into);

            if registry.by_id.contains_key(&id) {
                return Err(RegistryError::DuplicateTask(id));
            }
            if is_synthesis {
                if let Some(existing) = &synthesis {
                    return Err(RegistryError::MultipleSynthesis(existing.clone(), id));
                }
                synthesis = Some(id.clone());
            }
            if let Some(stage) = &running_stage {
                if let Some(&other) = registry.by_stage.get(stage) {
                    return Err(RegistryError::DuplicateStage {
                        stage: stage.clone(),
                        first: registry.tasks[other].id.clone(),
                        second: id,
                    });
                }
                registry.by_stage.insert(stage.clone(), position);
            }

            registry.by_id.insert(id.clone(), position);
            registry.tasks.push(SubTask {
                id,
                position,
                running_stage,
                synthesis: is_synthesis,
            });
        }

        if registry.tasks.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(registry)
    }

    fn from_table(table: &[(&str, &str, bool)]) -> Self {
        let tasks = table.iter().enumerate().map(|(position, (id, stage, synthesis))| SubTask {
            id: id.to_string(),
            position,
            running_stage: Some(stage.to_string()),
            synthesis: *synthesis,
        });
        let tasks: Vec<SubTask> = tasks.collect();
        let by_stage = tasks
            .iter()
            .filter_map(|t| t.running_stage.clone().map(|s| (s, t.position)))
            .collect();
        let by_id = tasks.iter().map(|t| (t.id.clone(), t.position)).collect();
        Self {
            tasks,
            by_stage,
            by_id,
        }
    }

    /// All sub-tasks in pipeline order.
    pub fn tasks(&self) -> &[SubTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SubTask> {
        self.by_id.get(id).map(|&i| &self.tasks[i])
    }

    /// The sub-task whose running marker is `stage`.
    pub fn subtask_for_stage(&self, stage: &str) -> Option<&SubTask> {
        self.by_stage.get(stage).map(|&i| &self.tasks[i])
    }

    /// Ordinal position of a sub-task id.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// The synthesis sub-task, if the table declares one.
    pub fn synthesis(&self) -> Option<&SubTask> {
        self.tasks.iter().find(|t| t.synthesis)
    }

    /// Classify a stage against this table.
    pub fn classify(&self, stage: &JobStage) -> StageKind<'_> {
        match stage {
            JobStage::Saving | JobStage::Complete => StageKind::TerminalSuccess,
            JobStage::Error => StageKind::Failed,
            JobStage::Named(name) => match self.subtask_for_stage(name) {
                Some(task) => StageKind::Subtask(task),
                None => StageKind::Unknown,
            },
        }
    }
}
