//! Pipeline status resolution.
//!
//! Derives a display status for every sub-task from what a session knows
//! at one instant: the last stage the server reported, the sub-task
//! results received so far and whether the job has finished. The server
//! does not report every sub-task's status on every event, so most
//! statuses are inferred from the stage and the registry order.
//!
//! [`resolve`] is pure: identical inputs always give identical output.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::{StageKind, StageRegistry, SubTask};
use crate::session::SubTaskResult;
use crate::stage::JobStage;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Display status of one sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// No job has been started for this input.
    Idle,
    /// Not reached yet.
    Pending,
    /// Currently executing.
    Running,
    Success,
    Error,
}

/// Everything the resolver looks at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    /// Last stage reported by the server, if any.
    pub current_stage: Option<&'a JobStage>,
    /// Sub-task results received so far, keyed by sub-task id.
    pub results: &'a HashMap<String, SubTaskResult>,
    /// A job was started for this input.
    pub job_started: bool,
    /// The job produced its overall successful result.
    pub terminal_success: bool,
    /// Highest registry position the session has reached so far.
    pub furthest_position: Option<usize>,
}

/// Resolved status of one sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub position: usize,
    pub status: SubTaskStatus,
}

/// Resolved status of a whole pipeline, in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub tasks: Vec<TaskStatus>,
    /// The job produced its final result, or the server reported `complete`.
    pub job_complete: bool,
}

impl PipelineStatus {
    /// Status of a single sub-task by id.
    pub fn status_of(&self, id: &str) -> Option<SubTaskStatus> {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.status)
    }

    /// Number of sub-tasks in the given status.
    pub fn count(&self, status: SubTaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Ids of sub-tasks that resolved to [`SubTaskStatus::Error`].
    pub fn failed_tasks(&self) -> impl Iterator<Item = &str> {
        self.tasks
            .iter()
            .filter(|t| t.status == SubTaskStatus::Error)
            .map(|t| t.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Compute the status of every sub-task in `registry`.
pub fn resolve(registry: &StageRegistry, input: &ResolveInput<'_>) -> PipelineStatus {
    let stage_kind = input.current_stage.map(|stage| registry.classify(stage));

    // Everything strictly before this position has already run.
    let stage_position = match stage_kind {
        Some(StageKind::Subtask(task)) => Some(task.position),
        _ => None,
    };
    let passed_before = match (stage_position, input.furthest_position) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    let tasks = registry
        .tasks()
        .iter()
        .map(|task| TaskStatus {
            id: task.id.clone(),
            position: task.position,
            status: resolve_task(task, input, passed_before),
        })
        .collect();

    let stage_complete = matches!(input.current_stage, Some(JobStage::Complete));

    PipelineStatus {
        tasks,
        job_complete: input.terminal_success || stage_complete,
    }
}

fn resolve_task(
    task: &SubTask,
    input: &ResolveInput<'_>,
    passed_before: Option<usize>,
) -> SubTaskStatus {
    if !input.job_started && !input.terminal_success {
        return SubTaskStatus::Idle;
    }

    if task.synthesis {
        if input.terminal_success {
            return SubTaskStatus::Success;
        }
    } else if let Some(result) = input.results.get(&task.id) {
        return if result.success {
            SubTaskStatus::Success
        } else {
            SubTaskStatus::Error
        };
    }

    let Some(stage) = input.current_stage else {
        return SubTaskStatus::Pending;
    };

    if task.running_stage.as_deref() == Some(stage.as_str()) {
        return SubTaskStatus::Running;
    }

    if passed_before.is_some_and(|limit| task.position < limit) {
        return SubTaskStatus::Success;
    }

    if stage.is_terminal_success() {
        return SubTaskStatus::Success;
    }

    SubTaskStatus::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PipelineKind;

    fn streaming<'a>(
        stage: &'a JobStage,
        results: &'a HashMap<String, SubTaskResult>,
    ) -> ResolveInput<'a> {
        ResolveInput {
            current_stage: Some(stage),
            results,
            job_started: true,
            terminal_success: false,
            furthest_position: None,
        }
    }

    fn statuses(status: &PipelineStatus) -> Vec<(&str, SubTaskStatus)> {
        status.tasks.iter().map(|t| (t.id.as_str(), t.status)).collect()
    }

    #[test]
    fn not_started_is_idle() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::new();
        let input = ResolveInput {
            current_stage: None,
            results: &results,
            job_started: false,
            terminal_success: false,
            furthest_position: None,
        };
        let status = resolve(&registry, &input);
        assert_eq!(status.count(SubTaskStatus::Idle), 6);
        assert!(!status.job_complete);
    }

    #[test]
    fn started_without_stage_is_pending() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::new();
        let input = ResolveInput {
            current_stage: None,
            results: &results,
            job_started: true,
            terminal_success: false,
            furthest_position: None,
        };
        assert_eq!(resolve(&registry, &input).count(SubTaskStatus::Pending), 6);
    }

    #[test]
    fn stage_marks_running_and_earlier_tasks_passed() {
        let registry = PipelineKind::Standard.registry();
        let stage = JobStage::parse("running_news");
        let results = HashMap::new();
        let status = resolve(&registry, &streaming(&stage, &results));
        assert_eq!(
            statuses(&status),
            [
                ("market", SubTaskStatus::Success),
                ("fundamentals", SubTaskStatus::Success),
                ("news", SubTaskStatus::Running),
                ("technical", SubTaskStatus::Pending),
                ("sentiment", SubTaskStatus::Pending),
                ("solution", SubTaskStatus::Pending),
            ]
        );
    }

    #[test]
    fn result_overrides_stage_inference() {
        let registry = PipelineKind::Standard.registry();
        // Technical finished early and failed while market still runs.
        let stage = JobStage::parse("running_market");
        let results = HashMap::from([("technical".to_string(), SubTaskResult::failed())]);
        let status = resolve(&registry, &streaming(&stage, &results));
        assert_eq!(status.status_of("market"), Some(SubTaskStatus::Running));
        assert_eq!(status.status_of("technical"), Some(SubTaskStatus::Error));
        assert_eq!(status.status_of("news"), Some(SubTaskStatus::Pending));
    }

    #[test]
    fn result_beats_running_marker() {
        let registry = PipelineKind::Standard.registry();
        let stage = JobStage::parse("running_news");
        let results = HashMap::from([("news".to_string(), SubTaskResult::succeeded())]);
        let status = resolve(&registry, &streaming(&stage, &results));
        assert_eq!(status.status_of("news"), Some(SubTaskStatus::Success));
    }

    #[test]
    fn unknown_stage_infers_nothing() {
        let registry = PipelineKind::Standard.registry();
        let stage = JobStage::parse("warming_up");
        let results = HashMap::new();
        let status = resolve(&registry, &streaming(&stage, &results));
        assert_eq!(status.count(SubTaskStatus::Pending), 6);
    }

    #[test]
    fn saving_marks_everything_done() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::new();
        let status = resolve(&registry, &streaming(&JobStage::Saving, &results));
        assert_eq!(status.count(SubTaskStatus::Success), 6);
        assert!(!status.job_complete);
    }

    #[test]
    fn complete_stage_flags_job_complete() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::new();
        let status = resolve(&registry, &streaming(&JobStage::Complete, &results));
        assert!(status.job_complete);
    }

    #[test]
    fn error_stage_keeps_unfinished_tasks_pending() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::from([("market".to_string(), SubTaskResult::succeeded())]);
        let status = resolve(&registry, &streaming(&JobStage::Error, &results));
        assert_eq!(status.status_of("market"), Some(SubTaskStatus::Success));
        assert_eq!(status.status_of("fundamentals"), Some(SubTaskStatus::Pending));
        assert_eq!(status.status_of("solution"), Some(SubTaskStatus::Pending));
    }

    #[test]
    fn synthesis_ignores_its_own_result_entry() {
        let registry = PipelineKind::Standard.registry();
        let stage = JobStage::parse("synthesizing");
        let results = HashMap::from([("solution".to_string(), SubTaskResult::failed())]);
        let status = resolve(&registry, &streaming(&stage, &results));
        assert_eq!(status.status_of("solution"), Some(SubTaskStatus::Running));
    }

    #[test]
    fn terminal_success_without_start_is_not_idle() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::new();
        let input = ResolveInput {
            current_stage: None,
            results: &results,
            job_started: false,
            terminal_success: true,
            furthest_position: None,
        };
        let status = resolve(&registry, &input);
        assert_eq!(status.status_of("solution"), Some(SubTaskStatus::Success));
        assert_eq!(status.status_of("market"), Some(SubTaskStatus::Pending));
        assert!(status.job_complete);
    }

    #[test]
    fn furthest_position_holds_passed_tasks() {
        let registry = PipelineKind::Standard.registry();
        // Server went back to an earlier stage after reaching sentiment.
        let stage = JobStage::parse("running_fundamentals");
        let results = HashMap::new();
        let input = ResolveInput {
            furthest_position: Some(4),
            ..streaming(&stage, &results)
        };
        let status = resolve(&registry, &input);
        assert_eq!(status.status_of("market"), Some(SubTaskStatus::Success));
        assert_eq!(status.status_of("fundamentals"), Some(SubTaskStatus::Running));
        assert_eq!(status.status_of("news"), Some(SubTaskStatus::Success));
        assert_eq!(status.status_of("technical"), Some(SubTaskStatus::Success));
        assert_eq!(status.status_of("sentiment"), Some(SubTaskStatus::Pending));
    }

    #[test]
    fn failed_tasks_lists_errors() {
        let registry = PipelineKind::Standard.registry();
        let results = HashMap::from([
            ("news".to_string(), SubTaskResult::failed()),
            ("market".to_string(), SubTaskResult::succeeded()),
        ]);
        let status = resolve(&registry, &streaming(&JobStage::Complete, &results));
        assert_eq!(status.failed_tasks().collect::<Vec<_>>(), ["news"]);
    }
}
