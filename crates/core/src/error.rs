/// Errors raised while building a stage registry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry must declare at least one sub-task")]
    Empty,

    #[error("Duplicate sub-task id: {0}")]
    DuplicateTask(String),

    #[error("Stage {stage} is claimed by both {first} and {second}")]
    DuplicateStage {
        stage: String,
        first: String,
        second: String,
    },

    #[error("Only one synthesis sub-task is allowed, found {0} and {1}")]
    MultipleSynthesis(String, String),

    #[error("Unknown pipeline '{0}'. Must be one of: standard, extended")]
    UnknownPipeline(String),
}
