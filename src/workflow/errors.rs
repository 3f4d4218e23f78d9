use thiserror::Error;

/// Errors surfaced to callers of the workflow engine.
///
/// The first four variants are validation failures and leave persisted state
/// untouched.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("A workflow already exists for content {0}")]
    DuplicateWorkflow(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Concurrent update lost for workflow {workflow_id} after {attempts} attempts")]
    Concurrency { workflow_id: String, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

/// Failures of the workflow and transition-log persistence layers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Content {0} already has a workflow")]
    DuplicateContent(String),

    #[error("Workflow {0} is not stored")]
    NotFound(String),

    #[error("Version conflict on workflow {workflow_id}: expected {expected}, found {found}")]
    VersionConflict {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("At least one stage must be configured")]
    NoStages,

    #[error("Stage names must not be empty")]
    EmptyStageName,

    #[error("Stage {0} is configured more than once")]
    DuplicateStage(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
