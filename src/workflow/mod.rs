//! Workflow tracking: stages, persistence and the state machine that drives
//! content from draft to publication.

pub mod engine;
pub mod errors;
pub mod locks;
pub mod stage;
pub mod store;
pub mod transition_log;
pub mod types;

pub use engine::{EngineCollaborators, WorkflowEngine};
pub use errors::{ConfigError, StoreError, WorkflowError, WorkflowResult};
pub use stage::{Stage, StageSet};
pub use store::{InMemoryWorkflowStore, JsonFileWorkflowStore, WorkflowQuery, WorkflowStore};
pub use transition_log::{InMemoryTransitionLog, JsonlTransitionLog, TransitionLog};
pub use types::{
    ChangeOptions, CreateWorkflowOptions, HistoryEntry, Priority, StageHistory, StageQueryOptions,
    TransitionKind, TransitionRecord, Workflow, WorkflowSort, SYSTEM_USER,
};
