// Content Workflow Library - editorial stage tracking, reminders and analytics
// This exposes the core components for testing and integration

pub mod analytics;
pub mod cli;
pub mod clock;
pub mod config;
pub mod events;
pub mod external;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use analytics::{format_report, ReportOptions, WorkflowAnalyzer, WorkflowReport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::ContentWorkflowConfig;
pub use events::{BridgeOutcome, ContentEvent, EventBridge, EventBus, EventHandler, InProcessEventBus, Topic};
pub use external::{ContentStore, ContentSummary, Notification, NotificationKind, NotificationSink};
pub use scheduler::{ReminderFrequency, ReminderScheduler, SchedulerSettings, TickOutcome, TickReport};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{init_telemetry, workflow_span};
pub use workflow::{
    ChangeOptions, CreateWorkflowOptions, EngineCollaborators, Stage, StageSet, TransitionRecord,
    Workflow, WorkflowEngine, WorkflowError, WorkflowResult,
};
