//! Collaborators the workflow subsystem talks to but does not own.
//!
//! Each one is a narrow trait so tests and embedders can swap in their own
//! implementation.

pub mod content;
pub mod notifications;

pub use content::{ContentStore, ContentSummary, InMemoryContentStore, JsonFileContentStore};
pub use notifications::{
    Notification, NotificationKind, NotificationSink, RecordingNotificationSink,
    TracingNotificationSink,
};
