//! Notification sink collaborator.
//!
//! Delivery is fire-and-forget from the workflow subsystem's point of view:
//! callers log a failed dispatch and move on.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Assigned,
    StageChanged,
    DeadlineUpdated,
    ContentRejected,
    WorkflowReminder,
    WorkflowStalled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Assigned => "assigned",
            NotificationKind::StageChanged => "stage_changed",
            NotificationKind::DeadlineUpdated => "deadline_updated",
            NotificationKind::ContentRejected => "content_rejected",
            NotificationKind::WorkflowReminder => "workflow_reminder",
            NotificationKind::WorkflowStalled => "workflow_stalled",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<()>;
}

/// Emits every notification as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        info!(user_id = %user_id, kind = %kind, payload = %payload, "Notification dispatched");
        Ok(())
    }
}

/// Keeps every notification in memory, in dispatch order.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.kind == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn send_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Notification {
                user_id: user_id.to_string(),
                kind,
                payload,
            });
        Ok(())
    }
}
