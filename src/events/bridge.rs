//! Drives workflow transitions from content lifecycle events.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::workflow::{ChangeOptions, Stage, Workflow, WorkflowEngine, SYSTEM_USER};

use super::bus::{EventBus, EventHandler};
use super::types::{ContentEvent, Topic};

pub const AUTO_PROGRESS_NOTE: &str = "auto-progressed after update";

/// What the bridge did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// No workflow tracks the content.
    NoWorkflow,
    /// The event did not apply to the workflow's current state.
    Ignored,
    Advanced { workflow_id: String, to_stage: String },
    Rejected { workflow_id: String },
}

#[derive(Debug)]
pub struct EventBridge {
    engine: Weak<WorkflowEngine>,
    auto_progress_enabled: bool,
}

impl EventBridge {
    pub fn new(engine: &Arc<WorkflowEngine>, auto_progress_enabled: bool) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            auto_progress_enabled,
        }
    }

    /// Subscribes the bridge to `content.updated` and `content.reviewed`.
    pub fn register(self: Arc<Self>, bus: &dyn EventBus) {
        bus.subscribe(Topic::ContentUpdated, self.clone());
        bus.subscribe(Topic::ContentReviewed, self);
    }

    fn engine(&self) -> Result<Arc<WorkflowEngine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| anyhow!("workflow engine has been shut down"))
    }

    pub async fn on_content_updated(&self, content_id: &str) -> Result<BridgeOutcome> {
        if !self.auto_progress_enabled {
            return Ok(BridgeOutcome::Ignored);
        }
        let engine = self.engine()?;
        let Some(workflow) = engine.get_workflow_for_content(content_id).await? else {
            return Ok(BridgeOutcome::NoWorkflow);
        };

        let first = engine.stages().first().clone();
        if workflow.current_stage() != &first {
            debug!(
                workflow_id = %workflow.workflow_id,
                stage = %workflow.current_stage(),
                "Content updated outside the initial stage, nothing to progress"
            );
            return Ok(BridgeOutcome::Ignored);
        }

        let options = ChangeOptions::by(SYSTEM_USER).with_notes(AUTO_PROGRESS_NOTE);
        let updated = engine
            .advance_from(&workflow.workflow_id, &first, options)
            .await?;
        Ok(advance_outcome(workflow.current_stage(), updated))
    }

    pub async fn on_content_reviewed(
        &self,
        content_id: &str,
        approved: bool,
        reviewer: &str,
        comments: Option<&str>,
    ) -> Result<BridgeOutcome> {
        let engine = self.engine()?;
        let Some(workflow) = engine.get_workflow_for_content(content_id).await? else {
            return Ok(BridgeOutcome::NoWorkflow);
        };

        if !approved {
            let rejected = engine
                .record_rejection(&workflow.workflow_id, reviewer, comments)
                .await?;
            return Ok(BridgeOutcome::Rejected {
                workflow_id: rejected.workflow_id,
            });
        }

        let mut options = ChangeOptions::by(reviewer);
        if let Some(comments) = comments {
            options = options.with_notes(comments);
        }
        let updated = engine
            .advance_from(&workflow.workflow_id, workflow.current_stage(), options)
            .await?;
        Ok(advance_outcome(workflow.current_stage(), updated))
    }
}

fn advance_outcome(seen_stage: &Stage, updated: Workflow) -> BridgeOutcome {
    if updated.current_stage() == seen_stage {
        return BridgeOutcome::Ignored;
    }
    info!(
        workflow_id = %updated.workflow_id,
        to_stage = %updated.current_stage(),
        "Workflow advanced by event"
    );
    BridgeOutcome::Advanced {
        to_stage: updated.current_stage().to_string(),
        workflow_id: updated.workflow_id,
    }
}

#[async_trait]
impl EventHandler for EventBridge {
    async fn handle(&self, event: ContentEvent) -> Result<()> {
        let outcome = match &event {
            ContentEvent::Updated { content_id, .. } => self.on_content_updated(content_id).await?,
            ContentEvent::Reviewed {
                content_id,
                approved,
                reviewer,
                comments,
            } => {
                self.on_content_reviewed(content_id, *approved, reviewer, comments.as_deref())
                    .await?
            }
            ContentEvent::Published { .. } => BridgeOutcome::Ignored,
        };
        debug!(topic = %event.topic(), content_id = %event.content_id(), outcome = ?outcome, "Event handled");
        Ok(())
    }
}
