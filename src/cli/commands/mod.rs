use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

use crate::config::ContentWorkflowConfig;
use crate::events::{EventBridge, EventBus, InProcessEventBus};
use crate::external::{JsonFileContentStore, TracingNotificationSink};
use crate::scheduler::ReminderScheduler;
use crate::workflow::{
    EngineCollaborators, JsonFileWorkflowStore, JsonlTransitionLog, Workflow, WorkflowEngine,
};

pub mod content;
pub mod events;
pub mod remind;
pub mod report;
pub mod workflow;

/// Everything a command needs, wired over the file-backed stores in the
/// configured data directory.
pub struct WorkflowApp {
    pub config: ContentWorkflowConfig,
    pub engine: Arc<WorkflowEngine>,
    pub content: Arc<JsonFileContentStore>,
    pub bus: Arc<InProcessEventBus>,
    pub bridge: Arc<EventBridge>,
    pub notifier: Arc<TracingNotificationSink>,
}

impl WorkflowApp {
    pub async fn open(config: ContentWorkflowConfig) -> Result<Self> {
        let stages = config.stage_set()?;
        let storage = &config.storage;

        let store = JsonFileWorkflowStore::open(storage.workflows_path())
            .await
            .with_context(|| format!("opening {}", storage.workflows_path().display()))?;
        let log = JsonlTransitionLog::open(storage.transitions_path())
            .await
            .with_context(|| format!("opening {}", storage.transitions_path().display()))?;
        let content = Arc::new(JsonFileContentStore::open(storage.content_path()).await?);
        let bus = Arc::new(InProcessEventBus::new());
        let notifier = Arc::new(TracingNotificationSink);

        let engine = Arc::new(
            WorkflowEngine::new(
                stages,
                EngineCollaborators {
                    store: Arc::new(store),
                    log: Arc::new(log),
                    content: content.clone(),
                    notifier: notifier.clone(),
                    events: bus.clone(),
                },
            )
            .with_deadline_approach_days(config.workflow.deadline_approach_days),
        );

        let strays = engine.workflows_outside_stages().await?;
        if !strays.is_empty() {
            println!(
                "⚠️  {} workflow(s) sit in stages missing from the configuration; they are left out of stage counts",
                strays.len()
            );
        }

        let bridge = Arc::new(EventBridge::new(&engine, config.workflow.auto_progress_enabled));
        bridge.clone().register(bus.as_ref() as &dyn EventBus);

        Ok(Self {
            config,
            engine,
            content,
            bus,
            bridge,
            notifier,
        })
    }

    pub fn scheduler(&self) -> Arc<ReminderScheduler> {
        Arc::new(ReminderScheduler::new(
            self.engine.clone(),
            self.notifier.clone(),
            self.config.scheduler_settings(),
        ))
    }
}

/// Accepts RFC 3339 timestamps or plain dates (midnight UTC).
pub fn parse_deadline(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("'{input}' is neither RFC 3339 nor YYYY-MM-DD"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("'{input}' has no midnight"))?;
    Ok(midnight.and_utc())
}

pub fn print_workflow_line(workflow: &Workflow) {
    let deadline = workflow
        .deadline
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let assignees = if workflow.assignees.is_empty() {
        "-".to_string()
    } else {
        workflow.assignees.iter().cloned().collect::<Vec<_>>().join(",")
    };
    println!(
        "   {}  {:<10} {:<28} due {}  [{}]",
        workflow.workflow_id,
        workflow.current_stage(),
        workflow.content_title,
        deadline,
        assignees
    );
}

pub fn show_getting_started() {
    println!("📝 content-workflow - Editorial workflow tracking");
    println!();
    println!("To get started:");
    println!("  ➕ content-workflow add-content C1 --title \"Launch post\"   # Register content");
    println!("  🚀 content-workflow create C1 --assignee ann              # Start a workflow");
    println!("  ➡️  content-workflow stage <workflow-id> review            # Move it along");
    println!();
    println!("Keeping track:");
    println!("  📋 content-workflow list draft       # What is waiting where");
    println!("  ⏰ content-workflow approaching      # Deadlines coming up");
    println!("  📊 content-workflow report           # Bottlenecks and throughput");
    println!("  👀 content-workflow watch            # Send reminders on schedule");
}
