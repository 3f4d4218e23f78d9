//! Deadline reminders and stall detection.
//!
//! [`ReminderScheduler`] owns one background task. It runs a stall check as
//! soon as it starts and then a full tick (reminders plus stall check) every
//! period. Ticks never overlap: a tick requested while another is running is
//! skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::ceil_days;
use crate::external::{NotificationKind, NotificationSink};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowResult};

pub const DEFAULT_STALL_THRESHOLD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderFrequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl ReminderFrequency {
    pub fn as_millis(&self) -> u64 {
        match self {
            ReminderFrequency::Hourly => 3_600_000,
            ReminderFrequency::Daily => 86_400_000,
            ReminderFrequency::Weekly => 604_800_000,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }
}

impl std::str::FromStr for ReminderFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(ReminderFrequency::Hourly),
            "daily" => Ok(ReminderFrequency::Daily),
            "weekly" => Ok(ReminderFrequency::Weekly),
            other => Err(format!("unknown reminder frequency: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub frequency: ReminderFrequency,
    pub stall_threshold_days: i64,
    pub deadline_approach_days: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            frequency: ReminderFrequency::default(),
            stall_threshold_days: DEFAULT_STALL_THRESHOLD_DAYS,
            deadline_approach_days: crate::workflow::engine::DEFAULT_DEADLINE_APPROACH_DAYS,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub approaching: usize,
    pub overdue: usize,
    pub stalled: usize,
    pub reminders_sent: usize,
    pub stall_notices_sent: usize,
    pub failed_notifications: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick was still running.
    Skipped,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Clears the in-progress flag when the tick ends, however it ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct ReminderBatch {
    approaching: Vec<Value>,
    overdue: Vec<Value>,
}

pub struct ReminderScheduler {
    engine: Arc<WorkflowEngine>,
    notifier: Arc<dyn NotificationSink>,
    settings: SchedulerSettings,
    ticking: AtomicBool,
    task: Mutex<Option<RunningTask>>,
}

impl std::fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ReminderScheduler {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        notifier: Arc<dyn NotificationSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            engine,
            notifier,
            settings,
            ticking: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::Acquire)
    }

    /// Spawns the background task. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Reminder scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let period = self.settings.frequency.period();

        let handle = tokio::spawn(async move {
            if let TickOutcome::Completed(report) = scheduler.run_stall_check().await {
                debug!(stalled = report.stalled, "Startup stall check finished");
            }

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match scheduler.run_tick().await {
                            TickOutcome::Completed(report) => debug!(
                                reminders = report.reminders_sent,
                                stall_notices = report.stall_notices_sent,
                                "Scheduler tick finished"
                            ),
                            TickOutcome::Skipped => debug!("Scheduler tick skipped, previous tick still running"),
                        }
                    }
                }
            }
            debug!("Reminder scheduler loop exited");
        });

        info!(
            frequency = ?self.settings.frequency,
            period_ms = self.settings.frequency.as_millis(),
            "Reminder scheduler started"
        );
        *slot = Some(RunningTask { cancel, handle });
        true
    }

    /// Cancels the background task and waits for it to finish, including a
    /// tick that is in flight.
    pub async fn stop(&self) {
        let running = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Reminder scheduler task ended abnormally");
        }
        info!("Reminder scheduler stopped");
    }

    fn begin_tick(&self) -> Option<TickGuard<'_>> {
        self.ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard(&self.ticking))
    }

    /// Sends deadline reminders and then runs the stall check.
    pub async fn run_tick(&self) -> TickOutcome {
        let Some(_guard) = self.begin_tick() else {
            return TickOutcome::Skipped;
        };

        let mut report = TickReport::default();
        if let Err(e) = self.send_reminders(&mut report).await {
            error!(error = %e, "Deadline reminder pass failed");
            report.errors.push(e.to_string());
        }
        if let Err(e) = self.send_stall_notices(&mut report).await {
            error!(error = %e, "Stall check failed");
            report.errors.push(e.to_string());
        }
        TickOutcome::Completed(report)
    }

    pub async fn run_stall_check(&self) -> TickOutcome {
        let Some(_guard) = self.begin_tick() else {
            return TickOutcome::Skipped;
        };

        let mut report = TickReport::default();
        if let Err(e) = self.send_stall_notices(&mut report).await {
            error!(error = %e, "Stall check failed");
            report.errors.push(e.to_string());
        }
        TickOutcome::Completed(report)
    }

    async fn send_reminders(&self, report: &mut TickReport) -> WorkflowResult<()> {
        let now = self.engine.now();
        let approaching = self
            .engine
            .get_approaching_deadlines(Some(self.settings.deadline_approach_days))
            .await?;
        let overdue = self.engine.get_overdue_content().await?;
        report.approaching = approaching.len();
        report.overdue = overdue.len();

        let mut batches: BTreeMap<String, ReminderBatch> = BTreeMap::new();
        for workflow in &approaching {
            let Some(deadline) = workflow.deadline else { continue };
            let item = reminder_item(workflow, deadline, ceil_days(deadline - now));
            for assignee in &workflow.assignees {
                batches.entry(assignee.clone()).or_default().approaching.push(item.clone());
            }
        }
        for workflow in &overdue {
            let Some(deadline) = workflow.deadline else { continue };
            let item = reminder_item(workflow, deadline, ceil_days(now - deadline));
            for assignee in &workflow.assignees {
                batches.entry(assignee.clone()).or_default().overdue.push(item.clone());
            }
        }

        for (assignee, batch) in batches {
            let payload = json!({
                "approaching": batch.approaching,
                "overdue": batch.overdue,
            });
            match self
                .notifier
                .send_notification(&assignee, NotificationKind::WorkflowReminder, payload)
                .await
            {
                Ok(()) => report.reminders_sent += 1,
                Err(e) => {
                    report.failed_notifications += 1;
                    warn!(user_id = %assignee, error = %e, "Failed to send workflow reminder");
                }
            }
        }

        info!(
            approaching = report.approaching,
            overdue = report.overdue,
            reminders = report.reminders_sent,
            "Deadline reminders sent"
        );
        Ok(())
    }

    async fn send_stall_notices(&self, report: &mut TickReport) -> WorkflowResult<()> {
        let now = self.engine.now();
        let stalled = self
            .engine
            .get_stalled_workflows(self.settings.stall_threshold_days)
            .await?;
        report.stalled = stalled.len();

        for workflow in &stalled {
            let payload = stall_payload(workflow, now);
            for assignee in &workflow.assignees {
                match self
                    .notifier
                    .send_notification(assignee, NotificationKind::WorkflowStalled, payload.clone())
                    .await
                {
                    Ok(()) => report.stall_notices_sent += 1,
                    Err(e) => {
                        report.failed_notifications += 1;
                        warn!(
                            user_id = %assignee,
                            workflow_id = %workflow.workflow_id,
                            error = %e,
                            "Failed to send stall notice"
                        );
                    }
                }
            }
        }

        if !stalled.is_empty() {
            info!(
                stalled = report.stalled,
                notices = report.stall_notices_sent,
                "Stalled workflows flagged"
            );
        }
        Ok(())
    }
}

fn reminder_item(workflow: &Workflow, deadline: DateTime<Utc>, days: i64) -> Value {
    json!({
        "workflow_id": workflow.workflow_id,
        "content_id": workflow.content_id,
        "content_title": workflow.content_title,
        "stage": workflow.current_stage(),
        "deadline": deadline,
        "days": days,
    })
}

fn stall_payload(workflow: &Workflow, now: DateTime<Utc>) -> Value {
    json!({
        "workflow_id": workflow.workflow_id,
        "content_id": workflow.content_id,
        "content_title": workflow.content_title,
        "stage": workflow.current_stage(),
        "updated_at": workflow.updated_at,
        "days_stalled": (now - workflow.updated_at).num_days(),
    })
}
