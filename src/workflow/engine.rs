//! Workflow state machine.
//!
//! The engine is the only writer of workflows and transition records. Every
//! mutation follows the same path:
//!
//! 1. take the per-workflow lock,
//! 2. read the current workflow and decide on the change (or a no-op),
//! 3. write the workflow conditionally on its version,
//! 4. append the transition record, restoring the previous snapshot if the
//!    append fails,
//! 5. release the lock and run side effects (notifications, publishing).
//!
//! Side effects run after the commit; their failures are logged and never
//! undo a committed transition.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{shift_days, SharedClock, SystemClock};
use crate::events::{ContentEvent, EventBus};
use crate::external::{ContentStore, NotificationKind, NotificationSink};

use super::errors::{StoreError, WorkflowError, WorkflowResult};
use super::locks::WorkflowLocks;
use super::stage::{Stage, StageSet};
use super::store::{WorkflowQuery, WorkflowStore};
use super::transition_log::TransitionLog;
use super::types::{
    ChangeOptions, CreateWorkflowOptions, NewWorkflow, StageQueryOptions, TransitionKind,
    TransitionRecord, Workflow, WorkflowSort, SYSTEM_USER,
};

/// Conditional-update retries before giving up with `Concurrency`.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

pub const DEFAULT_DEADLINE_APPROACH_DAYS: i64 = 3;

/// Everything the engine reads from or writes to.
#[derive(Clone)]
pub struct EngineCollaborators {
    pub store: Arc<dyn WorkflowStore>,
    pub log: Arc<dyn TransitionLog>,
    pub content: Arc<dyn ContentStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub events: Arc<dyn EventBus>,
}

/// A change decided under the workflow lock, not yet committed.
struct PendingChange {
    workflow: Workflow,
    record: TransitionRecord,
}

/// Result of a locked mutation.
struct Applied {
    before: Workflow,
    after: Workflow,
}

impl Applied {
    fn changed(&self) -> bool {
        self.after.version != self.before.version
    }
}

pub struct WorkflowEngine {
    stages: StageSet,
    store: Arc<dyn WorkflowStore>,
    log: Arc<dyn TransitionLog>,
    content: Arc<dyn ContentStore>,
    notifier: Arc<dyn NotificationSink>,
    events: Arc<dyn EventBus>,
    clock: SharedClock,
    locks: WorkflowLocks,
    deadline_approach_days: i64,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("stages", &self.stages)
            .field("deadline_approach_days", &self.deadline_approach_days)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(stages: StageSet, collaborators: EngineCollaborators) -> Self {
        Self {
            stages,
            store: collaborators.store,
            log: collaborators.log,
            content: collaborators.content,
            notifier: collaborators.notifier,
            events: collaborators.events,
            clock: Arc::new(SystemClock),
            locks: WorkflowLocks::new(),
            deadline_approach_days: DEFAULT_DEADLINE_APPROACH_DAYS,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_deadline_approach_days(mut self, days: i64) -> Self {
        self.deadline_approach_days = days;
        self
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn deadline_approach_days(&self) -> i64 {
        self.deadline_approach_days
    }

    pub(crate) fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub(crate) fn log(&self) -> &Arc<dyn TransitionLog> {
        &self.log
    }

    pub(crate) fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    pub async fn create_workflow(
        &self,
        content_id: &str,
        options: CreateWorkflowOptions,
    ) -> WorkflowResult<Workflow> {
        let initial_stage = match options.initial_stage.as_deref() {
            Some(name) => self.stages.resolve(name)?,
            None => self.stages.first().clone(),
        };

        let content = self
            .content
            .find_by_id(content_id)
            .await
            .map_err(|e| WorkflowError::Collaborator(e.to_string()))?
            .ok_or_else(|| WorkflowError::ContentNotFound(content_id.to_string()))?;

        let guard = self.locks.acquire(&format!("content:{content_id}")).await;

        if self.store.find_by_content_id(content_id).await?.is_some() {
            return Err(WorkflowError::DuplicateWorkflow(content_id.to_string()));
        }

        let now = self.clock.now();
        let user = options.user.unwrap_or_else(|| SYSTEM_USER.to_string());
        let workflow = Workflow::new(NewWorkflow {
            workflow_id: Uuid::new_v4().to_string(),
            content_id: content_id.to_string(),
            content_title: content.title,
            content_type: content.content_type,
            initial_stage,
            assignees: normalize_assignees(options.assignees),
            deadline: options.deadline,
            priority: options.priority.unwrap_or_default(),
            metadata: options.metadata,
            user,
            notes: options.notes,
            created_at: now,
        });
        let record = TransitionRecord::from_entry(
            &workflow,
            None,
            TransitionKind::Created,
            workflow.stage_history().last(),
        );

        let workflow = self.store.insert(workflow).await.map_err(|e| match e {
            StoreError::DuplicateContent(id) => WorkflowError::DuplicateWorkflow(id),
            other => other.into(),
        })?;

        if let Err(e) = self.log.append(record).await {
            error!(
                workflow_id = %workflow.workflow_id,
                content_id = %content_id,
                error = %e,
                "Transition log append failed, undoing workflow creation"
            );
            if let Err(undo) = self.store.delete(&workflow.workflow_id).await {
                error!(workflow_id = %workflow.workflow_id, error = %undo, "Failed to undo workflow creation");
            }
            return Err(e.into());
        }
        drop(guard);

        info!(
            workflow_id = %workflow.workflow_id,
            content_id = %workflow.content_id,
            stage = %workflow.current_stage(),
            "Workflow created"
        );

        let assignees: Vec<String> = workflow.assignees.iter().cloned().collect();
        self.notify(
            &assignees,
            NotificationKind::Assigned,
            json!({
                "workflow_id": workflow.workflow_id,
                "content_id": workflow.content_id,
                "content_title": workflow.content_title,
                "stage": workflow.current_stage(),
            }),
        )
        .await;

        Ok(workflow)
    }

    /// Moves a workflow to `stage`. Moving to the stage it is already in is a
    /// no-op that records nothing.
    ///
    /// Any configured stage can be reached from any other; only event-driven
    /// progression is restricted to single forward steps.
    pub async fn update_stage(
        &self,
        workflow_id: &str,
        stage: &str,
        options: ChangeOptions,
    ) -> WorkflowResult<Workflow> {
        let target = self.stages.resolve(stage)?;
        self.change_stage(workflow_id, options, move |_, _| Some(target.clone()))
            .await
    }

    /// Moves a workflow one stage forward, but only if it is still in
    /// `expected`. Returns the workflow unchanged when it has already moved on
    /// or sits in the terminal stage.
    pub async fn advance_from(
        &self,
        workflow_id: &str,
        expected: &Stage,
        options: ChangeOptions,
    ) -> WorkflowResult<Workflow> {
        let expected = expected.clone();
        self.change_stage(workflow_id, options, move |workflow, stages| {
            if workflow.current_stage() != &expected {
                return None;
            }
            stages.next(&expected).cloned()
        })
        .await
    }

    pub async fn update_assignees(
        &self,
        workflow_id: &str,
        assignees: Vec<String>,
        options: ChangeOptions,
    ) -> WorkflowResult<Workflow> {
        let next = normalize_assignees(assignees);
        let user = user_or_system(&options);

        let applied = self
            .apply(workflow_id, |workflow, now| {
                if workflow.assignees == next {
                    return None;
                }
                let added: Vec<&String> = next.difference(&workflow.assignees).collect();
                let removed: Vec<&String> = workflow.assignees.difference(&next).collect();
                let notes = options
                    .notes
                    .clone()
                    .unwrap_or_else(|| describe_assignee_change(&added, &removed));

                let mut updated = workflow.clone();
                updated.assignees = next.clone();
                let stage = updated.current_stage().clone();
                let entry = updated.record(stage.clone(), now, &user, Some(notes));
                let record = TransitionRecord::from_entry(
                    &updated,
                    Some(stage),
                    TransitionKind::AssigneesChanged,
                    &entry,
                );
                Some(PendingChange {
                    workflow: updated,
                    record,
                })
            })
            .await?;

        if !applied.changed() {
            return Ok(applied.after);
        }

        let newly_added: Vec<String> = applied
            .after
            .assignees
            .difference(&applied.before.assignees)
            .cloned()
            .collect();
        info!(
            workflow_id = %workflow_id,
            user = %user,
            added = ?newly_added,
            "Workflow assignees updated"
        );

        let workflow = &applied.after;
        self.notify(
            &newly_added,
            NotificationKind::Assigned,
            json!({
                "workflow_id": workflow.workflow_id,
                "content_id": workflow.content_id,
                "content_title": workflow.content_title,
                "stage": workflow.current_stage(),
            }),
        )
        .await;

        Ok(applied.after)
    }

    pub async fn update_deadline(
        &self,
        workflow_id: &str,
        deadline: Option<DateTime<Utc>>,
        options: ChangeOptions,
    ) -> WorkflowResult<Workflow> {
        let user = user_or_system(&options);

        let applied = self
            .apply(workflow_id, |workflow, now| {
                if workflow.deadline == deadline {
                    return None;
                }
                let notes = options.notes.clone().unwrap_or_else(|| match deadline {
                    Some(at) => format!("Deadline set to {}", at.to_rfc3339()),
                    None => "Deadline cleared".to_string(),
                });

                let mut updated = workflow.clone();
                updated.deadline = deadline;
                let stage = updated.current_stage().clone();
                let entry = updated.record(stage.clone(), now, &user, Some(notes));
                let record = TransitionRecord::from_entry(
                    &updated,
                    Some(stage),
                    TransitionKind::DeadlineChanged,
                    &entry,
                );
                Some(PendingChange {
                    workflow: updated,
                    record,
                })
            })
            .await?;

        if !applied.changed() {
            return Ok(applied.after);
        }

        info!(
            workflow_id = %workflow_id,
            user = %user,
            deadline = ?deadline,
            "Workflow deadline updated"
        );

        if let Some(at) = deadline {
            let workflow = &applied.after;
            let assignees: Vec<String> = workflow.assignees.iter().cloned().collect();
            self.notify(
                &assignees,
                NotificationKind::DeadlineUpdated,
                json!({
                    "workflow_id": workflow.workflow_id,
                    "content_id": workflow.content_id,
                    "content_title": workflow.content_title,
                    "deadline": at,
                }),
            )
            .await;
        }

        Ok(applied.after)
    }

    /// Records a review rejection without changing the stage and tells the
    /// assignees about it.
    pub async fn record_rejection(
        &self,
        workflow_id: &str,
        reviewer: &str,
        comments: Option<&str>,
    ) -> WorkflowResult<Workflow> {
        let notes = match comments {
            Some(c) if !c.trim().is_empty() => format!("rejected by {reviewer}: {c}"),
            _ => format!("rejected by {reviewer}"),
        };

        let applied = self
            .apply(workflow_id, |workflow, now| {
                let mut updated = workflow.clone();
                let stage = updated.current_stage().clone();
                let entry = updated.record(stage.clone(), now, reviewer, Some(notes.clone()));
                let record = TransitionRecord::from_entry(
                    &updated,
                    Some(stage),
                    TransitionKind::Rejected,
                    &entry,
                );
                Some(PendingChange {
                    workflow: updated,
                    record,
                })
            })
            .await?;

        let workflow = &applied.after;
        info!(
            workflow_id = %workflow.workflow_id,
            reviewer = %reviewer,
            stage = %workflow.current_stage(),
            "Content rejected in review"
        );

        let assignees: Vec<String> = workflow.assignees.iter().cloned().collect();
        self.notify(
            &assignees,
            NotificationKind::ContentRejected,
            json!({
                "workflow_id": workflow.workflow_id,
                "content_id": workflow.content_id,
                "content_title": workflow.content_title,
                "stage": workflow.current_stage(),
                "reviewer": reviewer,
                "comments": comments,
            }),
        )
        .await;

        Ok(applied.after)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get_workflow(&self, workflow_id: &str) -> WorkflowResult<Workflow> {
        self.store
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Stored workflows whose current stage is not in the configured stage
    /// set, e.g. after a stage was renamed or removed. Each one is logged.
    pub async fn workflows_outside_stages(&self) -> WorkflowResult<Vec<Workflow>> {
        let strays: Vec<Workflow> = self
            .store
            .find_many(&WorkflowQuery::all())
            .await?
            .into_iter()
            .filter(|w| !self.stages.contains(w.current_stage().as_str()))
            .collect();
        for workflow in &strays {
            warn!(
                workflow_id = %workflow.workflow_id,
                stage = %workflow.current_stage(),
                "Workflow sits in a stage that is no longer configured"
            );
        }
        Ok(strays)
    }

    pub async fn get_workflow_for_content(&self, content_id: &str) -> WorkflowResult<Option<Workflow>> {
        Ok(self.store.find_by_content_id(content_id).await?)
    }

    pub async fn get_workflows_by_stage(
        &self,
        stage: &str,
        options: StageQueryOptions,
    ) -> WorkflowResult<Vec<Workflow>> {
        let stage = self.stages.resolve(stage)?;
        let query = WorkflowQuery::in_stage(stage)
            .with_content_type(options.content_type)
            .with_assignee(options.assignee)
            .sorted_by(options.sort)
            .limited_to(options.limit);
        Ok(self.store.find_many(&query).await?)
    }

    /// Non-terminal workflows with `now <= deadline <= now + days`.
    pub async fn get_approaching_deadlines(&self, days: Option<i64>) -> WorkflowResult<Vec<Workflow>> {
        let days = days.unwrap_or(self.deadline_approach_days);
        let now = self.clock.now();
        let query = WorkflowQuery {
            exclude_stage: Some(self.stages.terminal().clone()),
            deadline_from: Some(now),
            deadline_to: Some(shift_days(now, days)),
            sort: WorkflowSort::DeadlineAsc,
            ..WorkflowQuery::default()
        };
        Ok(self.store.find_many(&query).await?)
    }

    /// Non-terminal workflows whose deadline has passed.
    pub async fn get_overdue_content(&self) -> WorkflowResult<Vec<Workflow>> {
        let query = WorkflowQuery {
            exclude_stage: Some(self.stages.terminal().clone()),
            deadline_before: Some(self.clock.now()),
            sort: WorkflowSort::DeadlineAsc,
            ..WorkflowQuery::default()
        };
        Ok(self.store.find_many(&query).await?)
    }

    /// Non-terminal workflows not updated within `threshold_days`, least
    /// recently updated first.
    pub async fn get_stalled_workflows(&self, threshold_days: i64) -> WorkflowResult<Vec<Workflow>> {
        let query = WorkflowQuery {
            exclude_stage: Some(self.stages.terminal().clone()),
            updated_before: Some(shift_days(self.clock.now(), threshold_days.saturating_neg())),
            sort: WorkflowSort::UpdatedAsc,
            ..WorkflowQuery::default()
        };
        Ok(self.store.find_many(&query).await?)
    }

    /// Transition log of a workflow, newest first.
    pub async fn get_workflow_history(
        &self,
        workflow_id: &str,
        limit: Option<usize>,
    ) -> WorkflowResult<Vec<TransitionRecord>> {
        self.get_workflow(workflow_id).await?;
        let mut records = self.log.for_workflow(workflow_id).await?;
        records.reverse();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn change_stage<F>(
        &self,
        workflow_id: &str,
        options: ChangeOptions,
        mut pick: F,
    ) -> WorkflowResult<Workflow>
    where
        F: FnMut(&Workflow, &StageSet) -> Option<Stage> + Send,
    {
        let user = user_or_system(&options);
        let stages = self.stages.clone();

        let applied = self
            .apply(workflow_id, |workflow, now| {
                let target = pick(workflow, &stages)?;
                if workflow.current_stage() == &target {
                    return None;
                }
                let from = workflow.current_stage().clone();
                let mut updated = workflow.clone();
                let entry = updated.record(target, now, &user, options.notes.clone());
                let record = TransitionRecord::from_entry(
                    &updated,
                    Some(from),
                    TransitionKind::StageChanged,
                    &entry,
                );
                Some(PendingChange {
                    workflow: updated,
                    record,
                })
            })
            .await?;

        if !applied.changed() {
            debug!(
                workflow_id = %workflow_id,
                stage = %applied.after.current_stage(),
                "Stage change skipped, nothing to do"
            );
            return Ok(applied.after);
        }

        let from = applied.before.current_stage().clone();
        let to = applied.after.current_stage().clone();
        info!(
            workflow_id = %workflow_id,
            content_id = %applied.after.content_id,
            from_stage = %from,
            to_stage = %to,
            user = %user,
            "Workflow stage changed"
        );

        if self.stages.is_terminal(&to) {
            self.publish_content(&applied.after, &user).await;
        }

        let workflow = &applied.after;
        let assignees: Vec<String> = workflow.assignees.iter().cloned().collect();
        self.notify(
            &assignees,
            NotificationKind::StageChanged,
            json!({
                "workflow_id": workflow.workflow_id,
                "content_id": workflow.content_id,
                "content_title": workflow.content_title,
                "from_stage": from,
                "to_stage": to,
            }),
        )
        .await;

        Ok(applied.after)
    }

    /// Runs `decide` under the workflow's lock and commits what it returns.
    ///
    /// `decide` returning `None` means "nothing to do"; the current workflow
    /// is handed back untouched. A version conflict re-reads the workflow and
    /// asks `decide` again.
    async fn apply<F>(&self, workflow_id: &str, mut decide: F) -> WorkflowResult<Applied>
    where
        F: FnMut(&Workflow, DateTime<Utc>) -> Option<PendingChange> + Send,
    {
        let _guard = self.locks.acquire(workflow_id).await;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let before = self.get_workflow(workflow_id).await?;
            let Some(change) = decide(&before, self.clock.now()) else {
                return Ok(Applied {
                    after: before.clone(),
                    before,
                });
            };

            match self.commit(&before, change).await {
                Ok(after) => return Ok(Applied { before, after }),
                Err(WorkflowError::Storage(StoreError::VersionConflict { .. })) => {
                    warn!(
                        workflow_id = %workflow_id,
                        attempt,
                        "Workflow changed underneath us, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(WorkflowError::Concurrency {
            workflow_id: workflow_id.to_string(),
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }

    /// Writes the snapshot and appends the record as one unit: if the append
    /// fails the previous snapshot is written back.
    async fn commit(&self, before: &Workflow, change: PendingChange) -> WorkflowResult<Workflow> {
        let stored = self.store.update(change.workflow, before.version).await?;

        if let Err(e) = self.log.append(change.record).await {
            error!(
                workflow_id = %before.workflow_id,
                error = %e,
                "Transition log append failed, restoring previous workflow state"
            );
            if let Err(restore) = self.store.update(before.clone(), stored.version).await {
                error!(
                    workflow_id = %before.workflow_id,
                    error = %restore,
                    "Failed to restore workflow after log append failure"
                );
            }
            return Err(e.into());
        }

        Ok(stored)
    }

    async fn publish_content(&self, workflow: &Workflow, user: &str) {
        if let Err(e) = self.content.mark_published(&workflow.content_id).await {
            warn!(
                workflow_id = %workflow.workflow_id,
                content_id = %workflow.content_id,
                error = %e,
                "Failed to mark content published"
            );
        }

        let event = ContentEvent::Published {
            content_id: workflow.content_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            user: user.to_string(),
            published_at: workflow.updated_at,
        };
        if let Err(e) = self.events.publish(event).await {
            warn!(
                workflow_id = %workflow.workflow_id,
                content_id = %workflow.content_id,
                error = %e,
                "Failed to publish content.published event"
            );
        }
    }

    pub(crate) async fn notify(&self, users: &[String], kind: NotificationKind, payload: serde_json::Value) {
        for user in users {
            if let Err(e) = self
                .notifier
                .send_notification(user, kind, payload.clone())
                .await
            {
                warn!(user_id = %user, kind = %kind, error = %e, "Notification dispatch failed");
            }
        }
    }
}

fn normalize_assignees(assignees: Vec<String>) -> BTreeSet<String> {
    assignees
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

fn user_or_system(options: &ChangeOptions) -> String {
    options
        .user
        .clone()
        .unwrap_or_else(|| SYSTEM_USER.to_string())
}

fn describe_assignee_change(added: &[&String], removed: &[&String]) -> String {
    let join = |names: &[&String]| {
        names
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match (added.is_empty(), removed.is_empty()) {
        (false, false) => format!("Assignees added: {}; removed: {}", join(added), join(removed)),
        (false, true) => format!("Assignees added: {}", join(added)),
        (true, false) => format!("Assignees removed: {}", join(removed)),
        (true, true) => "Assignees unchanged".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::bus::MockEventBus;
    use crate::events::InProcessEventBus;
    use crate::external::content::{ContentSummary, InMemoryContentStore, MockContentStore};
    use crate::external::notifications::{MockNotificationSink, RecordingNotificationSink};
    use crate::workflow::store::InMemoryWorkflowStore;
    use crate::workflow::transition_log::{InMemoryTransitionLog, MockTransitionLog};
    use chrono::{Duration, TimeZone};

    struct Harness {
        engine: Arc<WorkflowEngine>,
        store: Arc<InMemoryWorkflowStore>,
        log: Arc<InMemoryTransitionLog>,
        content: Arc<InMemoryContentStore>,
        notifier: Arc<RecordingNotificationSink>,
        clock: ManualClock,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let log = Arc::new(InMemoryTransitionLog::new());
        let content = Arc::new(InMemoryContentStore::new());
        content.insert("C1", ContentSummary::draft("Autumn launch", "article"));
        content.insert("C2", ContentSummary::draft("Teaser", "social_post"));
        let notifier = Arc::new(RecordingNotificationSink::new());
        let clock = ManualClock::new(t0());

        let engine = WorkflowEngine::new(
            StageSet::default(),
            EngineCollaborators {
                store: store.clone(),
                log: log.clone(),
                content: content.clone(),
                notifier: notifier.clone(),
                events: Arc::new(InProcessEventBus::new()),
            },
        )
        .with_clock(Arc::new(clock.clone()));

        Harness {
            engine: Arc::new(engine),
            store,
            log,
            content,
            notifier,
            clock,
        }
    }

    fn assert_stage_invariant(workflow: &Workflow) {
        assert_eq!(
            workflow.current_stage(),
            &workflow.stage_history().last().stage,
            "current stage must equal the last history entry"
        );
    }

    #[tokio::test]
    async fn create_starts_in_first_stage_with_one_log_entry() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();

        assert_eq!(wf.current_stage(), "draft");
        assert_eq!(wf.content_title, "Autumn launch");
        assert_eq!(wf.content_type, "article");
        assert_stage_invariant(&wf);

        let log = h.log.for_workflow(&wf.workflow_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from_stage, None);
        assert_eq!(log[0].to_stage, "draft");
        assert_eq!(log[0].kind, TransitionKind::Created);
    }

    #[tokio::test]
    async fn create_validates_content_stage_and_uniqueness() {
        let h = harness();

        let missing = h
            .engine
            .create_workflow("nope", CreateWorkflowOptions::default())
            .await;
        assert!(matches!(missing, Err(WorkflowError::ContentNotFound(_))));

        let bad_stage = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    initial_stage: Some("archived".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad_stage, Err(WorkflowError::InvalidStage(_))));

        let original = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    initial_stage: Some("review".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let dup = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await;
        assert!(matches!(dup, Err(WorkflowError::DuplicateWorkflow(ref c)) if c == "C1"));

        let unchanged = h.engine.get_workflow(&original.workflow_id).await.unwrap();
        assert_eq!(unchanged, original);
        assert_eq!(h.log.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_notifies_initial_assignees() {
        let h = harness();
        h.engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into(), "bob".into(), " ".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sent = h.notifier.sent_of_kind(NotificationKind::Assigned);
        let users: Vec<_> = sent.iter().map(|n| n.user_id.as_str()).collect();
        assert_eq!(users, vec!["ann", "bob"]);
    }

    #[tokio::test]
    async fn update_stage_is_idempotent() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();

        h.clock.advance(Duration::hours(1));
        let first = h
            .engine
            .update_stage(&wf.workflow_id, "review", ChangeOptions::by("ed"))
            .await
            .unwrap();
        let second = h
            .engine
            .update_stage(&wf.workflow_id, "review", ChangeOptions::by("ed"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_stage_invariant(&second);
        let log = h.log.for_workflow(&wf.workflow_id).await.unwrap();
        let to_review = log.iter().filter(|r| r.to_stage == "review").count();
        assert_eq!(to_review, 1);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn update_stage_allows_jumps_and_rejects_unknown_stages() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();

        let jumped = h
            .engine
            .update_stage(&wf.workflow_id, "scheduled", ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(jumped.current_stage(), "scheduled");

        let invalid = h
            .engine
            .update_stage(&wf.workflow_id, "limbo", ChangeOptions::default())
            .await;
        assert!(matches!(invalid, Err(WorkflowError::InvalidStage(_))));

        let missing = h
            .engine
            .update_stage("no-such-workflow", "review", ChangeOptions::default())
            .await;
        assert!(matches!(missing, Err(WorkflowError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn reaching_terminal_stage_marks_content_published() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.engine
            .update_stage(&wf.workflow_id, "published", ChangeOptions::by("ed"))
            .await
            .unwrap();
        assert_eq!(h.content.status_of("C1").as_deref(), Some("published"));

        let changes = h.notifier.sent_of_kind(NotificationKind::StageChanged);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload["from_stage"], "draft");
        assert_eq!(changes[0].payload["to_stage"], "published");
    }

    #[tokio::test]
    async fn assignee_update_notifies_only_new_people() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into(), "bob".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.notifier.clear();

        let updated = h
            .engine
            .update_assignees(
                &wf.workflow_id,
                vec!["bob".into(), "cai".into()],
                ChangeOptions::by("lead"),
            )
            .await
            .unwrap();

        assert_eq!(updated.current_stage(), "draft");
        assert_stage_invariant(&updated);
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "cai");
        assert_eq!(sent[0].kind, NotificationKind::Assigned);

        let log = h.log.for_workflow(&wf.workflow_id).await.unwrap();
        let last = log.last().unwrap();
        assert_eq!(last.kind, TransitionKind::AssigneesChanged);
        assert_eq!(last.from_stage.as_ref().map(Stage::as_str), Some("draft"));
        assert_eq!(last.notes.as_deref(), Some("Assignees added: cai; removed: ann"));
    }

    #[tokio::test]
    async fn deadline_update_notifies_only_when_set() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.notifier.clear();

        let due = t0() + Duration::days(4);
        let with_deadline = h
            .engine
            .update_deadline(&wf.workflow_id, Some(due), ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(with_deadline.deadline, Some(due));
        assert_eq!(h.notifier.sent_of_kind(NotificationKind::DeadlineUpdated).len(), 1);

        let cleared = h
            .engine
            .update_deadline(&wf.workflow_id, None, ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(cleared.deadline, None);
        assert_eq!(h.notifier.sent_of_kind(NotificationKind::DeadlineUpdated).len(), 1);
        assert_eq!(h.log.for_workflow(&wf.workflow_id).await.unwrap().len(), 3);
        assert_stage_invariant(&cleared);
    }

    #[tokio::test]
    async fn overdue_and_approaching_exclude_terminal_stage() {
        let h = harness();
        let late = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    deadline: Some(t0() - Duration::days(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let soon = h
            .engine
            .create_workflow(
                "C2",
                CreateWorkflowOptions {
                    deadline: Some(t0() + Duration::days(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let overdue = h.engine.get_overdue_content().await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].workflow_id, late.workflow_id);

        let approaching = h.engine.get_approaching_deadlines(None).await.unwrap();
        assert_eq!(approaching.len(), 1);
        assert_eq!(approaching[0].workflow_id, soon.workflow_id);
        assert!(h.engine.get_approaching_deadlines(Some(1)).await.unwrap().is_empty());

        h.engine
            .update_stage(&late.workflow_id, "published", ChangeOptions::default())
            .await
            .unwrap();
        assert!(h.engine.get_overdue_content().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();
        for stage in ["review", "approved", "scheduled"] {
            h.clock.advance(Duration::hours(1));
            h.engine
                .update_stage(&wf.workflow_id, stage, ChangeOptions::default())
                .await
                .unwrap();
        }

        let history = h
            .engine
            .get_workflow_history(&wf.workflow_id, Some(2))
            .await
            .unwrap();
        let stages: Vec<_> = history.iter().map(|r| r.to_stage.as_str()).collect();
        assert_eq!(stages, vec!["scheduled", "approved"]);

        let missing = h.engine.get_workflow_history("missing", None).await;
        assert!(matches!(missing, Err(WorkflowError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn stage_queries_filter_and_validate() {
        let h = harness();
        h.engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.engine
            .create_workflow("C2", CreateWorkflowOptions::default())
            .await
            .unwrap();

        let drafts = h
            .engine
            .get_workflows_by_stage("draft", StageQueryOptions::default())
            .await
            .unwrap();
        assert_eq!(drafts.len(), 2);

        let posts = h
            .engine
            .get_workflows_by_stage(
                "draft",
                StageQueryOptions {
                    content_type: Some("social_post".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content_id, "C2");

        let anns = h
            .engine
            .get_workflows_by_stage(
                "draft",
                StageQueryOptions {
                    assignee: Some("ann".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(anns[0].content_id, "C1");

        assert!(matches!(
            h.engine
                .get_workflows_by_stage("nowhere", StageQueryOptions::default())
                .await,
            Err(WorkflowError::InvalidStage(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_identical_updates_record_one_transition() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = h.engine.clone();
            let id = wf.workflow_id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .update_stage(&id, "review", ChangeOptions::default())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let log = h.log.for_workflow(&wf.workflow_id).await.unwrap();
        assert_eq!(log.len(), 2);
        let stored = h.store.find_by_id(&wf.workflow_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.stage_history().len(), 2);
    }

    #[tokio::test]
    async fn failed_log_append_restores_previous_state() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let content = Arc::new(InMemoryContentStore::new());
        content.insert("C1", ContentSummary::draft("Autumn launch", "article"));

        let mut log = MockTransitionLog::new();
        let mut appends = 0;
        log.expect_append().returning(move |record| {
            appends += 1;
            if appends == 1 {
                Ok(record)
            } else {
                Err(StoreError::Backend("log unavailable".into()))
            }
        });

        let engine = WorkflowEngine::new(
            StageSet::default(),
            EngineCollaborators {
                store: store.clone(),
                log: Arc::new(log),
                content,
                notifier: Arc::new(RecordingNotificationSink::new()),
                events: Arc::new(InProcessEventBus::new()),
            },
        );

        let wf = engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();
        let err = engine
            .update_stage(&wf.workflow_id, "review", ChangeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(StoreError::Backend(_))));

        let stored = engine.get_workflow(&wf.workflow_id).await.unwrap();
        assert_eq!(stored.current_stage(), "draft");
        assert_eq!(stored.stage_history().len(), 1);
    }

    #[tokio::test]
    async fn failed_creation_log_append_leaves_no_workflow() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let content = Arc::new(InMemoryContentStore::new());
        content.insert("C1", ContentSummary::draft("Autumn launch", "article"));

        let mut log = MockTransitionLog::new();
        log.expect_append()
            .returning(|_| Err(StoreError::Backend("log unavailable".into())));

        let engine = WorkflowEngine::new(
            StageSet::default(),
            EngineCollaborators {
                store: store.clone(),
                log: Arc::new(log),
                content,
                notifier: Arc::new(RecordingNotificationSink::new()),
                events: Arc::new(InProcessEventBus::new()),
            },
        );

        assert!(engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .is_err());
        assert!(engine.get_workflow_for_content("C1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn side_effect_failures_do_not_fail_the_transition() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let log = Arc::new(InMemoryTransitionLog::new());

        let mut content = MockContentStore::new();
        content
            .expect_find_by_id()
            .returning(|_| Ok(Some(ContentSummary::draft("Autumn launch", "article"))));
        content
            .expect_mark_published()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("cms down")));

        let mut notifier = MockNotificationSink::new();
        notifier
            .expect_send_notification()
            .returning(|_, _, _| Err(anyhow::anyhow!("smtp down")));

        let engine = WorkflowEngine::new(
            StageSet::default(),
            EngineCollaborators {
                store,
                log: log.clone(),
                content: Arc::new(content),
                notifier: Arc::new(notifier),
                events: Arc::new(InProcessEventBus::new()),
            },
        );

        let wf = engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    assignees: vec!["ann".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let published = engine
            .update_stage(&wf.workflow_id, "published", ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(published.current_stage(), "published");
        assert_eq!(log.for_workflow(&wf.workflow_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn advance_from_only_moves_when_stage_still_matches() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    initial_stage: Some("review".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let review = h.engine.stages().resolve("review").unwrap();
        let draft = h.engine.stages().resolve("draft").unwrap();

        let stale = h
            .engine
            .advance_from(&wf.workflow_id, &draft, ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(stale.current_stage(), "review");

        let moved = h
            .engine
            .advance_from(&wf.workflow_id, &review, ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(moved.current_stage(), "approved");

        let published = h
            .engine
            .update_stage(&wf.workflow_id, "published", ChangeOptions::default())
            .await
            .unwrap();
        let terminal = h.engine.stages().terminal().clone();
        let still = h
            .engine
            .advance_from(&published.workflow_id, &terminal, ChangeOptions::default())
            .await
            .unwrap();
        assert_eq!(still.version, published.version);
    }

    #[tokio::test]
    async fn rejection_keeps_stage_and_notifies() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    initial_stage: Some("review".into()),
                    assignees: vec!["ann".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.notifier.clear();

        let rejected = h
            .engine
            .record_rejection(&wf.workflow_id, "rita", Some("needs sources"))
            .await
            .unwrap();
        assert_eq!(rejected.current_stage(), "review");
        assert_stage_invariant(&rejected);
        assert_eq!(
            rejected.stage_history().last().notes.as_deref(),
            Some("rejected by rita: needs sources")
        );

        let sent = h.notifier.sent_of_kind(NotificationKind::ContentRejected);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload["comments"], "needs sources");
    }

    #[tokio::test]
    async fn publishing_marks_content_and_emits_one_event() {
        let mut content = MockContentStore::new();
        content
            .expect_find_by_id()
            .returning(|_| Ok(Some(ContentSummary::draft("Autumn launch", "article"))));
        content
            .expect_mark_published()
            .times(1)
            .returning(|_| Ok(()));

        let mut events = MockEventBus::new();
        events
            .expect_publish()
            .withf(|event| {
                matches!(
                    event,
                    ContentEvent::Published { content_id, user, .. }
                        if content_id == "C1" && user == "ed"
                )
            })
            .times(1)
            .returning(|_| Ok(()));

        let engine = WorkflowEngine::new(
            StageSet::default(),
            EngineCollaborators {
                store: Arc::new(InMemoryWorkflowStore::new()),
                log: Arc::new(InMemoryTransitionLog::new()),
                content: Arc::new(content),
                notifier: Arc::new(RecordingNotificationSink::new()),
                events: Arc::new(events),
            },
        );

        let wf = engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();
        engine
            .update_stage(&wf.workflow_id, "review", ChangeOptions::by("ann"))
            .await
            .unwrap();
        engine
            .update_stage(&wf.workflow_id, "published", ChangeOptions::by("ed"))
            .await
            .unwrap();
        // Already published: no second side effect.
        engine
            .update_stage(&wf.workflow_id, "published", ChangeOptions::by("ed"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn huge_day_windows_do_not_overflow() {
        let h = harness();
        let wf = h
            .engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    deadline: Some(t0() + Duration::days(400)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let approaching = h
            .engine
            .get_approaching_deadlines(Some(100_000_000))
            .await
            .unwrap();
        assert_eq!(approaching.len(), 1);
        assert_eq!(approaching[0].workflow_id, wf.workflow_id);
        assert_eq!(h.engine.get_approaching_deadlines(Some(i64::MAX)).await.unwrap().len(), 1);

        assert!(h.engine.get_stalled_workflows(i64::MAX).await.unwrap().is_empty());
        assert_eq!(h.engine.get_stalled_workflows(i64::MIN).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_workflows_come_oldest_first() {
        let h = harness();
        let first = h
            .engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();
        h.clock.advance(Duration::days(2));
        let second = h
            .engine
            .create_workflow("C2", CreateWorkflowOptions::default())
            .await
            .unwrap();
        h.clock.advance(Duration::days(10));

        let stalled = h.engine.get_stalled_workflows(7).await.unwrap();
        let ids: Vec<_> = stalled.iter().map(|w| w.workflow_id.clone()).collect();
        assert_eq!(ids, vec![first.workflow_id, second.workflow_id]);
    }

    #[tokio::test]
    async fn workflows_in_unconfigured_stages_are_reported() {
        let h = harness();
        h.engine
            .create_workflow("C1", CreateWorkflowOptions::default())
            .await
            .unwrap();

        let retired = StageSet::new(["legacy"]).unwrap();
        h.store
            .insert(Workflow::new(NewWorkflow {
                workflow_id: "wf-legacy".to_string(),
                content_id: "C9".to_string(),
                content_title: "Old post".to_string(),
                content_type: "article".to_string(),
                initial_stage: retired.resolve("legacy").unwrap(),
                assignees: Default::default(),
                deadline: None,
                priority: Default::default(),
                metadata: Default::default(),
                user: "ed".to_string(),
                notes: None,
                created_at: t0(),
            }))
            .await
            .unwrap();

        let strays = h.engine.workflows_outside_stages().await.unwrap();
        assert_eq!(strays.len(), 1);
        assert_eq!(strays[0].workflow_id, "wf-legacy");
    }
}
