//! Workflow persistence.
//!
//! Workflows are keyed by `workflow_id` with a unique secondary key on
//! `content_id`. Updates are conditional on the caller's view of `version`,
//! so two writers racing on the same workflow cannot silently overwrite each
//! other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::errors::StoreError;
use super::stage::Stage;
use super::types::{Workflow, WorkflowSort};

/// Filter, sort and limit for [`WorkflowStore::find_many`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowQuery {
    pub stage: Option<Stage>,
    pub exclude_stage: Option<Stage>,
    pub content_type: Option<String>,
    pub assignee: Option<String>,
    /// Inclusive lower deadline bound.
    pub deadline_from: Option<DateTime<Utc>>,
    /// Inclusive upper deadline bound.
    pub deadline_to: Option<DateTime<Utc>>,
    /// Exclusive upper deadline bound.
    pub deadline_before: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `updated_at`.
    pub updated_before: Option<DateTime<Utc>>,
    pub sort: WorkflowSort,
    pub limit: Option<usize>,
}

impl WorkflowQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }

    pub fn excluding_stage(mut self, stage: Stage) -> Self {
        self.exclude_stage = Some(stage);
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = assignee;
        self
    }

    pub fn sorted_by(mut self, sort: WorkflowSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn limited_to(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    fn has_deadline_filter(&self) -> bool {
        self.deadline_from.is_some() || self.deadline_to.is_some() || self.deadline_before.is_some()
    }

    pub fn matches(&self, workflow: &Workflow) -> bool {
        if let Some(stage) = &self.stage {
            if workflow.current_stage() != stage {
                return false;
            }
        }
        if let Some(stage) = &self.exclude_stage {
            if workflow.current_stage() == stage {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            if &workflow.content_type != content_type {
                return false;
            }
        }
        if let Some(assignee) = &self.assignee {
            if !workflow.is_assigned_to(assignee) {
                return false;
            }
        }
        if self.has_deadline_filter() {
            let Some(deadline) = workflow.deadline else {
                return false;
            };
            if self.deadline_from.is_some_and(|from| deadline < from) {
                return false;
            }
            if self.deadline_to.is_some_and(|to| deadline > to) {
                return false;
            }
            if self.deadline_before.is_some_and(|before| deadline >= before) {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if workflow.updated_at >= before {
                return false;
            }
        }
        true
    }

    /// Applies filter, sort and limit to an unordered set of workflows.
    pub fn apply<'a, I>(&self, workflows: I) -> Vec<Workflow>
    where
        I: IntoIterator<Item = &'a Workflow>,
    {
        let mut matched: Vec<Workflow> = workflows
            .into_iter()
            .filter(|w| self.matches(w))
            .cloned()
            .collect();

        match self.sort {
            WorkflowSort::UpdatedDesc => matched.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.workflow_id.cmp(&b.workflow_id))
            }),
            WorkflowSort::UpdatedAsc => matched.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.workflow_id.cmp(&b.workflow_id))
            }),
            WorkflowSort::CreatedDesc => matched.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.workflow_id.cmp(&b.workflow_id))
            }),
            // Workflows without a deadline go last.
            WorkflowSort::DeadlineAsc => matched.sort_by(|a, b| {
                let by_deadline = match (a.deadline, b.deadline) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                by_deadline.then_with(|| a.workflow_id.cmp(&b.workflow_id))
            }),
            WorkflowSort::PriorityDesc => matched.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| b.updated_at.cmp(&a.updated_at))
                    .then_with(|| a.workflow_id.cmp(&b.workflow_id))
            }),
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Stores a new workflow. Fails with `DuplicateContent` if the content id
    /// already has one.
    async fn insert(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    async fn find_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn find_by_content_id(&self, content_id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn find_many(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>, StoreError>;

    /// Replaces the stored workflow if its version still equals
    /// `expected_version`. The stored copy gets `expected_version + 1`, which
    /// is also returned.
    async fn update(&self, workflow: Workflow, expected_version: u64) -> Result<Workflow, StoreError>;

    /// Removes a workflow. Only used to undo a creation whose transition-log
    /// append failed; workflows are otherwise never deleted.
    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
struct WorkflowTable {
    by_id: HashMap<String, Workflow>,
    by_content: HashMap<String, String>,
}

impl WorkflowTable {
    fn from_workflows(workflows: Vec<Workflow>) -> Self {
        let mut table = Self::default();
        for workflow in workflows {
            table
                .by_content
                .insert(workflow.content_id.clone(), workflow.workflow_id.clone());
            table.by_id.insert(workflow.workflow_id.clone(), workflow);
        }
        table
    }

    fn insert(&mut self, workflow: Workflow) -> Result<Workflow, StoreError> {
        if self.by_content.contains_key(&workflow.content_id) {
            return Err(StoreError::DuplicateContent(workflow.content_id));
        }
        self.by_content
            .insert(workflow.content_id.clone(), workflow.workflow_id.clone());
        self.by_id
            .insert(workflow.workflow_id.clone(), workflow.clone());
        Ok(workflow)
    }

    fn find_by_content_id(&self, content_id: &str) -> Option<Workflow> {
        self.by_content
            .get(content_id)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    fn update(&mut self, mut workflow: Workflow, expected_version: u64) -> Result<Workflow, StoreError> {
        let stored = self
            .by_id
            .get_mut(&workflow.workflow_id)
            .ok_or_else(|| StoreError::NotFound(workflow.workflow_id.clone()))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                workflow_id: workflow.workflow_id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }
        workflow.version = expected_version + 1;
        *stored = workflow.clone();
        Ok(workflow)
    }

    fn delete(&mut self, workflow_id: &str) -> Result<(), StoreError> {
        let removed = self
            .by_id
            .remove(workflow_id)
            .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;
        self.by_content.remove(&removed.content_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    table: RwLock<WorkflowTable>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workflow)
    }

    async fn find_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>, StoreError> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(table.by_id.get(workflow_id).cloned())
    }

    async fn find_by_content_id(&self, content_id: &str) -> Result<Option<Workflow>, StoreError> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(table.find_by_content_id(content_id))
    }

    async fn find_many(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>, StoreError> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        Ok(query.apply(table.by_id.values()))
    }

    async fn update(&self, workflow: Workflow, expected_version: u64) -> Result<Workflow, StoreError> {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .update(workflow, expected_version)
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .delete(workflow_id)
    }
}

/// Workflow store persisted as a single JSON snapshot file.
///
/// Each write goes to a temporary sibling file that is then renamed over the
/// snapshot, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonFileWorkflowStore {
    path: PathBuf,
    table: Mutex<WorkflowTable>,
}

impl JsonFileWorkflowStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let workflows: Vec<Workflow> = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = workflows.len(), "Loaded workflow snapshot");

        Ok(Self {
            path,
            table: Mutex::new(WorkflowTable::from_workflows(workflows)),
        })
    }

    async fn persist(&self, table: &WorkflowTable) -> Result<(), StoreError> {
        let mut workflows: Vec<&Workflow> = table.by_id.values().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.workflow_id.cmp(&b.workflow_id)));
        let json = serde_json::to_string_pretty(&workflows)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Applies `change` to a copy of the table and only swaps it in once the
    /// snapshot has been written.
    async fn mutate<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut WorkflowTable) -> Result<T, StoreError> + Send,
    {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let result = change(&mut next)?;
        self.persist(&next).await?;
        *table = next;
        Ok(result)
    }
}

#[async_trait]
impl WorkflowStore for JsonFileWorkflowStore {
    async fn insert(&self, workflow: Workflow) -> Result<Workflow, StoreError> {
        self.mutate(move |table| table.insert(workflow)).await
    }

    async fn find_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.table.lock().await.by_id.get(workflow_id).cloned())
    }

    async fn find_by_content_id(&self, content_id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.table.lock().await.find_by_content_id(content_id))
    }

    async fn find_many(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>, StoreError> {
        Ok(query.apply(self.table.lock().await.by_id.values()))
    }

    async fn update(&self, workflow: Workflow, expected_version: u64) -> Result<Workflow, StoreError> {
        self.mutate(move |table| table.update(workflow, expected_version))
            .await
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.mutate(|table| table.delete(workflow_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::stage::StageSet;
    use crate::workflow::types::{NewWorkflow, Priority};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn workflow(id: &str, content_id: &str, stage: &str, assignees: &[&str]) -> Workflow {
        let stages = StageSet::default();
        Workflow::new(NewWorkflow {
            workflow_id: id.to_string(),
            content_id: content_id.to_string(),
            content_title: format!("Title {content_id}"),
            content_type: "article".to_string(),
            initial_stage: stages.resolve(stage).unwrap(),
            assignees: assignees.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            deadline: None,
            priority: Priority::Normal,
            metadata: HashMap::new(),
            user: "ed".to_string(),
            notes: None,
            created_at: t0(),
        })
    }

    #[tokio::test]
    async fn insert_rejects_second_workflow_for_same_content() {
        let store = InMemoryWorkflowStore::new();
        store.insert(workflow("wf-1", "C1", "draft", &[])).await.unwrap();

        let err = store
            .insert(workflow("wf-2", "C1", "draft", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateContent(ref c) if c == "C1"));

        let stored = store.find_by_content_id("C1").await.unwrap().unwrap();
        assert_eq!(stored.workflow_id, "wf-1");
        assert!(store.find_by_id("wf-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_is_conditional_on_version() {
        let store = InMemoryWorkflowStore::new();
        let wf = store.insert(workflow("wf-1", "C1", "draft", &[])).await.unwrap();

        let mut changed = wf.clone();
        changed.content_title = "Renamed".to_string();
        let stored = store.update(changed.clone(), 0).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = store.update(changed, 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, found: 1, .. }
        ));
    }

    #[tokio::test]
    async fn find_many_filters_sorts_and_limits() {
        let store = InMemoryWorkflowStore::new();
        let stages = StageSet::default();

        let mut a = workflow("wf-a", "A", "review", &["ann"]);
        a.priority = Priority::Low;
        let mut b = workflow("wf-b", "B", "review", &["ann", "bob"]);
        b.priority = Priority::Urgent;
        let mut c = workflow("wf-c", "C", "draft", &["ann"]);
        c.content_type = "social_post".to_string();
        for wf in [a, b, c] {
            store.insert(wf).await.unwrap();
        }

        let review = stages.resolve("review").unwrap();
        let found = store
            .find_many(&WorkflowQuery::in_stage(review.clone()).sorted_by(WorkflowSort::PriorityDesc))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|w| w.workflow_id.as_str()).collect();
        assert_eq!(ids, vec!["wf-b", "wf-a"]);

        let bobs = store
            .find_many(&WorkflowQuery::all().with_assignee(Some("bob".to_string())))
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);

        let posts = store
            .find_many(&WorkflowQuery::all().with_content_type(Some("social_post".to_string())))
            .await
            .unwrap();
        assert_eq!(posts[0].workflow_id, "wf-c");

        let limited = store
            .find_many(&WorkflowQuery::in_stage(review).limited_to(Some(1)))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn updated_ascending_puts_least_recent_first() {
        let mut old = workflow("wf-old", "C1", "draft", &[]);
        old.updated_at = t0() - Duration::days(9);
        let mut older = workflow("wf-older", "C2", "draft", &[]);
        older.updated_at = t0() - Duration::days(20);
        let fresh = workflow("wf-fresh", "C3", "draft", &[]);

        let sorted = WorkflowQuery::all()
            .sorted_by(WorkflowSort::UpdatedAsc)
            .apply([&old, &fresh, &older]);
        let ids: Vec<_> = sorted.iter().map(|w| w.workflow_id.as_str()).collect();
        assert_eq!(ids, vec!["wf-older", "wf-old", "wf-fresh"]);
    }

    #[test]
    fn deadline_filters_ignore_workflows_without_deadline() {
        let mut with_deadline = workflow("wf-1", "C1", "draft", &[]);
        with_deadline.deadline = Some(t0() + Duration::days(2));
        let without = workflow("wf-2", "C2", "draft", &[]);

        let query = WorkflowQuery {
            deadline_from: Some(t0()),
            deadline_to: Some(t0() + Duration::days(3)),
            ..WorkflowQuery::default()
        };
        assert!(query.matches(&with_deadline));
        assert!(!query.matches(&without));

        let overdue = WorkflowQuery {
            deadline_before: Some(t0() + Duration::days(2)),
            ..WorkflowQuery::default()
        };
        assert!(!overdue.matches(&with_deadline));
    }

    #[tokio::test]
    async fn json_file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.json");

        {
            let store = JsonFileWorkflowStore::open(&path).await.unwrap();
            let wf = store
                .insert(workflow("wf-1", "C1", "draft", &["ann"]))
                .await
                .unwrap();
            let mut changed = wf.clone();
            changed.assignees.insert("bob".to_string());
            store.update(changed, wf.version).await.unwrap();
        }

        let reopened = JsonFileWorkflowStore::open(&path).await.unwrap();
        let wf = reopened.find_by_content_id("C1").await.unwrap().unwrap();
        assert_eq!(wf.version, 1);
        assert!(wf.is_assigned_to("bob"));
        assert_eq!(wf.current_stage(), "draft");

        let err = reopened
            .insert(workflow("wf-2", "C1", "draft", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateContent(_)));
    }
}
