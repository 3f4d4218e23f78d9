use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::stage::Stage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub notes: Option<String>,
}

/// Append-only record of the stages a workflow has been in.
///
/// There is no way to edit or remove an entry once recorded, and timestamps
/// never decrease: a timestamp earlier than the last entry is clamped to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<HistoryEntry>", into = "Vec<HistoryEntry>")]
pub struct StageHistory {
    entries: Vec<HistoryEntry>,
}

impl TryFrom<Vec<HistoryEntry>> for StageHistory {
    type Error = String;

    fn try_from(entries: Vec<HistoryEntry>) -> Result<Self, Self::Error> {
        if entries.is_empty() {
            return Err("stage history must contain at least one entry".to_string());
        }
        if entries.windows(2).any(|w| w[1].seq <= w[0].seq || w[1].timestamp < w[0].timestamp) {
            return Err("stage history entries are out of order".to_string());
        }
        Ok(Self { entries })
    }
}

impl From<StageHistory> for Vec<HistoryEntry> {
    fn from(history: StageHistory) -> Self {
        history.entries
    }
}

impl StageHistory {
    fn starting_at(stage: Stage, timestamp: DateTime<Utc>, user: String, notes: Option<String>) -> Self {
        Self {
            entries: vec![HistoryEntry {
                seq: 0,
                stage,
                timestamp,
                user,
                notes,
            }],
        }
    }

    fn record(
        &mut self,
        stage: Stage,
        timestamp: DateTime<Utc>,
        user: String,
        notes: Option<String>,
    ) -> &HistoryEntry {
        let (seq, timestamp) = match self.entries.last() {
            Some(last) => (last.seq + 1, timestamp.max(last.timestamp)),
            None => (0, timestamp),
        };
        self.entries.push(HistoryEntry {
            seq,
            stage,
            timestamp,
            user,
            notes,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn last(&self) -> &HistoryEntry {
        // Always non-empty: a history is only ever created with its first entry.
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One content item's journey through the editorial stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub content_id: String,
    pub content_title: String,
    pub content_type: String,
    stage_history: StageHistory,
    pub assignees: BTreeSet<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Fields for a brand new workflow; the first history entry is derived from them.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub workflow_id: String,
    pub content_id: String,
    pub content_title: String,
    pub content_type: String,
    pub initial_stage: Stage,
    pub assignees: BTreeSet<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub metadata: HashMap<String, serde_json::Value>,
    pub user: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(new: NewWorkflow) -> Self {
        Self {
            workflow_id: new.workflow_id,
            content_id: new.content_id,
            content_title: new.content_title,
            content_type: new.content_type,
            stage_history: StageHistory::starting_at(
                new.initial_stage,
                new.created_at,
                new.user,
                new.notes,
            ),
            assignees: new.assignees,
            deadline: new.deadline,
            priority: new.priority,
            metadata: new.metadata,
            created_at: new.created_at,
            updated_at: new.created_at,
            version: 0,
        }
    }

    /// Stage of the most recent history entry.
    pub fn current_stage(&self) -> &Stage {
        &self.stage_history.last().stage
    }

    pub fn stage_history(&self) -> &StageHistory {
        &self.stage_history
    }

    /// Appends a history entry and moves `updated_at`. `current_stage`
    /// follows from the appended entry.
    pub(crate) fn record(
        &mut self,
        stage: Stage,
        at: DateTime<Utc>,
        user: &str,
        notes: Option<String>,
    ) -> HistoryEntry {
        let entry = self
            .stage_history
            .record(stage, at, user.to_string(), notes)
            .clone();
        self.updated_at = entry.timestamp;
        entry
    }

    pub fn is_assigned_to(&self, user: &str) -> bool {
        self.assignees.contains(user)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Created,
    StageChanged,
    AssigneesChanged,
    DeadlineChanged,
    Rejected,
}

/// Entry of the independent, append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Assigned by the log on append.
    #[serde(default)]
    pub seq: u64,
    pub workflow_id: String,
    pub content_id: String,
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub kind: TransitionKind,
    pub user: String,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn from_entry(
        workflow: &Workflow,
        from_stage: Option<Stage>,
        kind: TransitionKind,
        entry: &HistoryEntry,
    ) -> Self {
        Self {
            seq: 0,
            workflow_id: workflow.workflow_id.clone(),
            content_id: workflow.content_id.clone(),
            from_stage,
            to_stage: entry.stage.clone(),
            kind,
            user: entry.user.clone(),
            notes: entry.notes.clone(),
            timestamp: entry.timestamp,
        }
    }

    pub fn is_stage_change(&self) -> bool {
        matches!(self.kind, TransitionKind::Created | TransitionKind::StageChanged)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowOptions {
    pub initial_stage: Option<String>,
    pub assignees: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub user: Option<String>,
    pub notes: Option<String>,
}

/// Who made a change and why.
#[derive(Debug, Clone, Default)]
pub struct ChangeOptions {
    pub user: Option<String>,
    pub notes: Option<String>,
}

impl ChangeOptions {
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSort {
    #[default]
    UpdatedDesc,
    /// Least recently updated first.
    UpdatedAsc,
    CreatedDesc,
    DeadlineAsc,
    PriorityDesc,
}

#[derive(Debug, Clone, Default)]
pub struct StageQueryOptions {
    pub content_type: Option<String>,
    pub assignee: Option<String>,
    pub sort: WorkflowSort,
    pub limit: Option<usize>,
}

pub const SYSTEM_USER: &str = "system";
