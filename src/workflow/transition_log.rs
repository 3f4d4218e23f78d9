//! Append-only transition log.
//!
//! Every stage change, assignee change, deadline change and rejection note is
//! appended here as a [`TransitionRecord`]. Records are never updated or
//! deleted; the log assigns each one a sequence number that is strictly
//! increasing across the whole log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::errors::StoreError;
use super::types::TransitionRecord;

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TransitionLog: Send + Sync {
    /// Appends a record and returns it with its assigned sequence number.
    async fn append(&self, record: TransitionRecord) -> Result<TransitionRecord, StoreError>;

    /// All records of one workflow, oldest first.
    async fn for_workflow(&self, workflow_id: &str) -> Result<Vec<TransitionRecord>, StoreError>;

    /// Records with `from <= timestamp <= to`, oldest first.
    async fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TransitionRecord>, StoreError>;

    /// Every record, oldest first.
    async fn all(&self) -> Result<Vec<TransitionRecord>, StoreError>;
}

fn sort_chronologically(records: &mut [TransitionRecord]) {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
}

#[derive(Debug, Default)]
pub struct InMemoryTransitionLog {
    records: RwLock<Vec<TransitionRecord>>,
    next_seq: AtomicU64,
}

impl InMemoryTransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot<F>(&self, keep: F) -> Vec<TransitionRecord>
    where
        F: Fn(&TransitionRecord) -> bool,
    {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = records.iter().filter(|r| keep(r)).cloned().collect();
        sort_chronologically(&mut out);
        out
    }
}

#[async_trait]
impl TransitionLog for InMemoryTransitionLog {
    async fn append(&self, mut record: TransitionRecord) -> Result<TransitionRecord, StoreError> {
        record.seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(record)
    }

    async fn for_workflow(&self, workflow_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.snapshot(|r| r.workflow_id == workflow_id))
    }

    async fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.snapshot(|r| r.timestamp >= from && r.timestamp <= to))
    }

    async fn all(&self) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self.snapshot(|_| true))
    }
}

/// Transition log persisted as JSON lines, one record per line.
///
/// A line only counts once its trailing newline is on disk. A torn tail left
/// by a failed or interrupted write is cut off before the next append and on
/// open, so it can never be glued onto a later record.
#[derive(Debug)]
pub struct JsonlTransitionLog {
    path: PathBuf,
    last_seq: Mutex<u64>,
}

impl JsonlTransitionLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = open_for_append(&path).await?;
        trim_torn_tail(&mut file, &path).await?;

        let existing = read_records(&path).await?;
        let last_seq = existing.iter().map(|r| r.seq).max().unwrap_or(0);
        Ok(Self {
            path,
            last_seq: Mutex::new(last_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_filtered<F>(&self, keep: F) -> Result<Vec<TransitionRecord>, StoreError>
    where
        F: Fn(&TransitionRecord) -> bool + Send,
    {
        let mut records: Vec<_> = read_records(&self.path)
            .await?
            .into_iter()
            .filter(|r| keep(r))
            .collect();
        sort_chronologically(&mut records);
        Ok(records)
    }
}

async fn open_for_append(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .await
}

/// Cuts the file back to its last complete line and returns the new length.
async fn trim_torn_tail(file: &mut fs::File, path: &Path) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await?;
    file.read_exact(&mut last).await?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0)).await?;
    file.read_to_end(&mut content).await?;
    let complete = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i as u64 + 1);

    warn!(
        path = %path.display(),
        dropped_bytes = len - complete,
        "Dropping incomplete trailing line from transition log"
    );
    file.set_len(complete).await?;
    Ok(complete)
}

async fn read_records(path: &Path) -> Result<Vec<TransitionRecord>, StoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TransitionRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable transition record"
            ),
        }
    }
    Ok(records)
}

#[async_trait]
impl TransitionLog for JsonlTransitionLog {
    async fn append(&self, mut record: TransitionRecord) -> Result<TransitionRecord, StoreError> {
        let mut last_seq = self.last_seq.lock().await;
        record.seq = *last_seq + 1;
        let line = format!("{}\n", serde_json::to_string(&record)?);

        let mut file = open_for_append(&self.path).await?;
        let before = trim_torn_tail(&mut file, &self.path).await?;

        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(truncate) = file.set_len(before).await {
                warn!(
                    path = %self.path.display(),
                    error = %truncate,
                    "Failed to cut back a partial transition record"
                );
            }
            return Err(e.into());
        }

        *last_seq = record.seq;
        Ok(record)
    }

    async fn for_workflow(&self, workflow_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let workflow_id = workflow_id.to_string();
        self.load_filtered(move |r| r.workflow_id == workflow_id).await
    }

    async fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        self.load_filtered(move |r| r.timestamp >= from && r.timestamp <= to)
            .await
    }

    async fn all(&self) -> Result<Vec<TransitionRecord>, StoreError> {
        self.load_filtered(|_| true).await
    }
}
