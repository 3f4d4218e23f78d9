//! Content store collaborator.
//!
//! The workflow subsystem only needs to know whether a content item exists,
//! snapshot its title and type, flag it published and count the catalog.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tokio::sync::Mutex;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSummary {
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub status: String,
}

impl ContentSummary {
    pub fn draft(title: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content_type: content_type.into(),
            status: "draft".to_string(),
        }
    }
}

pub const PUBLISHED_STATUS: &str = "published";

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn find_by_id(&self, content_id: &str) -> Result<Option<ContentSummary>>;

    async fn mark_published(&self, content_id: &str) -> Result<()>;

    /// Total number of content items, used as the efficiency denominator.
    async fn count(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    items: RwLock<HashMap<String, ContentSummary>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = (String, ContentSummary)>,
    {
        Self {
            items: RwLock::new(items.into_iter().collect()),
        }
    }

    pub fn insert(&self, content_id: impl Into<String>, summary: ContentSummary) {
        self.items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(content_id.into(), summary);
    }

    pub fn status_of(&self, content_id: &str) -> Option<String> {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(content_id)
            .map(|c| c.status.clone())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn find_by_id(&self, content_id: &str) -> Result<Option<ContentSummary>> {
        Ok(self
            .items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(content_id)
            .cloned())
    }

    async fn mark_published(&self, content_id: &str) -> Result<()> {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        let item = items
            .get_mut(content_id)
            .with_context(|| format!("content {content_id} does not exist"))?;
        item.status = PUBLISHED_STATUS.to_string();
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.items.read().unwrap_or_else(|e| e.into_inner()).len() as u64)
    }
}

/// Content catalog kept as a JSON object `{ "<content id>": {title, type, status} }`.
#[derive(Debug)]
pub struct JsonFileContentStore {
    path: PathBuf,
    items: Mutex<HashMap<String, ContentSummary>>,
}

impl JsonFileContentStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let items = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("invalid content catalog {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    pub async fn upsert(&self, content_id: &str, summary: ContentSummary) -> Result<()> {
        let mut items = self.items.lock().await;
        items.insert(content_id.to_string(), summary);
        self.save(&items).await
    }

    async fn save(&self, items: &HashMap<String, ContentSummary>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(items)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for JsonFileContentStore {
    async fn find_by_id(&self, content_id: &str) -> Result<Option<ContentSummary>> {
        Ok(self.items.lock().await.get(content_id).cloned())
    }

    async fn mark_published(&self, content_id: &str) -> Result<()> {
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(content_id)
            .with_context(|| format!("content {content_id} does not exist"))?;
        item.status = PUBLISHED_STATUS.to_string();
        self.save(&items).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.items.lock().await.len() as u64)
    }
}
