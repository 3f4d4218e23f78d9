use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topics the content platform publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "content.updated")]
    ContentUpdated,
    #[serde(rename = "content.reviewed")]
    ContentReviewed,
    #[serde(rename = "content.published")]
    ContentPublished,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ContentUpdated => "content.updated",
            Topic::ContentReviewed => "content.reviewed",
            Topic::ContentPublished => "content.published",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content lifecycle events carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum ContentEvent {
    #[serde(rename = "content.updated")]
    Updated {
        content_id: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "content.reviewed")]
    Reviewed {
        content_id: String,
        approved: bool,
        reviewer: String,
        #[serde(default)]
        comments: Option<String>,
    },
    #[serde(rename = "content.published")]
    Published {
        content_id: String,
        workflow_id: String,
        user: String,
        published_at: DateTime<Utc>,
    },
}

impl ContentEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ContentEvent::Updated { .. } => Topic::ContentUpdated,
            ContentEvent::Reviewed { .. } => Topic::ContentReviewed,
            ContentEvent::Published { .. } => Topic::ContentPublished,
        }
    }

    pub fn content_id(&self) -> &str {
        match self {
            ContentEvent::Updated { content_id, .. }
            | ContentEvent::Reviewed { content_id, .. }
            | ContentEvent::Published { content_id, .. } => content_id,
        }
    }
}
