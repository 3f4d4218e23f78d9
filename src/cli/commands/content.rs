use anyhow::Result;

use crate::external::{ContentStore, ContentSummary};

use super::WorkflowApp;

pub async fn add_content(app: &WorkflowApp, content_id: &str, title: &str, content_type: &str) -> Result<()> {
    let summary = match app.content.find_by_id(content_id).await? {
        Some(mut existing) => {
            existing.title = title.to_string();
            existing.content_type = content_type.to_string();
            existing
        }
        None => ContentSummary::draft(title, content_type),
    };
    let status = summary.status.clone();
    app.content.upsert(content_id, summary).await?;
    println!("✅ Content {content_id} saved ({content_type}, {status})");
    Ok(())
}
