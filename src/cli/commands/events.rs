use anyhow::Result;

use crate::events::BridgeOutcome;

use super::WorkflowApp;

pub async fn updated(app: &WorkflowApp, content_id: &str) -> Result<()> {
    let outcome = app.bridge.on_content_updated(content_id).await?;
    print_outcome(content_id, &outcome);
    Ok(())
}

pub async fn review(
    app: &WorkflowApp,
    content_id: &str,
    approved: bool,
    reviewer: &str,
    comments: Option<&str>,
) -> Result<()> {
    let outcome = app
        .bridge
        .on_content_reviewed(content_id, approved, reviewer, comments)
        .await?;
    print_outcome(content_id, &outcome);
    Ok(())
}

fn print_outcome(content_id: &str, outcome: &BridgeOutcome) {
    match outcome {
        BridgeOutcome::NoWorkflow => println!("ℹ️  No workflow tracks content {content_id}"),
        BridgeOutcome::Ignored => println!("ℹ️  Nothing to do for content {content_id}"),
        BridgeOutcome::Advanced {
            workflow_id,
            to_stage,
        } => println!("➡️  Workflow {workflow_id} moved to {to_stage}"),
        BridgeOutcome::Rejected { workflow_id } => {
            println!("↩️  Rejection recorded on workflow {workflow_id}")
        }
    }
}
