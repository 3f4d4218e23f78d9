use anyhow::Result;

use crate::analytics::{format_report, ReportOptions, WorkflowAnalyzer};

use super::WorkflowApp;

pub async fn report(
    app: &WorkflowApp,
    content_type: Option<String>,
    assignee: Option<String>,
    window_days: i64,
    json: bool,
) -> Result<()> {
    let options = ReportOptions {
        content_type,
        assignee,
        efficiency_window_days: window_days,
    };
    let report = WorkflowAnalyzer::new(app.engine.clone())
        .generate_report(&options)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}
