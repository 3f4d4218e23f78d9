use super::types::*;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Renders a report as plain text for the terminal.
pub fn format_report(report: &WorkflowReport) -> String {
    let mut out = String::new();

    out.push_str("📋 CONTENT WORKFLOW REPORT\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!(
        "   Generated: {}\n   Workflows: {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M UTC"),
        report.total_workflows
    ));

    out.push_str("📊 STAGES\n");
    let width = report
        .stage_counts
        .iter()
        .map(|c| c.stage.len())
        .max()
        .unwrap_or(0);
    for count in &report.stage_counts {
        let marker = if report.bottleneck_stage.as_deref() == Some(count.stage.as_str()) {
            "  ← bottleneck"
        } else {
            ""
        };
        out.push_str(&format!(
            "   {:<width$}  {:>4}{}\n",
            count.stage,
            count.count,
            marker,
            width = width
        ));
    }
    out.push('\n');

    out.push_str("⏱️  TIME IN STAGE (hours)\n");
    for stats in &report.stage_time_stats {
        if stats.samples.is_empty() {
            out.push_str(&format!("   {:<width$}  no completed intervals\n", stats.stage, width = width));
        } else {
            out.push_str(&format!(
                "   {:<width$}  avg {:.1}  median {:.1}  ({} samples)\n",
                stats.stage,
                stats.average_hours,
                stats.median_hours,
                stats.samples.len(),
                width = width
            ));
        }
    }
    out.push('\n');

    if !report.overdue_content.is_empty() {
        out.push_str(&format!("🚨 OVERDUE ({})\n", report.overdue_content.len()));
        for item in &report.overdue_content {
            out.push_str(&format!(
                "   {} [{}] {} day(s) overdue\n",
                item.content_title, item.stage, item.days_overdue
            ));
        }
        out.push('\n');
    }

    if !report.approaching_deadlines.is_empty() {
        out.push_str(&format!("⏰ DUE SOON ({})\n", report.approaching_deadlines.len()));
        for item in &report.approaching_deadlines {
            out.push_str(&format!(
                "   {} [{}] due in {} day(s)\n",
                item.content_title, item.stage, item.days_remaining
            ));
        }
        out.push('\n');
    }

    let eff = &report.efficiency;
    out.push_str("🚀 PUBLISHING\n");
    out.push_str(&format!(
        "   Published in last {} days: {} of {} items ({:.1}%)\n",
        eff.window_days, eff.published_count, eff.total_content, eff.publish_rate_percent
    ));

    out
}
