use anyhow::Result;

use crate::scheduler::TickOutcome;
use crate::shutdown::ShutdownCoordinator;

use super::WorkflowApp;

pub async fn remind(app: &WorkflowApp) -> Result<()> {
    match app.scheduler().run_tick().await {
        TickOutcome::Completed(report) => {
            println!(
                "🔔 {} reminder(s) sent ({} approaching, {} overdue)",
                report.reminders_sent, report.approaching, report.overdue
            );
            println!(
                "🐢 {} stall notice(s) sent for {} stalled workflow(s)",
                report.stall_notices_sent, report.stalled
            );
            if report.failed_notifications > 0 {
                println!("⚠️  {} notification(s) failed", report.failed_notifications);
            }
            for error in &report.errors {
                println!("❌ {error}");
            }
        }
        TickOutcome::Skipped => println!("⏭️  A reminder pass is already running"),
    }
    Ok(())
}

pub async fn watch(app: &WorkflowApp) -> Result<()> {
    let scheduler = app.scheduler();
    scheduler.start();
    println!(
        "👀 Watching workflows, reminders every {:?}. Press Ctrl-C to stop.",
        app.config.workflow.reminder_frequency
    );

    ShutdownCoordinator::new(scheduler)
        .with_event_bus(app.bus.clone())
        .wait_for_shutdown()
        .await
}
