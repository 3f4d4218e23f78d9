use anyhow::{anyhow, bail, Result};

use crate::workflow::{
    ChangeOptions, CreateWorkflowOptions, Priority, StageQueryOptions, TransitionKind, Workflow,
    WorkflowSort,
};

use super::{parse_deadline, print_workflow_line, WorkflowApp};

pub struct CreateArgs {
    pub stage: Option<String>,
    pub assignees: Vec<String>,
    pub deadline: Option<String>,
    pub priority: Option<String>,
    pub user: Option<String>,
    pub notes: Option<String>,
}

pub async fn create(app: &WorkflowApp, content_id: &str, args: CreateArgs) -> Result<()> {
    let deadline = args.deadline.as_deref().map(parse_deadline).transpose()?;
    let priority = args
        .priority
        .as_deref()
        .map(|p| p.parse::<Priority>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let workflow = app
        .engine
        .create_workflow(
            content_id,
            CreateWorkflowOptions {
                initial_stage: args.stage,
                assignees: args.assignees,
                deadline,
                priority,
                user: args.user,
                notes: args.notes,
                ..CreateWorkflowOptions::default()
            },
        )
        .await?;

    println!(
        "🚀 Workflow {} tracks \"{}\" in stage {}",
        workflow.workflow_id,
        workflow.content_title,
        workflow.current_stage()
    );
    Ok(())
}

pub async fn stage(
    app: &WorkflowApp,
    workflow_id: &str,
    stage: &str,
    user: Option<String>,
    notes: Option<String>,
) -> Result<()> {
    let before = app.engine.get_workflow(workflow_id).await?;
    let after = app
        .engine
        .update_stage(workflow_id, stage, ChangeOptions { user, notes })
        .await?;

    if before.version == after.version {
        println!("ℹ️  Workflow {workflow_id} is already in {}", after.current_stage());
    } else {
        println!(
            "➡️  Workflow {workflow_id}: {} → {}",
            before.current_stage(),
            after.current_stage()
        );
    }
    Ok(())
}

pub async fn assign(
    app: &WorkflowApp,
    workflow_id: &str,
    assignees: Vec<String>,
    user: Option<String>,
    notes: Option<String>,
) -> Result<()> {
    let workflow = app
        .engine
        .update_assignees(workflow_id, assignees, ChangeOptions { user, notes })
        .await?;
    let names: Vec<_> = workflow.assignees.iter().cloned().collect();
    println!("👥 Workflow {workflow_id} assigned to {}", names.join(", "));
    Ok(())
}

pub async fn deadline(
    app: &WorkflowApp,
    workflow_id: &str,
    deadline: Option<&str>,
    user: Option<String>,
) -> Result<()> {
    let deadline = deadline.map(parse_deadline).transpose()?;
    let workflow = app
        .engine
        .update_deadline(workflow_id, deadline, ChangeOptions { user, notes: None })
        .await?;
    match workflow.deadline {
        Some(at) => println!("⏰ Workflow {workflow_id} due {}", at.format("%Y-%m-%d %H:%M UTC")),
        None => println!("⏰ Workflow {workflow_id} has no deadline"),
    }
    Ok(())
}

pub async fn show(app: &WorkflowApp, id: &str, by_content: bool) -> Result<()> {
    let workflow = if by_content {
        app.engine
            .get_workflow_for_content(id)
            .await?
            .ok_or_else(|| anyhow!("no workflow for content {id}"))?
    } else {
        app.engine.get_workflow(id).await?
    };
    print_workflow_detail(&workflow);
    Ok(())
}

pub async fn history(app: &WorkflowApp, workflow_id: &str, limit: Option<usize>) -> Result<()> {
    let records = app.engine.get_workflow_history(workflow_id, limit).await?;
    println!("📜 History of {workflow_id} (newest first)");
    for record in records {
        let change = match (&record.kind, &record.from_stage) {
            (TransitionKind::Created, _) => format!("created in {}", record.to_stage),
            (TransitionKind::StageChanged, Some(from)) => format!("{from} → {}", record.to_stage),
            (TransitionKind::StageChanged, None) => format!("→ {}", record.to_stage),
            (TransitionKind::AssigneesChanged, _) => "assignees changed".to_string(),
            (TransitionKind::DeadlineChanged, _) => "deadline changed".to_string(),
            (TransitionKind::Rejected, _) => format!("rejected in {}", record.to_stage),
        };
        println!(
            "   #{:<5} {}  {:<24} by {}{}",
            record.seq,
            record.timestamp.format("%Y-%m-%d %H:%M"),
            change,
            record.user,
            record
                .notes
                .as_deref()
                .map(|n| format!("  ({n})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn list(
    app: &WorkflowApp,
    stage: &str,
    content_type: Option<String>,
    assignee: Option<String>,
    sort: &str,
    limit: Option<usize>,
) -> Result<()> {
    let options = StageQueryOptions {
        content_type,
        assignee,
        sort: parse_sort(sort)?,
        limit,
    };
    let workflows = app.engine.get_workflows_by_stage(stage, options).await?;
    println!("📋 {} workflow(s) in {stage}", workflows.len());
    workflows.iter().for_each(print_workflow_line);
    Ok(())
}

pub async fn overdue(app: &WorkflowApp) -> Result<()> {
    let workflows = app.engine.get_overdue_content().await?;
    if workflows.is_empty() {
        println!("✅ Nothing is overdue");
        return Ok(());
    }
    println!("🚨 {} overdue workflow(s)", workflows.len());
    workflows.iter().for_each(print_workflow_line);
    Ok(())
}

pub async fn approaching(app: &WorkflowApp, days: Option<i64>) -> Result<()> {
    let days = days.unwrap_or_else(|| app.engine.deadline_approach_days());
    let workflows = app.engine.get_approaching_deadlines(Some(days)).await?;
    println!("⏰ {} deadline(s) in the next {days} day(s)", workflows.len());
    workflows.iter().for_each(print_workflow_line);
    Ok(())
}

fn parse_sort(input: &str) -> Result<WorkflowSort> {
    match input.to_ascii_lowercase().as_str() {
        "updated" => Ok(WorkflowSort::UpdatedDesc),
        "created" => Ok(WorkflowSort::CreatedDesc),
        "deadline" => Ok(WorkflowSort::DeadlineAsc),
        "priority" => Ok(WorkflowSort::PriorityDesc),
        other => bail!("unknown sort '{other}', expected updated, created, deadline or priority"),
    }
}

fn print_workflow_detail(workflow: &Workflow) {
    println!("📄 Workflow {}", workflow.workflow_id);
    println!("   Content:   {} ({})", workflow.content_id, workflow.content_type);
    println!("   Title:     {}", workflow.content_title);
    println!("   Stage:     {}", workflow.current_stage());
    println!("   Priority:  {:?}", workflow.priority);
    if !workflow.assignees.is_empty() {
        let names: Vec<_> = workflow.assignees.iter().cloned().collect();
        println!("   Assignees: {}", names.join(", "));
    }
    if let Some(deadline) = workflow.deadline {
        println!("   Deadline:  {}", deadline.format("%Y-%m-%d %H:%M UTC"));
    }
    println!("   Updated:   {}", workflow.updated_at.format("%Y-%m-%d %H:%M UTC"));
    println!("   Version:   {}", workflow.version);
    println!("   Stages visited:");
    for entry in workflow.stage_history().entries() {
        println!(
            "     {}  {:<10} by {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.stage,
            entry.user
        );
    }
}
