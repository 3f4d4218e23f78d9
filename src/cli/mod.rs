use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Instrument;

use crate::config::ContentWorkflowConfig;
use crate::telemetry::workflow_span;

pub mod commands;

use commands::WorkflowApp;

#[derive(Parser)]
#[command(name = "content-workflow")]
#[command(about = "Editorial workflow tracking for content items")]
#[command(long_about = "Tracks content through configurable editorial stages (draft, review, approved, \
                       scheduled, published by default), keeps an append-only transition log, sends \
                       deadline reminders and reports on bottlenecks. Start with 'content-workflow add-content' \
                       and 'content-workflow create'.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register or update a content item in the local catalog
    AddContent {
        content_id: String,
        #[arg(long, help = "Content title")]
        title: String,
        #[arg(long = "type", default_value = "article", help = "Content type, e.g. article, video")]
        content_type: String,
    },
    /// Start tracking a content item
    Create {
        content_id: String,
        #[arg(long, help = "Initial stage (defaults to the first configured stage)")]
        stage: Option<String>,
        #[arg(long = "assignee", help = "Assignee user id, repeatable")]
        assignees: Vec<String>,
        #[arg(long, help = "Deadline as RFC 3339 or YYYY-MM-DD")]
        deadline: Option<String>,
        #[arg(long, help = "low, normal, high or urgent")]
        priority: Option<String>,
        #[arg(long, help = "Acting user")]
        user: Option<String>,
        #[arg(long, help = "Note stored with the first history entry")]
        notes: Option<String>,
    },
    /// Move a workflow to another stage
    Stage {
        workflow_id: String,
        stage: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Replace the assignees of a workflow
    Assign {
        workflow_id: String,
        #[arg(required = true)]
        assignees: Vec<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Set or clear a workflow deadline
    Deadline {
        workflow_id: String,
        #[arg(required_unless_present = "clear", help = "RFC 3339 or YYYY-MM-DD")]
        deadline: Option<String>,
        #[arg(long, conflicts_with = "deadline")]
        clear: bool,
        #[arg(long)]
        user: Option<String>,
    },
    /// Record that a content item was edited (may auto-progress drafts)
    Updated { content_id: String },
    /// Record a review decision for a content item
    Review {
        content_id: String,
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        #[arg(long)]
        reject: bool,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        comments: Option<String>,
    },
    /// Show a workflow
    Show {
        /// Workflow id, or content id with --content
        id: String,
        #[arg(long, help = "Treat the id as a content id")]
        content: bool,
    },
    /// Show the transition log of a workflow, newest first
    History {
        workflow_id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List workflows in a stage
    List {
        stage: String,
        #[arg(long = "type")]
        content_type: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value = "updated", help = "updated, created, deadline or priority")]
        sort: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List workflows past their deadline
    Overdue,
    /// List workflows with a deadline coming up
    Approaching {
        #[arg(long, help = "Days ahead to look (defaults to configuration)")]
        days: Option<i64>,
    },
    /// Workflow analytics report
    Report {
        #[arg(long = "type")]
        content_type: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, default_value = "30", help = "Days counted for publishing efficiency")]
        window_days: i64,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
    /// Run one reminder and stall-check pass
    Remind,
    /// Run the reminder scheduler until Ctrl-C
    Watch,
}

pub async fn run(command: Option<Commands>, config: ContentWorkflowConfig) -> Result<()> {
    let Some(command) = command else {
        commands::show_getting_started();
        return Ok(());
    };

    let app = WorkflowApp::open(config).await?;
    match command {
        Commands::AddContent {
            content_id,
            title,
            content_type,
        } => commands::content::add_content(&app, &content_id, &title, &content_type).await,
        Commands::Create {
            content_id,
            stage,
            assignees,
            deadline,
            priority,
            user,
            notes,
        } => {
            let args = commands::workflow::CreateArgs {
                stage,
                assignees,
                deadline,
                priority,
                user,
                notes,
            };
            commands::workflow::create(&app, &content_id, args)
                .instrument(workflow_span("create", None))
                .await
        }
        Commands::Stage {
            workflow_id,
            stage,
            user,
            notes,
        } => {
            let span = workflow_span("update_stage", Some(&workflow_id));
            commands::workflow::stage(&app, &workflow_id, &stage, user, notes)
                .instrument(span)
                .await
        }
        Commands::Assign {
            workflow_id,
            assignees,
            user,
            notes,
        } => {
            let span = workflow_span("update_assignees", Some(&workflow_id));
            commands::workflow::assign(&app, &workflow_id, assignees, user, notes)
                .instrument(span)
                .await
        }
        Commands::Deadline {
            workflow_id,
            deadline,
            clear,
            user,
        } => {
            let span = workflow_span("update_deadline", Some(&workflow_id));
            let deadline = if clear { None } else { deadline };
            commands::workflow::deadline(&app, &workflow_id, deadline.as_deref(), user)
                .instrument(span)
                .await
        }
        Commands::Updated { content_id } => commands::events::updated(&app, &content_id).await,
        Commands::Review {
            content_id,
            approve,
            reject,
            reviewer,
            comments,
        } => {
            if !approve && !reject {
                anyhow::bail!("pass --approve or --reject");
            }
            commands::events::review(&app, &content_id, approve, &reviewer, comments.as_deref()).await
        }
        Commands::Show { id, content } => commands::workflow::show(&app, &id, content).await,
        Commands::History { workflow_id, limit } => {
            commands::workflow::history(&app, &workflow_id, limit).await
        }
        Commands::List {
            stage,
            content_type,
            assignee,
            sort,
            limit,
        } => commands::workflow::list(&app, &stage, content_type, assignee, &sort, limit).await,
        Commands::Overdue => commands::workflow::overdue(&app).await,
        Commands::Approaching { days } => commands::workflow::approaching(&app, days).await,
        Commands::Report {
            content_type,
            assignee,
            window_days,
            json,
        } => commands::report::report(&app, content_type, assignee, window_days, json).await,
        Commands::Remind => commands::remind::remind(&app).await,
        Commands::Watch => commands::remind::watch(&app).await,
    }
}
