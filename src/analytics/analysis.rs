use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{ceil_days, shift_days};
use crate::workflow::{Workflow, WorkflowEngine, WorkflowQuery, WorkflowSort};

use super::bottleneck::find_bottleneck;
use super::dwell::{dwell_samples, stage_time_stats};
use super::types::*;

/// Read-only reporting over the workflow store and transition log.
///
/// Every section is computed independently; a section whose data cannot be
/// loaded is logged and reported empty rather than failing the report.
#[derive(Debug, Clone)]
pub struct WorkflowAnalyzer {
    engine: Arc<WorkflowEngine>,
}

impl WorkflowAnalyzer {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub async fn generate_report(&self, options: &ReportOptions) -> WorkflowReport {
        let now = self.engine.now();
        let workflows = self.load_population(options).await;
        let ids: HashSet<&str> = workflows.iter().map(|w| w.workflow_id.as_str()).collect();

        let stage_counts = self.stage_counts(&workflows);
        let bottleneck_stage = find_bottleneck(&stage_counts);
        let overdue_content = self.overdue(&workflows, now);
        let approaching_deadlines = self.approaching(&workflows, now);
        let stage_time_stats = self.dwell_stats(&ids).await;
        let efficiency = self.efficiency(&ids, options, now).await;

        info!(
            workflows = workflows.len(),
            overdue = overdue_content.len(),
            approaching = approaching_deadlines.len(),
            bottleneck = ?bottleneck_stage,
            "Workflow report generated"
        );

        WorkflowReport {
            generated_at: now,
            total_workflows: workflows.len(),
            stage_counts,
            overdue_content,
            approaching_deadlines,
            stage_time_stats,
            bottleneck_stage,
            efficiency,
        }
    }

    async fn load_population(&self, options: &ReportOptions) -> Vec<Workflow> {
        let query = WorkflowQuery::all()
            .with_content_type(options.content_type.clone())
            .with_assignee(options.assignee.clone())
            .sorted_by(WorkflowSort::DeadlineAsc);
        match self.engine.store().find_many(&query).await {
            Ok(workflows) => workflows,
            Err(e) => {
                warn!(error = %e, "Failed to load workflows for report");
                Vec::new()
            }
        }
    }

    fn stage_counts(&self, workflows: &[Workflow]) -> Vec<StageCount> {
        self.engine
            .stages()
            .iter()
            .map(|stage| StageCount {
                stage: stage.to_string(),
                count: workflows.iter().filter(|w| w.current_stage() == stage).count(),
            })
            .collect()
    }

    fn open_with_deadline<'a>(
        &'a self,
        workflows: &'a [Workflow],
    ) -> impl Iterator<Item = (&'a Workflow, DateTime<Utc>)> + 'a {
        let stages = self.engine.stages();
        workflows
            .iter()
            .filter(move |w| !stages.is_terminal(w.current_stage()))
            .filter_map(|w| w.deadline.map(|d| (w, d)))
    }

    fn overdue(&self, workflows: &[Workflow], now: DateTime<Utc>) -> Vec<OverdueItem> {
        self.open_with_deadline(workflows)
            .filter(|(_, deadline)| *deadline < now)
            .map(|(w, deadline)| OverdueItem {
                workflow_id: w.workflow_id.clone(),
                content_id: w.content_id.clone(),
                content_title: w.content_title.clone(),
                stage: w.current_stage().to_string(),
                deadline,
                days_overdue: ceil_days(now - deadline),
                assignees: w.assignees.iter().cloned().collect(),
            })
            .collect()
    }

    fn approaching(&self, workflows: &[Workflow], now: DateTime<Utc>) -> Vec<ApproachingItem> {
        let horizon = shift_days(now, self.engine.deadline_approach_days());
        self.open_with_deadline(workflows)
            .filter(|(_, deadline)| *deadline >= now && *deadline <= horizon)
            .map(|(w, deadline)| ApproachingItem {
                workflow_id: w.workflow_id.clone(),
                content_id: w.content_id.clone(),
                content_title: w.content_title.clone(),
                stage: w.current_stage().to_string(),
                deadline,
                days_remaining: ceil_days(deadline - now),
                assignees: w.assignees.iter().cloned().collect(),
            })
            .collect()
    }

    async fn dwell_stats(&self, ids: &HashSet<&str>) -> Vec<StageTimeStats> {
        let records = match self.engine.log().all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load transition log for dwell times");
                Vec::new()
            }
        };
        let relevant: Vec<_> = records
            .into_iter()
            .filter(|r| ids.contains(r.workflow_id.as_str()))
            .collect();
        stage_time_stats(self.engine.stages(), dwell_samples(&relevant))
    }

    async fn efficiency(
        &self,
        ids: &HashSet<&str>,
        options: &ReportOptions,
        now: DateTime<Utc>,
    ) -> EfficiencyMetrics {
        let window_days = options.efficiency_window_days;
        let terminal = self.engine.stages().terminal();

        let published_count = match self
            .engine
            .log()
            .between(shift_days(now, window_days.saturating_neg()), now)
            .await
        {
            Ok(records) => records
                .iter()
                .filter(|r| r.is_stage_change() && &r.to_stage == terminal)
                .filter(|r| ids.contains(r.workflow_id.as_str()))
                .count() as u64,
            Err(e) => {
                warn!(error = %e, "Failed to load recent transitions for efficiency");
                0
            }
        };

        let total_content = match self.engine.content().count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count content items");
                0
            }
        };

        let publish_rate_percent = if total_content > 0 {
            published_count as f64 / total_content as f64 * 100.0
        } else {
            0.0
        };

        EfficiencyMetrics {
            window_days,
            published_count,
            total_content,
            publish_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::InProcessEventBus;
    use crate::external::content::{ContentSummary, InMemoryContentStore, MockContentStore};
    use crate::external::notifications::RecordingNotificationSink;
    use crate::external::ContentStore;
    use crate::workflow::store::MockWorkflowStore;
    use crate::workflow::{
        ChangeOptions, CreateWorkflowOptions, EngineCollaborators, InMemoryTransitionLog,
        InMemoryWorkflowStore, StageSet, StoreError, TransitionLog,
    };
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 4, 9, 0, 0).unwrap()
    }

    fn build(
        clock: &ManualClock,
        store: Arc<dyn crate::workflow::WorkflowStore>,
        content: Arc<dyn ContentStore>,
    ) -> Arc<WorkflowEngine> {
        Arc::new(
            WorkflowEngine::new(
                StageSet::default(),
                EngineCollaborators {
                    store,
                    log: Arc::new(InMemoryTransitionLog::new()) as Arc<dyn TransitionLog>,
                    content,
                    notifier: Arc::new(RecordingNotificationSink::new()),
                    events: Arc::new(InProcessEventBus::new()),
                },
            )
            .with_clock(Arc::new(clock.clone())),
        )
    }

    fn catalog() -> Arc<InMemoryContentStore> {
        Arc::new(InMemoryContentStore::with_items([
            ("C1".to_string(), ContentSummary::draft("One", "article")),
            ("C2".to_string(), ContentSummary::draft("Two", "article")),
            ("C3".to_string(), ContentSummary::draft("Three", "video")),
            ("C4".to_string(), ContentSummary::draft("Four", "video")),
        ]))
    }

    #[tokio::test]
    async fn empty_system_reports_zeros_and_no_bottleneck() {
        let clock = ManualClock::new(t0());
        let engine = build(&clock, Arc::new(InMemoryWorkflowStore::new()), catalog());
        let report = WorkflowAnalyzer::new(engine)
            .generate_report(&ReportOptions::default())
            .await;

        assert_eq!(report.total_workflows, 0);
        assert!(report.stage_counts.iter().all(|c| c.count == 0));
        assert_eq!(report.bottleneck_stage, None);
        assert_eq!(report.efficiency.published_count, 0);
        assert_eq!(report.efficiency.total_content, 4);
        assert_eq!(report.efficiency.publish_rate_percent, 0.0);
        assert_eq!(report.stage_time_stats.len(), 5);
    }

    #[tokio::test]
    async fn report_covers_counts_deadlines_dwell_and_efficiency() {
        let clock = ManualClock::new(t0());
        let engine = build(&clock, Arc::new(InMemoryWorkflowStore::new()), catalog());

        let a = engine
            .create_workflow(
                "C1",
                CreateWorkflowOptions {
                    deadline: Some(t0() - Duration::hours(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let b = engine
            .create_workflow(
                "C2",
                CreateWorkflowOptions {
                    deadline: Some(t0() + Duration::hours(12)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .create_workflow("C3", CreateWorkflowOptions::default())
            .await
            .unwrap();

        clock.advance(Duration::hours(10));
        engine
            .update_stage(&b.workflow_id, "review", ChangeOptions::default())
            .await
            .unwrap();
        clock.advance(Duration::hours(2));
        engine
            .update_stage(&b.workflow_id, "published", ChangeOptions::default())
            .await
            .unwrap();

        let report = WorkflowAnalyzer::new(engine.clone())
            .generate_report(&ReportOptions::default())
            .await;

        assert_eq!(report.total_workflows, 3);
        assert_eq!(report.count_for("draft"), Some(2));
        assert_eq!(report.count_for("published"), Some(1));
        assert_eq!(report.bottleneck_stage.as_deref(), Some("draft"));

        assert_eq!(report.overdue_content.len(), 1);
        assert_eq!(report.overdue_content[0].workflow_id, a.workflow_id);
        // 30h late at creation plus 12h since: 42h rounds up to 2 days.
        assert_eq!(report.overdue_content[0].days_overdue, 2);
        assert!(report.approaching_deadlines.is_empty());

        let draft = report.time_stats_for("draft").unwrap();
        assert_eq!(draft.samples, vec![10.0]);
        let review = report.time_stats_for("review").unwrap();
        assert_eq!(review.samples, vec![2.0]);
        assert_eq!(review.median_hours, 2.0);

        assert_eq!(report.efficiency.published_count, 1);
        assert_eq!(report.efficiency.publish_rate_percent, 25.0);
    }

    #[tokio::test]
    async fn filters_restrict_the_population() {
        let clock = ManualClock::new(t0());
        let engine = build(&clock, Arc::new(InMemoryWorkflowStore::new()), catalog());
        for id in ["C1", "C3", "C4"] {
            engine
                .create_workflow(
                    id,
                    CreateWorkflowOptions {
                        assignees: vec![if id == "C4" { "vic" } else { "ann" }.to_string()],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let analyzer = WorkflowAnalyzer::new(engine);

        let videos = analyzer
            .generate_report(&ReportOptions {
                content_type: Some("video".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(videos.total_workflows, 2);

        let ann = analyzer
            .generate_report(&ReportOptions {
                assignee: Some("ann".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(ann.total_workflows, 2);
    }

    #[tokio::test]
    async fn section_failures_are_suppressed() {
        let clock = ManualClock::new(t0());
        let mut store = MockWorkflowStore::new();
        store
            .expect_find_many()
            .returning(|_| Err(StoreError::Backend("db offline".into())));
        let mut content = MockContentStore::new();
        content
            .expect_count()
            .returning(|| Err(anyhow::anyhow!("catalog offline")));

        let engine = build(&clock, Arc::new(store), Arc::new(content));
        let report = WorkflowAnalyzer::new(engine)
            .generate_report(&ReportOptions::default())
            .await;

        assert_eq!(report.total_workflows, 0);
        assert_eq!(report.efficiency.total_content, 0);
        assert_eq!(report.efficiency.publish_rate_percent, 0.0);
    }
}
