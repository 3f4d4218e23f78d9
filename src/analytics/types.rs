use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_EFFICIENCY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOptions {
    /// Only workflows for this content type.
    pub content_type: Option<String>,
    /// Only workflows assigned to this user.
    pub assignee: Option<String>,
    pub efficiency_window_days: i64,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            content_type: None,
            assignee: None,
            efficiency_window_days: DEFAULT_EFFICIENCY_WINDOW_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCount {
    pub stage: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueItem {
    pub workflow_id: String,
    pub content_id: String,
    pub content_title: String,
    pub stage: String,
    pub deadline: DateTime<Utc>,
    pub days_overdue: i64,
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproachingItem {
    pub workflow_id: String,
    pub content_id: String,
    pub content_title: String,
    pub stage: String,
    pub deadline: DateTime<Utc>,
    pub days_remaining: i64,
    pub assignees: Vec<String>,
}

/// Time spent in one stage, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimeStats {
    pub stage: String,
    pub samples: Vec<f64>,
    pub average_hours: f64,
    pub median_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyMetrics {
    pub window_days: i64,
    pub published_count: u64,
    pub total_content: u64,
    pub publish_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub generated_at: DateTime<Utc>,
    pub total_workflows: usize,
    pub stage_counts: Vec<StageCount>,
    pub overdue_content: Vec<OverdueItem>,
    pub approaching_deadlines: Vec<ApproachingItem>,
    pub stage_time_stats: Vec<StageTimeStats>,
    pub bottleneck_stage: Option<String>,
    pub efficiency: EfficiencyMetrics,
}

impl WorkflowReport {
    pub fn count_for(&self, stage: &str) -> Option<usize> {
        self.stage_counts
            .iter()
            .find(|c| c.stage == stage)
            .map(|c| c.count)
    }

    pub fn time_stats_for(&self, stage: &str) -> Option<&StageTimeStats> {
        self.stage_time_stats.iter().find(|s| s.stage == stage)
    }
}
