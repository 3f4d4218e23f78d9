//! Dwell time: how long workflows sat in each stage.
//!
//! Per workflow, the stage-changing log entries are walked in timestamp
//! order; the gap between entering a stage and leaving it is one sample for
//! that stage. Entries that keep the stage (assignee, deadline and rejection
//! notes) do not end a dwell interval, and the stage a workflow is currently
//! in has no completed interval yet.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::workflow::{Stage, StageSet, TransitionRecord};

use super::types::StageTimeStats;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Completed dwell intervals in hours, keyed by stage.
pub fn dwell_samples(records: &[TransitionRecord]) -> HashMap<Stage, Vec<f64>> {
    let mut by_workflow: BTreeMap<&str, Vec<&TransitionRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_stage_change()) {
        by_workflow
            .entry(record.workflow_id.as_str())
            .or_default()
            .push(record);
    }

    let mut samples: HashMap<Stage, Vec<f64>> = HashMap::new();
    for mut entries in by_workflow.into_values() {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));

        let mut current: Option<(&Stage, DateTime<Utc>)> = None;
        for record in entries {
            current = match current {
                Some((stage, entered_at)) if stage != &record.to_stage => {
                    let hours = (record.timestamp - entered_at).num_milliseconds() as f64 / MILLIS_PER_HOUR;
                    samples.entry(stage.clone()).or_default().push(hours);
                    Some((&record.to_stage, record.timestamp))
                }
                None => Some((&record.to_stage, record.timestamp)),
                same_stage => same_stage,
            };
        }
    }
    samples
}

/// Stats for every configured stage, in configured order. Stages without
/// samples report zeros.
pub fn stage_time_stats(stages: &StageSet, mut samples: HashMap<Stage, Vec<f64>>) -> Vec<StageTimeStats> {
    stages
        .iter()
        .map(|stage| summarize(stage, samples.remove(stage).unwrap_or_default()))
        .collect()
}

pub fn summarize(stage: &Stage, samples: Vec<f64>) -> StageTimeStats {
    StageTimeStats {
        stage: stage.to_string(),
        average_hours: mean(&samples),
        median_hours: median(&samples),
        samples,
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
