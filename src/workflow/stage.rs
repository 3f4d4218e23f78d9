use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::errors::{ConfigError, WorkflowError};

/// A stage name that has been validated against a [`StageSet`].
///
/// Only `StageSet::resolve` hands these out, so holding a `Stage` means the
/// name was a member of the configured list at the boundary where it entered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Stage {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Stage {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Ordered list of stages a workflow moves through.
///
/// The first entry is where new workflows start, the last one is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSet {
    stages: Arc<[Stage]>,
}

impl StageSet {
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stages: Vec<Stage> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyStageName);
            }
            if stages.iter().any(|s| s.0 == name) {
                return Err(ConfigError::DuplicateStage(name.to_string()));
            }
            stages.push(Stage(name.to_string()));
        }
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        Ok(Self {
            stages: stages.into(),
        })
    }

    pub fn resolve(&self, name: &str) -> Result<Stage, WorkflowError> {
        self.stages
            .iter()
            .find(|s| s.0 == name)
            .cloned()
            .ok_or_else(|| WorkflowError::InvalidStage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.0 == name)
    }

    pub fn position(&self, stage: &Stage) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn first(&self) -> &Stage {
        &self.stages[0]
    }

    pub fn second(&self) -> Option<&Stage> {
        self.stages.get(1)
    }

    pub fn terminal(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    pub fn is_terminal(&self, stage: &Stage) -> bool {
        stage == self.terminal()
    }

    /// Stage after `stage` in list order, `None` at the terminal stage.
    pub fn next(&self, stage: &Stage) -> Option<&Stage> {
        self.position(stage).and_then(|i| self.stages.get(i + 1))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageSet {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES
                .iter()
                .map(|s| Stage((*s).to_string()))
                .collect::<Vec<_>>()
                .into(),
        }
    }
}

pub const DEFAULT_STAGES: [&str; 5] = ["draft", "review", "approved", "scheduled", "published"];
