//! Run report types.

use crate::artifact::PublishedArtifact;
use crate::ids::{JobId, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-job state machine: `Pending -> Ready -> Running -> terminal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// A producer failure tolerated by a consumer under `add_problem_to_build`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Problem {
    pub producer: JobId,
    pub producer_state: JobState,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Why the job failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Agent profile the job was matched to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<Problem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub published: Vec<PublishedArtifact>,
}

impl JobRecord {
    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.state = JobState::Running;
        self.started_at = Some(at);
    }

    pub fn mark_finished(&mut self, state: JobState, at: DateTime<Utc>, failure: Option<String>) {
        self.state = state;
        self.completed_at = Some(at);
        self.failure = failure;
        if let Some(started) = self.started_at {
            self.duration_ms = u64::try_from((at - started).num_milliseconds()).ok();
        }
    }
}

/// Outcome of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub jobs: BTreeMap<JobId, JobRecord>,
}

impl RunReport {
    pub fn job(&self, id: &JobId) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|r| r.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.completed_at - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}
