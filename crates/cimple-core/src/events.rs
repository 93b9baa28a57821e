//! Build lifecycle events recorded in the journal.

use crate::ids::BuildId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All events a build can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum Event {
    // Build lifecycle
    BuildStarted(BuildStartedPayload),
    BuildSucceeded(BuildFinishedPayload),
    BuildFailed(BuildFailedPayload),

    // Task lifecycle
    TaskStarted(TaskStartedPayload),
    TaskSkipped(TaskSkippedPayload),
    TaskSuccessful(TaskPayload),
    TaskFailed(TaskPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepSkipped(StepPayload),
    StepSuccessful(StepPayload),
    StepFailed(StepFailedPayload),
}

impl Event {
    /// Name written in the `type` field of a journal record.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::BuildStarted(_) => "build_started",
            Event::BuildSucceeded(_) => "build_succeeded",
            Event::BuildFailed(_) => "build_failed",
            Event::TaskStarted(_) => "task_started",
            Event::TaskSkipped(_) => "task_skipped",
            Event::TaskSuccessful(_) => "task_successful",
            Event::TaskFailed(_) => "task_failed",
            Event::StepStarted(_) => "step_started",
            Event::StepSkipped(_) => "step_skipped",
            Event::StepSuccessful(_) => "step_successful",
            Event::StepFailed(_) => "step_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStartedPayload {
    pub build_id: BuildId,
    pub project: String,
    pub repo: Option<String>,
    pub tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFinishedPayload {
    pub build_id: BuildId,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFailedPayload {
    pub build_id: BuildId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub id: String,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSkippedPayload {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub id: String,
    pub env: BTreeMap<String, String>,
    pub step: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedPayload {
    pub id: String,
    pub reason: String,
}

/// One line of the journal: the event, its type and when it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    #[serde(flatten)]
    pub event: Event,
    pub time: DateTime<Utc>,
}

impl JournalRecord {
    pub fn now(event: Event) -> Self {
        Self {
            event,
            time: Utc::now(),
        }
    }
}
