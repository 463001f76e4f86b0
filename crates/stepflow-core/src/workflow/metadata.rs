use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::schedule::Schedule;
use crate::types::StepId;

/// Workflow-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    /// Required before the workflow can be saved as a snapshot.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: Schedule,
    /// Expected run time in minutes, 0 when unknown.
    #[serde(default)]
    pub expected_duration: u32,
    /// Steps whose results must be approved by a human.
    #[serde(default)]
    pub hitl_checkpoints: BTreeSet<StepId>,
}

/// Partial metadata update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<Schedule>,
    pub expected_duration: Option<u32>,
}

impl MetadataPatch {
    pub(crate) fn apply(self, meta: &mut WorkflowMetadata) {
        if let Some(name) = self.name {
            meta.name = name;
        }
        if let Some(description) = self.description {
            meta.description = description;
        }
        if let Some(schedule) = self.schedule {
            meta.schedule = schedule;
        }
        if let Some(minutes) = self.expected_duration {
            meta.expected_duration = minutes;
        }
    }
}
