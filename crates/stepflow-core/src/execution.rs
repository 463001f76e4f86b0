use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ErrorKind, ExecutionId, ExecutionStatus, LogLevel, NodeStatus, StepId, WorkflowId,
};

/// One timestamped event in an execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Originating step, `None` for execution-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl LogEntry {
    pub fn info(step_id: Option<StepId>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id,
            level: LogLevel::Info,
            message: message.into(),
            error_kind: None,
        }
    }

    pub fn warn(step_id: Option<StepId>, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warn,
            ..Self::info(step_id, message)
        }
    }

    pub fn error(step_id: Option<StepId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            error_kind: Some(kind),
            ..Self::info(step_id, message)
        }
    }
}

/// The trace of one run of a workflow snapshot.
///
/// Mutable while the execution is running or suspended; once `status` reaches
/// `success` or `failed` the record is sealed. Serialized in camelCase, this is
/// also the execution trace handed to audit consumers and retry tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub node_statuses: BTreeMap<StepId, NodeStatus>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// The serialized form of a record handed to the audit sink.
pub type ExecutionTrace = ExecutionRecord;

impl ExecutionRecord {
    /// Start a record with every step pending.
    pub fn new<'a>(
        workflow_id: WorkflowId,
        workflow_version: u32,
        steps: impl IntoIterator<Item = &'a StepId>,
    ) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id,
            workflow_version,
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            node_statuses: steps
                .into_iter()
                .map(|id| (id.clone(), NodeStatus::Pending))
                .collect(),
            log: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn status_of(&self, step: &StepId) -> NodeStatus {
        self.node_statuses.get(step).copied().unwrap_or_default()
    }

    /// Steps currently waiting for a human decision.
    pub fn awaiting_approval(&self) -> Vec<&StepId> {
        self.node_statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::AwaitingApproval)
            .map(|(id, _)| id)
            .collect()
    }

    /// Steps that failed, in id order. A retry tool restarts from these.
    pub fn failed_steps(&self) -> Vec<&StepId> {
        self.node_statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Failed)
            .map(|(id, _)| id)
            .collect()
    }

    /// Log entries originating from a single step.
    pub fn log_for<'a>(&'a self, step: &'a StepId) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.log
            .iter()
            .filter(move |e| e.step_id.as_ref() == Some(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_pending() {
        let steps = vec![StepId::from("a"), StepId::from("b")];
        let rec = ExecutionRecord::new(WorkflowId::from("wf"), 1, &steps);
        assert_eq!(rec.status, ExecutionStatus::Running);
        assert_eq!(rec.status_of(&StepId::from("a")), NodeStatus::Pending);
        assert!(rec.completed_at.is_none());
        assert!(!rec.is_terminal());
    }

    #[test]
    fn trace_serializes_camel_case() {
        let steps = vec![StepId::from("a")];
        let mut rec = ExecutionRecord::new(WorkflowId::from("wf"), 3, &steps);
        rec.log.push(LogEntry::error(
            Some(StepId::from("a")),
            ErrorKind::AgentInvocation,
            "boom",
        ));
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["workflowVersion"], 3);
        assert_eq!(json["nodeStatuses"]["a"], "pending");
        assert_eq!(json["log"][0]["stepId"], "a");
        assert_eq!(json["log"][0]["errorKind"], "agent_invocation");
        assert!(json["completedAt"].is_null());
    }

    #[test]
    fn log_filtering_by_step() {
        let steps = vec![StepId::from("a"), StepId::from("b")];
        let mut rec = ExecutionRecord::new(WorkflowId::from("wf"), 1, &steps);
        rec.log.push(LogEntry::info(Some(StepId::from("a")), "one"));
        rec.log.push(LogEntry::info(Some(StepId::from("b")), "two"));
        rec.log.push(LogEntry::info(None, "three"));
        let a = StepId::from("a");
        assert_eq!(rec.log_for(&a).count(), 1);
    }

    #[test]
    fn open_steps_by_status() {
        let steps: Vec<StepId> = ["a", "b", "c", "d"].into_iter().map(StepId::from).collect();
        let mut rec = ExecutionRecord::new(WorkflowId::from("wf"), 1, &steps);
        rec.node_statuses.insert(StepId::from("a"), NodeStatus::Success);
        rec.node_statuses.insert(StepId::from("b"), NodeStatus::AwaitingApproval);
        rec.node_statuses.insert(StepId::from("c"), NodeStatus::Failed);
        rec.node_statuses.insert(StepId::from("d"), NodeStatus::Failed);

        assert_eq!(rec.awaiting_approval(), vec![&StepId::from("b")]);
        assert_eq!(rec.failed_steps(), vec![&StepId::from("c"), &StepId::from("d")]);
    }
}
