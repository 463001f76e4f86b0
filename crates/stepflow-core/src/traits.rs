use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::execution::{ExecutionRecord, LogEntry};
use crate::types::{ExecutionId, StepId, WorkflowId};
use crate::workflow::{
    SnapshotId, VersionInfo, WorkflowGraph, WorkflowSnapshot, WorkflowStats,
    WorkflowSummary,
};

/// Payload sent to an agent for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub role: String,
    pub task: String,
    pub engines: BTreeSet<String>,
    /// External input the execution was started with.
    pub input: serde_json::Value,
    /// Outputs of the steps that activated this one.
    pub upstream: BTreeMap<StepId, serde_json::Value>,
    /// 0 on the first pass, incremented each time a loop re-runs the step.
    pub iteration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Failure,
}

/// What an agent returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub status: InvocationStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl AgentResponse {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            status: InvocationStatus::Success,
            output,
            elapsed_ms: 0,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Failure,
            output: serde_json::Value::String(message.into()),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    /// The label conditional edges are compared against.
    pub fn result_label(&self) -> Option<String> {
        result_label(&self.output)
    }
}

/// Extract a branch label from an agent output.
///
/// A string is its own label. An object is labelled by its `label`, `result`
/// or `status` string field, checked in that order.
pub fn result_label(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => ["label", "result", "status"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string),
        _ => None,
    }
}

/// Agent directory: resolves and invokes the agent behind a step.
pub trait AgentDirectory: Send + Sync + 'static {
    /// Invoke an agent. `Err` means the call itself failed; an agent that ran
    /// and reported failure returns `Ok` with `InvocationStatus::Failure`.
    fn invoke(&self, agent_ref: &str, input: AgentInput) -> BoxFuture<'_, Result<AgentResponse>>;

    /// Engine tags the agent declares.
    fn resolve_capabilities(&self, agent_ref: &str) -> BoxFuture<'_, Result<BTreeSet<String>>>;

    /// Best-effort cancellation of in-flight invocations for an execution.
    fn cancel(&self, execution_id: &ExecutionId) -> BoxFuture<'_, ()> {
        let _ = execution_id;
        Box::pin(async {})
    }
}

/// Workflow store: immutable snapshots, mutable drafts and execution records.
pub trait WorkflowStore: Send + Sync + 'static {
    /// Validate and persist a new snapshot with the next version number.
    fn save(&self, graph: &WorkflowGraph) -> Result<SnapshotId>;

    fn load_latest(&self, workflow_id: &WorkflowId) -> Result<WorkflowSnapshot>;

    fn load_version(&self, workflow_id: &WorkflowId, version: u32) -> Result<WorkflowSnapshot>;

    /// Saved versions, oldest first.
    fn list_versions(&self, workflow_id: &WorkflowId) -> Result<Vec<VersionInfo>>;

    /// Workflows that have a saved version and have not been deleted.
    fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;

    /// Retire a workflow. It leaves `list_workflows` and `load_latest`, but
    /// its snapshots stay so existing executions still resolve. Saving it
    /// again brings it back. Returns false if it was already retired.
    fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<bool>;

    /// Store the editable copy of a workflow. No validation.
    fn save_draft(&self, graph: &WorkflowGraph) -> Result<()>;

    fn load_draft(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowGraph>>;

    fn delete_draft(&self, workflow_id: &WorkflowId) -> Result<bool>;

    /// Insert or update an execution record. Fails with `RecordSealed` once the
    /// stored record is terminal.
    fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Append one log entry to a non-terminal record.
    fn append_log(&self, execution_id: &ExecutionId, entry: &LogEntry) -> Result<()>;

    fn load_execution(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord>;

    /// Executions of a workflow, newest first.
    fn list_executions(&self, workflow_id: &WorkflowId) -> Result<Vec<ExecutionRecord>>;

    fn execution_log(&self, execution_id: &ExecutionId) -> Result<Vec<LogEntry>> {
        Ok(self.load_execution(execution_id)?.log)
    }

    /// Execution counts by status and mean duration of finished runs.
    fn workflow_stats(&self, workflow_id: &WorkflowId) -> Result<WorkflowStats>;
}
