use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use stepflow_core::config::AppConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventBus;
use stepflow_core::execution::{ExecutionRecord, LogEntry};
use stepflow_core::traits::{AgentDirectory, WorkflowStore};
use stepflow_core::types::{ApprovalDecision, ApprovalRecord, ApprovalRequest, ExecutionId, StepId, WorkflowId};
use stepflow_core::workflow::{
    validate, validate_with_directory, SnapshotId, ValidationReport, VersionInfo, WorkflowGraph,
    WorkflowSnapshot, WorkflowStats, WorkflowSummary,
};

use crate::approval::ApprovalCoordinator;
use crate::executor::{spawn_execution, ExecutionHandle, ExecutorContext, LiveExecutions};
use crate::state::{ExecutionState, StepEvent};

/// Entry point for editing, saving and running workflows.
///
/// Owns the event bus and the approval coordinator shared by every
/// execution it starts. Cheap to share behind an `Arc`.
pub struct WorkflowEngine {
    config: AppConfig,
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn AgentDirectory>,
    event_bus: Arc<EventBus>,
    approvals: Arc<ApprovalCoordinator>,
    live: LiveExecutions,
}

impl WorkflowEngine {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn WorkflowStore>,
        directory: Arc<dyn AgentDirectory>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.engine.event_bus_capacity));
        let approvals = Arc::new(ApprovalCoordinator::new(
            event_bus.clone(),
            config.hitl.approval_timeout(),
        ));
        Self {
            config,
            store,
            directory,
            event_bus,
            approvals,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Structural validation plus capability warnings from the directory.
    pub async fn validate(&self, graph: &WorkflowGraph) -> ValidationReport {
        validate_with_directory(graph, self.directory.as_ref()).await
    }

    pub fn save(&self, graph: &WorkflowGraph) -> Result<SnapshotId> {
        let id = self.store.save(graph)?;
        info!(snapshot = %id, "Workflow saved");
        Ok(id)
    }

    pub fn save_draft(&self, graph: &WorkflowGraph) -> Result<()> {
        self.store.save_draft(graph)
    }

    pub fn load_draft(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowGraph>> {
        self.store.load_draft(workflow_id)
    }

    pub fn delete_draft(&self, workflow_id: &WorkflowId) -> Result<bool> {
        self.store.delete_draft(workflow_id)
    }

    pub fn load_latest(&self, workflow_id: &WorkflowId) -> Result<WorkflowSnapshot> {
        self.store.load_latest(workflow_id)
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        self.store.list_workflows()
    }

    /// Retire a workflow. Past executions and their snapshots stay readable.
    pub fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let retired = self.store.delete_workflow(workflow_id)?;
        if retired {
            info!(workflow_id = %workflow_id, "Workflow deleted");
        }
        Ok(retired)
    }

    /// Save a copy of the latest version under a fresh id, as version 1.
    pub fn duplicate_workflow(&self, workflow_id: &WorkflowId) -> Result<SnapshotId> {
        let source = self.store.load_latest(workflow_id)?;
        let mut graph = source.graph;
        graph.id = WorkflowId::new();
        graph.metadata.name = format!("{} (copy)", graph.metadata.name);
        let id = self.store.save(&graph)?;
        info!(source = %workflow_id, snapshot = %id, "Workflow duplicated");
        Ok(id)
    }

    /// A saved snapshot as pretty JSON. `None` exports the latest version.
    pub fn export_workflow(&self, workflow_id: &WorkflowId, version: Option<u32>) -> Result<String> {
        let snapshot = match version {
            Some(v) => self.store.load_version(workflow_id, v)?,
            None => self.store.load_latest(workflow_id)?,
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Save an exported snapshot, or a bare graph, as the next version of
    /// its workflow id. The exported version number is not reused.
    pub fn import_workflow(&self, json: &str) -> Result<SnapshotId> {
        let graph = match serde_json::from_str::<WorkflowSnapshot>(json) {
            Ok(snapshot) => snapshot.graph,
            Err(_) => serde_json::from_str::<WorkflowGraph>(json)?,
        };
        let id = self.store.save(&graph)?;
        info!(snapshot = %id, "Workflow imported");
        Ok(id)
    }

    pub fn workflow_stats(&self, workflow_id: &WorkflowId) -> Result<WorkflowStats> {
        self.store.workflow_stats(workflow_id)
    }

    pub fn list_versions(&self, workflow_id: &WorkflowId) -> Result<Vec<VersionInfo>> {
        self.store.list_versions(workflow_id)
    }

    pub fn list_executions(&self, workflow_id: &WorkflowId) -> Result<Vec<ExecutionRecord>> {
        self.store.list_executions(workflow_id)
    }

    pub fn load_execution(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        self.store.load_execution(execution_id)
    }

    pub fn execution_log(&self, execution_id: &ExecutionId) -> Result<Vec<LogEntry>> {
        self.store.execution_log(execution_id)
    }

    /// Start an execution of the latest saved version of a workflow.
    pub async fn execute(&self, workflow_id: &WorkflowId, input: Value) -> Result<ExecutionHandle> {
        let snapshot = self.store.load_latest(workflow_id)?;
        self.execute_snapshot(Arc::new(snapshot), input).await
    }

    /// Start an execution of a specific snapshot.
    ///
    /// Structural errors are returned before anything is recorded.
    pub async fn execute_snapshot(
        &self,
        snapshot: Arc<WorkflowSnapshot>,
        input: Value,
    ) -> Result<ExecutionHandle> {
        let report = validate(&snapshot.graph);
        if !report.is_valid {
            return Err(StepflowError::Validation(report.errors));
        }
        let state = ExecutionState::new(Arc::clone(&snapshot), input)?;
        let step_timeout = self
            .config
            .engine
            .step_timeout(snapshot.graph.metadata.expected_duration);

        let ctx = ExecutorContext {
            directory: self.directory.clone(),
            store: self.store.clone(),
            event_bus: self.event_bus.clone(),
            approvals: self.approvals.clone(),
        };
        let handle = spawn_execution(state, ctx, step_timeout, self.live.clone()).await;
        info!(
            execution_id = %handle.id(),
            snapshot = %snapshot.id(),
            timeout_secs = step_timeout.as_secs(),
            "Execution submitted"
        );
        Ok(handle)
    }

    /// Record a decision for a step awaiting approval.
    pub async fn decide(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
        decision: ApprovalDecision,
        comment: impl Into<String>,
    ) -> Result<()> {
        self.approvals
            .decide(execution_id, step_id, decision, comment)
            .await
    }

    /// Cancel a live execution. Non-terminal steps become skipped and the
    /// record fails with the given reason.
    pub async fn cancel(&self, execution_id: &ExecutionId, reason: impl Into<String>) -> Result<()> {
        let live = self.live.lock().await;
        let Some(events) = live.get(execution_id) else {
            return Err(StepflowError::ExecutionNotFound(execution_id.to_string()));
        };
        let reason = reason.into();
        warn!(execution_id = %execution_id, reason = %reason, "Cancelling execution");
        events
            .send(StepEvent::Cancel { reason })
            .map_err(|_| StepflowError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Ids of executions whose driver is still running.
    pub async fn live_executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.live.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.approvals.pending_requests().await
    }

    pub async fn pending_for(&self, execution_id: &ExecutionId) -> Vec<ApprovalRequest> {
        self.approvals.pending_for(execution_id).await
    }

    pub async fn approval_history(&self) -> Vec<ApprovalRecord> {
        self.approvals.history().await
    }
}
