use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::graph::WorkflowGraph;
use crate::types::WorkflowId;

/// An immutable, versioned copy of a saved workflow.
///
/// Serializes as `{id, version, metadata, steps, connections}`. Executions
/// hold a snapshot behind an `Arc` and never see later edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub version: u32,
    #[serde(flatten)]
    pub graph: WorkflowGraph,
}

impl WorkflowSnapshot {
    pub fn new(graph: WorkflowGraph, version: u32) -> Self {
        Self { version, graph }
    }

    pub fn id(&self) -> SnapshotId {
        SnapshotId {
            workflow_id: self.graph.id.clone(),
            version: self.version,
        }
    }
}

/// Identifies one saved version of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub workflow_id: WorkflowId,
    pub version: u32,
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.workflow_id, self.version)
    }
}

/// One entry of a workflow's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
    pub name: String,
    pub saved_at: DateTime<Utc>,
}

/// Latest saved version of a workflow, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub latest_version: u32,
    pub saved_at: DateTime<Utc>,
}

/// Execution counts and timing for one workflow, across all versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStats {
    pub workflow_id: WorkflowId,
    pub total: usize,
    pub running: usize,
    pub suspended: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean wall time of finished executions.
    pub mean_duration_ms: Option<u64>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl WorkflowStats {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            ..Default::default()
        }
    }

    /// Share of finished executions that succeeded.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.succeeded + self.failed;
        (finished > 0).then(|| self.succeeded as f64 / finished as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepSpec;

    #[test]
    fn snapshot_wire_format() {
        let mut graph = WorkflowGraph::new().with_id("wf-1").with_name("Loans");
        graph.add_step(StepSpec::new("scorer", "Credit Analyst").with_id("score"));
        let snap = WorkflowSnapshot::new(graph.clone(), 2);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["id"], "wf-1");
        assert_eq!(json["version"], 2);
        assert_eq!(json["metadata"]["name"], "Loans");
        assert_eq!(json["steps"][0]["id"], "score");
        assert!(json["connections"].as_array().unwrap().is_empty());

        let parsed: WorkflowSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.graph, graph);
        assert_eq!(parsed.id().to_string(), "wf-1@v2");
    }

    #[test]
    fn success_rate_counts_finished_runs_only() {
        let mut stats = WorkflowStats::new(WorkflowId::from("wf-1"));
        assert_eq!(stats.success_rate(), None);
        stats.succeeded = 3;
        stats.failed = 1;
        stats.running = 5;
        assert_eq!(stats.success_rate(), Some(0.75));
    }
}
