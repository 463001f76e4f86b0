use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use stepflow_core::config::AppConfig;
use stepflow_core::error::StepflowError;
use stepflow_core::traits::WorkflowStore;
use stepflow_core::types::{ApprovalDecision, ExecutionStatus, NodeStatus, StepId};
use stepflow_core::workflow::{validate, StepSpec, WorkflowGraph};
use stepflow_engine::{AuditLogger, WorkflowEngine};
use stepflow_test_utils::{checkpoint_workflow, linear_workflow, temp_store, ScriptedDirectory};

fn config_in(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.workspace = dir.display().to_string();
    config
}

#[test]
fn removing_a_step_cleans_connections_and_checkpoints() {
    let mut g = WorkflowGraph::new().with_name("cleanup");
    let a = g.add_step(StepSpec::new("agent-a", "Writer"));
    let b = g.add_step(StepSpec::new("agent-b", "Editor"));
    let c = g.add_step(StepSpec::new("agent-c", "Publisher"));
    g.add_connection(a.clone(), b.clone(), None);
    g.add_connection(c.clone(), b.clone(), None);
    assert!(g.add_hitl_checkpoint(&b));

    assert!(g.remove_step(&b));

    assert!(g.connections.is_empty());
    assert!(g.metadata.hitl_checkpoints.is_empty());
    let orders: Vec<u32> = g.steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![1, 2]);
    assert!(validate(&g).is_valid);
}

#[test]
fn saved_snapshot_round_trips() {
    let (store, _dir) = temp_store();
    let mut g = checkpoint_workflow("round trip");
    g.metadata.description = "review before publishing".into();
    g.metadata.expected_duration = 15;

    let first = store.save(&g).unwrap();
    let loaded = store.load_latest(&first.workflow_id).unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.graph, g);

    // editing after save never touches the stored version
    g.add_step(StepSpec::new("agent-d", "Archivist").with_id("d"));
    g.add_connection("c", "d", None);
    let second = store.save(&g).unwrap();
    assert_eq!(second.version, 2);
    assert_eq!(store.load_version(&g.id, 1).unwrap().graph.steps.len(), 3);
    assert_eq!(store.list_versions(&g.id).unwrap().len(), 2);
}

#[test]
fn invalid_graph_can_only_be_drafted() {
    let (store, _dir) = temp_store();
    let mut g = WorkflowGraph::new();
    g.add_step(StepSpec::default());

    match store.save(&g) {
        Err(StepflowError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.contains("name is required")));
            assert!(errors.iter().any(|e| e.contains("agent not assigned")));
        }
        other => panic!("expected validation error, got {:?}", other.map(|s| s.to_string())),
    }

    store.save_draft(&g).unwrap();
    assert_eq!(store.load_draft(&g.id).unwrap(), Some(g.clone()));
    assert!(store.list_workflows().unwrap().is_empty());
}

#[tokio::test]
async fn supervised_run_is_audited_and_sealed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    let store = Arc::new(stepflow_store::SqliteWorkflowStore::open(&config.database_path()).unwrap());
    let directory = ScriptedDirectory::new();
    directory.push_output("agent-a", json!({"draft": "hello"}));
    let engine = WorkflowEngine::new(config.clone(), store.clone(), Arc::new(directory.clone()));

    let cancel = CancellationToken::new();
    let audit = tokio::spawn(
        AuditLogger::new(config.audit_dir()).run(engine.event_bus().clone(), cancel.clone()),
    );
    // let the logger subscribe before anything is published
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snap = engine.save(&checkpoint_workflow("publish")).unwrap();
    let mut handle = engine.execute(&snap.workflow_id, json!({})).await.unwrap();

    let suspended = tokio::time::timeout(Duration::from_secs(5), handle.settled())
        .await
        .unwrap();
    assert_eq!(suspended.status, ExecutionStatus::Suspended);
    assert_eq!(
        store.load_execution(handle.id()).unwrap().status,
        ExecutionStatus::Suspended
    );

    let b = StepId::from("b");
    let request = &engine.pending_for(handle.id()).await[0];
    assert_eq!(request.output, json!("ok"));
    engine
        .decide(handle.id(), &b, ApprovalDecision::Approve, "ship it")
        .await
        .unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), handle.finished())
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.status_of(&StepId::from("c")), NodeStatus::Success);

    // stored trace matches and is sealed
    let stored = store.load_execution(handle.id()).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Success);
    assert_eq!(stored.log, record.log);
    assert!(matches!(
        store.record_execution(&stored),
        Err(StepflowError::RecordSealed(_))
    ));

    cancel.cancel();
    audit.await.unwrap();

    let audit_file = config.audit_dir().join(format!("{}.jsonl", handle.id()));
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(audit_file)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines[0]["eventType"], "execution_started");
    assert!(lines
        .iter()
        .any(|l| l["eventType"] == "approval_resolved" && l["detail"]["decision"] == "approve"));
    assert_eq!(lines.last().unwrap()["eventType"], "execution_finished");
}

#[tokio::test]
async fn concurrent_executions_are_independent() {
    let (store, _dir) = temp_store();
    let directory = ScriptedDirectory::new();
    directory.set_delay("agent-b", Duration::from_millis(20));
    let engine = WorkflowEngine::new(AppConfig::default(), Arc::new(store), Arc::new(directory.clone()));
    let snap = engine.save(&linear_workflow("parallel runs")).unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(
            engine
                .execute(&snap.workflow_id, json!({ "run": i }))
                .await
                .unwrap(),
        );
    }
    for handle in &mut handles {
        let record = tokio::time::timeout(Duration::from_secs(5), handle.finished())
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
    }

    assert_eq!(directory.calls("agent-b"), 4);
    assert_eq!(engine.list_executions(&snap.workflow_id).unwrap().len(), 4);
}
