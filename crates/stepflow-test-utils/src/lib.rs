//! Shared test utilities for stepflow crates: a scripted agent directory,
//! graph fixtures for the standard scenarios, and scratch stores.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{AgentDirectory, AgentInput, AgentResponse};
use stepflow_core::types::{ExecutionId, HitlMode};
use stepflow_core::workflow::{StepSpec, WorkflowGraph};
use stepflow_store::SqliteWorkflowStore;

/// What a scripted agent does when invoked.
#[derive(Debug, Clone)]
pub enum Reply {
    Respond(AgentResponse),
    /// The call itself fails (transport error).
    Error(String),
}

#[derive(Default)]
struct Script {
    queues: HashMap<String, VecDeque<Reply>>,
    defaults: HashMap<String, Reply>,
    delays: HashMap<String, Duration>,
    capabilities: HashMap<String, BTreeSet<String>>,
    calls: Vec<(String, AgentInput)>,
    cancelled: Vec<ExecutionId>,
}

/// Agent directory that answers from per-agent scripts.
///
/// Queued replies are consumed first; once a queue is empty the agent's
/// default reply is used, falling back to `success("ok")`.
#[derive(Clone, Default)]
pub struct ScriptedDirectory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful output for the next invocation of `agent`.
    pub fn push_output(&self, agent: &str, output: Value) -> &Self {
        self.push(agent, Reply::Respond(AgentResponse::success(output)))
    }

    pub fn push(&self, agent: &str, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .queues
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used once the queue for `agent` is exhausted.
    pub fn set_default(&self, agent: &str, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .defaults
            .insert(agent.to_string(), reply);
        self
    }

    pub fn set_delay(&self, agent: &str, delay: Duration) -> &Self {
        self.script
            .lock()
            .unwrap()
            .delays
            .insert(agent.to_string(), delay);
        self
    }

    pub fn set_capabilities(&self, agent: &str, caps: &[&str]) -> &Self {
        self.script.lock().unwrap().capabilities.insert(
            agent.to_string(),
            caps.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    /// Number of invocations of `agent` so far.
    pub fn calls(&self, agent: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(called, _)| called == agent)
            .count()
    }

    /// Every input received, in call order.
    pub fn inputs(&self) -> Vec<AgentInput> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub fn cancelled(&self) -> Vec<ExecutionId> {
        self.script.lock().unwrap().cancelled.clone()
    }
}

impl AgentDirectory for ScriptedDirectory {
    fn invoke(&self, agent_ref: &str, input: AgentInput) -> BoxFuture<'_, Result<AgentResponse>> {
        let (reply, delay) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((agent_ref.to_string(), input));
            let queued = script.queues.get_mut(agent_ref).and_then(|q| q.pop_front());
            let reply = queued
                .or_else(|| script.defaults.get(agent_ref).cloned())
                .unwrap_or_else(|| Reply::Respond(AgentResponse::success(Value::from("ok"))));
            (reply, script.delays.get(agent_ref).copied())
        };
        let agent = agent_ref.to_string();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Respond(response) => Ok(response),
                Reply::Error(message) => Err(StepflowError::AgentInvocation { agent, message }),
            }
        })
    }

    fn resolve_capabilities(&self, agent_ref: &str) -> BoxFuture<'_, Result<BTreeSet<String>>> {
        let caps = self
            .script
            .lock()
            .unwrap()
            .capabilities
            .get(agent_ref)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(caps) })
    }

    fn cancel(&self, execution_id: &ExecutionId) -> BoxFuture<'_, ()> {
        self.script
            .lock()
            .unwrap()
            .cancelled
            .push(execution_id.clone());
        Box::pin(async {})
    }
}

/// Add a step whose agent is `agent-<id>`.
pub fn add_step(graph: &mut WorkflowGraph, id: &str) {
    graph.add_step(StepSpec::new(format!("agent-{}", id), "Worker").with_id(id));
}

/// `a -> b -> c`, no conditions.
pub fn linear_workflow(name: &str) -> WorkflowGraph {
    let mut g = WorkflowGraph::new().with_name(name);
    for id in ["a", "b", "c"] {
        add_step(&mut g, id);
    }
    g.add_connection("a", "b", None);
    g.add_connection("b", "c", None);
    g
}

/// `a -(approved)-> b`, `a -(rejected)-> c`.
pub fn branching_workflow(name: &str) -> WorkflowGraph {
    let mut g = WorkflowGraph::new().with_name(name);
    for id in ["a", "b", "c"] {
        add_step(&mut g, id);
    }
    g.add_connection("a", "b", Some("approved"));
    g.add_connection("a", "c", Some("rejected"));
    g
}

/// Linear `a -> b -> c` with `b` as a supervised checkpoint.
pub fn checkpoint_workflow(name: &str) -> WorkflowGraph {
    let mut g = WorkflowGraph::new().with_name(name);
    add_step(&mut g, "a");
    g.add_step(
        StepSpec::new("agent-b", "Reviewer")
            .with_id("b")
            .with_hitl(HitlMode::Hitl, ["sam"]),
    );
    add_step(&mut g, "c");
    g.add_connection("a", "b", None);
    g.add_connection("b", "c", None);
    g.add_hitl_checkpoint(&"b".into());
    g
}

/// `a -> b`, `b -(done)-> c`, and a loop-back `b -(retry)-> a` bounded by
/// `max_iterations`.
pub fn loop_workflow(name: &str, max_iterations: u32) -> WorkflowGraph {
    let mut g = WorkflowGraph::new().with_name(name);
    for id in ["a", "b", "c"] {
        add_step(&mut g, id);
    }
    g.add_connection("a", "b", None);
    g.add_connection("b", "c", Some("done"));
    g.add_loop_connection("b", "a", Some("retry"), max_iterations);
    g
}

/// SQLite store on a file inside a fresh temp directory. Keep the returned
/// `TempDir` alive for as long as the store is used.
pub fn temp_store() -> (SqliteWorkflowStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteWorkflowStore::open(&dir.path().join("stepflow.db")).unwrap();
    (store, dir)
}
