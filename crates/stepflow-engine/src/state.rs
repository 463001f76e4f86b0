//! Event-driven execution state machine.
//!
//! `ExecutionState` owns one `ExecutionRecord` and advances it in response to
//! `StepEvent`s. It performs no I/O: every transition returns the `Effect`s
//! (agent invocations, approval requests) the caller must carry out, so the
//! whole traversal can be tested without timers or tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::execution::{ExecutionRecord, LogEntry};
use stepflow_core::traits::{result_label, AgentInput, AgentResponse};
use stepflow_core::types::{
    ApprovalDecision, ApprovalRequest, ConnectionId, ErrorKind, ExecutionId, ExecutionStatus,
    NodeStatus, StepId,
};
use stepflow_core::workflow::{loop_body, topological_order, Connection, WorkflowSnapshot};

/// Resolution of a forward edge within the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Pending,
    Activated,
    Deactivated,
}

/// Inputs that drive an execution forward.
#[derive(Debug, Clone)]
pub enum StepEvent {
    AgentCompleted {
        step_id: StepId,
        response: AgentResponse,
    },
    /// The invocation itself failed or timed out.
    AgentFailed {
        step_id: StepId,
        kind: ErrorKind,
        message: String,
    },
    ApprovalDecided {
        step_id: StepId,
        decision: ApprovalDecision,
        comment: String,
        timed_out: bool,
    },
    Cancel {
        reason: String,
    },
}

/// Work the caller must perform after a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    Invoke { agent_ref: String, input: AgentInput },
    RequestApproval(ApprovalRequest),
}

pub struct ExecutionState {
    snapshot: Arc<WorkflowSnapshot>,
    order: Vec<StepId>,
    input: Value,
    record: ExecutionRecord,
    edges: HashMap<ConnectionId, EdgeState>,
    /// Times each loop-back edge has fired.
    loop_counts: HashMap<ConnectionId, u32>,
    /// Times each step has been rewound by a loop.
    passes: HashMap<StepId, u32>,
    outputs: HashMap<StepId, Value>,
    /// Agent responses held back until a checkpoint is decided.
    held: HashMap<StepId, AgentResponse>,
    transitions: Vec<(StepId, NodeStatus)>,
}

impl ExecutionState {
    /// Fails with `Cycle` if the forward edges admit no topological order.
    pub fn new(snapshot: Arc<WorkflowSnapshot>, input: Value) -> Result<Self> {
        let order = topological_order(&snapshot.graph)?;
        let ids: Vec<StepId> = snapshot.graph.steps.iter().map(|s| s.id.clone()).collect();
        let record = ExecutionRecord::new(snapshot.graph.id.clone(), snapshot.version, &ids);
        let edges = snapshot
            .graph
            .connections
            .iter()
            .filter(|c| {
                !c.is_loop_back()
                    && snapshot.graph.contains_step(&c.from)
                    && snapshot.graph.contains_step(&c.to)
            })
            .map(|c| (c.id.clone(), EdgeState::Pending))
            .collect();

        Ok(Self {
            snapshot,
            order,
            input,
            record,
            edges,
            loop_counts: HashMap::new(),
            passes: HashMap::new(),
            outputs: HashMap::new(),
            held: HashMap::new(),
            transitions: Vec::new(),
        })
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.record.execution_id
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    pub fn snapshot(&self) -> &Arc<WorkflowSnapshot> {
        &self.snapshot
    }

    pub fn is_finished(&self) -> bool {
        self.record.is_terminal()
    }

    pub fn edge_state(&self, id: &ConnectionId) -> Option<EdgeState> {
        self.edges.get(id).copied()
    }

    pub fn loop_count(&self, id: &ConnectionId) -> u32 {
        self.loop_counts.get(id).copied().unwrap_or(0)
    }

    /// Step status changes since the last call, in order.
    pub fn drain_transitions(&mut self) -> Vec<(StepId, NodeStatus)> {
        std::mem::take(&mut self.transitions)
    }

    /// Dispatch the entry steps.
    pub fn start(&mut self) -> Vec<Effect> {
        let message = format!(
            "Execution started for {} ({} steps)",
            self.snapshot.id(),
            self.order.len()
        );
        self.log(LogEntry::info(None, message));
        let effects = self.advance();
        self.refresh_status();
        effects
    }

    pub fn apply(&mut self, event: StepEvent) -> Vec<Effect> {
        if self.is_finished() {
            debug!(execution_id = %self.record.execution_id, ?event, "Ignoring event for finished execution");
            return Vec::new();
        }

        let mut effects = Vec::new();
        match event {
            StepEvent::AgentCompleted { step_id, response } => {
                if !self.expect(&step_id, NodeStatus::Running) {
                    return effects;
                }
                if !response.is_success() {
                    let message = format!("Agent reported failure: {}", describe(&response.output));
                    self.fail(&step_id, ErrorKind::AgentInvocation, message);
                } else if self.snapshot.graph.is_checkpoint(&step_id) {
                    effects.extend(self.hold_for_approval(&step_id, response));
                } else {
                    self.succeed(&step_id, response.output, response.elapsed_ms);
                }
            }
            StepEvent::AgentFailed {
                step_id,
                kind,
                message,
            } => {
                if !self.expect(&step_id, NodeStatus::Running) {
                    return effects;
                }
                self.fail(&step_id, kind, message);
            }
            StepEvent::ApprovalDecided {
                step_id,
                decision,
                comment,
                timed_out,
            } => {
                if !self.expect(&step_id, NodeStatus::AwaitingApproval) {
                    return effects;
                }
                let response = self.held.remove(&step_id);
                match decision {
                    ApprovalDecision::Approve => {
                        self.log(LogEntry::info(
                            Some(step_id.clone()),
                            format!("Approved: {}", comment),
                        ));
                        let (output, elapsed_ms) = response
                            .map(|r| (r.output, r.elapsed_ms))
                            .unwrap_or((Value::Null, 0));
                        self.succeed(&step_id, output, elapsed_ms);
                    }
                    ApprovalDecision::Reject => {
                        let kind = if timed_out {
                            ErrorKind::ApprovalTimeout
                        } else {
                            ErrorKind::ApprovalRejected
                        };
                        self.fail(&step_id, kind, format!("Rejected: {}", comment));
                    }
                }
            }
            StepEvent::Cancel { reason } => {
                self.cancel(&reason);
                return effects;
            }
        }

        effects.extend(self.advance());
        self.refresh_status();
        effects
    }

    fn expect(&self, step_id: &StepId, status: NodeStatus) -> bool {
        let actual = self.record.status_of(step_id);
        if actual != status {
            debug!(
                execution_id = %self.record.execution_id,
                step_id = %step_id,
                expected = %status,
                actual = %actual,
                "Ignoring stale step event"
            );
            return false;
        }
        true
    }

    /// Dispatch every pending step whose inputs are resolved, and skip the
    /// ones no activated edge reaches.
    fn advance(&mut self) -> Vec<Effect> {
        let snapshot = Arc::clone(&self.snapshot);
        let mut effects = Vec::new();

        for i in 0..self.order.len() {
            let step_id = self.order[i].clone();
            if self.record.status_of(&step_id) != NodeStatus::Pending {
                continue;
            }

            let incoming: Vec<EdgeState> = snapshot
                .graph
                .incoming_forward(&step_id)
                .filter_map(|c| self.edges.get(&c.id).copied())
                .collect();
            if incoming.contains(&EdgeState::Pending) {
                continue;
            }
            if !incoming.is_empty() && !incoming.contains(&EdgeState::Activated) {
                self.set_status(&step_id, NodeStatus::Skipped);
                self.log(LogEntry::info(
                    Some(step_id.clone()),
                    "Skipped: no incoming branch was taken",
                ));
                self.resolve_outgoing(&step_id, |_| EdgeState::Deactivated);
                continue;
            }

            if let Some(effect) = self.dispatch(&step_id) {
                effects.push(effect);
            }
        }
        effects
    }

    fn dispatch(&mut self, step_id: &StepId) -> Option<Effect> {
        let snapshot = Arc::clone(&self.snapshot);
        let step = snapshot.graph.step(step_id)?;

        let upstream: BTreeMap<StepId, Value> = snapshot
            .graph
            .incoming_forward(step_id)
            .filter(|c| self.edges.get(&c.id) == Some(&EdgeState::Activated))
            .filter_map(|c| self.outputs.get(&c.from).map(|v| (c.from.clone(), v.clone())))
            .collect();
        let iteration = self.passes.get(step_id).copied().unwrap_or(0);

        self.set_status(step_id, NodeStatus::Running);
        self.log(LogEntry::info(
            Some(step_id.clone()),
            format!("Dispatched to agent {}", step.agent_ref),
        ));

        Some(Effect::Invoke {
            agent_ref: step.agent_ref.clone(),
            input: AgentInput {
                execution_id: self.record.execution_id.clone(),
                workflow_id: snapshot.graph.id.clone(),
                step_id: step_id.clone(),
                role: step.role.clone(),
                task: step.task.clone(),
                engines: step.engines_used.clone(),
                input: self.input.clone(),
                upstream,
                iteration,
            },
        })
    }

    fn hold_for_approval(&mut self, step_id: &StepId, response: AgentResponse) -> Option<Effect> {
        let snapshot = Arc::clone(&self.snapshot);
        let step = snapshot.graph.step(step_id)?;

        self.set_status(step_id, NodeStatus::AwaitingApproval);
        let reviewers: Vec<&str> = step.hitl_supervisors.iter().map(String::as_str).collect();
        self.log(LogEntry::info(
            Some(step_id.clone()),
            format!("Awaiting approval from {}", reviewers.join(", ")),
        ));

        let request = ApprovalRequest {
            execution_id: self.record.execution_id.clone(),
            workflow_id: snapshot.graph.id.clone(),
            step_id: step_id.clone(),
            agent_ref: step.agent_ref.clone(),
            role: step.role.clone(),
            supervisors: step.hitl_supervisors.clone(),
            output: response.output.clone(),
            requested_at: Utc::now(),
        };
        self.held.insert(step_id.clone(), response);
        Some(Effect::RequestApproval(request))
    }

    fn succeed(&mut self, step_id: &StepId, output: Value, elapsed_ms: u64) {
        let snapshot = Arc::clone(&self.snapshot);
        let label = result_label(&output);

        let back_edge = snapshot
            .graph
            .outgoing(step_id)
            .find(|c| c.is_loop_back() && c.matches(label.as_deref()));
        if let Some(back) = back_edge {
            let bound = back.max_iterations.unwrap_or(1);
            let fired = self.loop_count(&back.id);
            if fired + 1 >= bound {
                let err = StepflowError::LoopBoundExceeded {
                    step: step_id.to_string(),
                    bound,
                };
                self.fail(step_id, ErrorKind::LoopBoundExceeded, err.to_string());
                return;
            }
        }

        self.set_status(step_id, NodeStatus::Success);
        let message = match &label {
            Some(l) => format!("Completed in {}ms with result '{}'", elapsed_ms, l),
            None => format!("Completed in {}ms", elapsed_ms),
        };
        self.log(LogEntry::info(Some(step_id.clone()), message));
        self.outputs.insert(step_id.clone(), output);

        if let Some(back) = back_edge {
            if self.rewind(back) {
                return;
            }
            warn!(connection = %back.id, "Loop body is empty, ignoring loop-back edge");
        }

        self.resolve_outgoing(step_id, |c| {
            if c.matches(label.as_deref()) {
                EdgeState::Activated
            } else {
                EdgeState::Deactivated
            }
        });
    }

    /// Reset the body of a loop so it runs again. Returns false if the loop
    /// target does not lead back to its source.
    fn rewind(&mut self, back: &Connection) -> bool {
        let snapshot = Arc::clone(&self.snapshot);
        let body = loop_body(&snapshot.graph, &back.to, &back.from);
        if body.is_empty() {
            return false;
        }

        let fired = self.loop_count(&back.id) + 1;
        self.loop_counts.insert(back.id.clone(), fired);
        self.log(LogEntry::info(
            Some(back.from.clone()),
            format!(
                "Looping back to {} (pass {} of {})",
                back.to,
                fired + 1,
                back.max_iterations.unwrap_or(1)
            ),
        ));

        for conn in &snapshot.graph.connections {
            if !body.contains(&conn.from) {
                continue;
            }
            if conn.is_loop_back() {
                // nested loops start counting afresh
                if conn.id != back.id && body.contains(&conn.to) {
                    self.loop_counts.remove(&conn.id);
                }
            } else if let Some(state) = self.edges.get_mut(&conn.id) {
                *state = EdgeState::Pending;
            }
        }
        for id in &body {
            *self.passes.entry(id.clone()).or_insert(0) += 1;
            self.set_status(id, NodeStatus::Pending);
        }

        // steps fed by the body are decided again on this pass
        for id in self.downstream_of(&body) {
            let current = self.record.status_of(&id);
            if matches!(current, NodeStatus::Running | NodeStatus::AwaitingApproval) {
                continue;
            }
            self.outputs.remove(&id);
            for conn in snapshot.graph.outgoing(&id).filter(|c| !c.is_loop_back()) {
                if let Some(state) = self.edges.get_mut(&conn.id) {
                    *state = EdgeState::Pending;
                }
            }
            if current != NodeStatus::Pending {
                self.set_status(&id, NodeStatus::Pending);
            }
        }
        true
    }

    /// Steps outside `body` reachable from it through forward edges.
    fn downstream_of(&self, body: &BTreeSet<StepId>) -> BTreeSet<StepId> {
        let graph = &self.snapshot.graph;
        let mut seen = BTreeSet::new();
        let mut frontier: Vec<StepId> = body.iter().cloned().collect();
        while let Some(id) = frontier.pop() {
            for conn in graph.outgoing(&id).filter(|c| !c.is_loop_back()) {
                if !body.contains(&conn.to) && seen.insert(conn.to.clone()) {
                    frontier.push(conn.to.clone());
                }
            }
        }
        seen
    }

    fn fail(&mut self, step_id: &StepId, kind: ErrorKind, message: String) {
        warn!(
            execution_id = %self.record.execution_id,
            step_id = %step_id,
            ?kind,
            error = %message,
            "Step failed"
        );
        self.set_status(step_id, NodeStatus::Failed);
        self.log(LogEntry::error(Some(step_id.clone()), kind, message));
        self.resolve_outgoing(step_id, |_| EdgeState::Deactivated);
    }

    fn resolve_outgoing(&mut self, step_id: &StepId, decide: impl Fn(&Connection) -> EdgeState) {
        let snapshot = Arc::clone(&self.snapshot);
        for conn in snapshot.graph.outgoing(step_id).filter(|c| !c.is_loop_back()) {
            if let Some(state) = self.edges.get_mut(&conn.id) {
                *state = decide(conn);
            }
        }
    }

    fn cancel(&mut self, reason: &str) {
        let open: Vec<StepId> = self
            .record
            .node_statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &open {
            self.set_status(id, NodeStatus::Skipped);
        }
        self.held.clear();
        self.log(LogEntry::error(
            None,
            ErrorKind::Cancelled,
            format!("Execution cancelled: {}", reason),
        ));
        self.finish(ExecutionStatus::Failed);
    }

    fn refresh_status(&mut self) {
        if self.is_finished() {
            return;
        }
        let statuses = &self.record.node_statuses;
        let awaiting = statuses.values().any(|s| *s == NodeStatus::AwaitingApproval);
        let running = statuses.values().any(|s| *s == NodeStatus::Running);

        if awaiting {
            self.record.status = ExecutionStatus::Suspended;
            return;
        }
        if running {
            self.record.status = ExecutionStatus::Running;
            return;
        }

        // nothing in flight: whatever is still pending can never become ready
        let stuck: Vec<StepId> = statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stuck {
            self.set_status(id, NodeStatus::Skipped);
            self.log(LogEntry::warn(
                Some(id.clone()),
                "Skipped: inputs never resolved",
            ));
        }

        let failed = self
            .record
            .node_statuses
            .values()
            .any(|s| *s == NodeStatus::Failed);
        self.finish(if failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Success
        });
    }

    fn finish(&mut self, status: ExecutionStatus) {
        self.record.status = status;
        self.record.completed_at = Some(Utc::now());
        self.log(LogEntry::info(None, format!("Execution finished: {}", status)));
    }

    fn set_status(&mut self, step_id: &StepId, status: NodeStatus) {
        self.record.node_statuses.insert(step_id.clone(), status);
        self.transitions.push((step_id.clone(), status));
    }

    fn log(&mut self, entry: LogEntry) {
        self.record.log.push(entry);
    }
}

fn describe(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => "no details".to_string(),
        other => other.to_string(),
    }
}
