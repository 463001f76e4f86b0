use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use stepflow_core::error::StepflowError;
use stepflow_core::event::EventBus;
use stepflow_core::execution::ExecutionRecord;
use stepflow_core::traits::{AgentDirectory, AgentInput, WorkflowStore};
use stepflow_core::types::{ErrorKind, ExecutionId, ExecutionStatus, NodeStatus, StepId, WorkflowEvent};

use crate::approval::ApprovalCoordinator;
use crate::state::{Effect, ExecutionState, StepEvent};

/// Senders of executions that are still live, keyed by id.
pub(crate) type LiveExecutions = Arc<Mutex<HashMap<ExecutionId, mpsc::UnboundedSender<StepEvent>>>>;

/// Collaborators shared by every execution.
#[derive(Clone)]
pub struct ExecutorContext {
    pub directory: Arc<dyn AgentDirectory>,
    pub store: Arc<dyn WorkflowStore>,
    pub event_bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalCoordinator>,
}

/// Handle to a running execution.
///
/// The record is published after every transition, so callers can observe
/// progress without touching the store.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    events: mpsc::UnboundedSender<StepEvent>,
    record: watch::Receiver<ExecutionRecord>,
}

impl ExecutionHandle {
    pub fn id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// The latest published record.
    pub fn current(&self) -> ExecutionRecord {
        self.record.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionRecord> {
        self.record.clone()
    }

    /// Wait until the execution is terminal, or suspended with nothing
    /// else in flight.
    pub async fn settled(&mut self) -> ExecutionRecord {
        self.wait_until(|r| {
            r.is_terminal()
                || (r.status == ExecutionStatus::Suspended
                    && !r.node_statuses.values().any(|s| *s == NodeStatus::Running))
        })
        .await
    }

    /// Wait until the execution is terminal.
    pub async fn finished(&mut self) -> ExecutionRecord {
        self.wait_until(ExecutionRecord::is_terminal).await
    }

    async fn wait_until(&mut self, done: impl FnMut(&ExecutionRecord) -> bool) -> ExecutionRecord {
        let reached = self.record.wait_for(done).await.map(|r| (*r).clone());
        match reached {
            Ok(record) => record,
            // driver gone; the last value is final
            Err(_) => self.record.borrow().clone(),
        }
    }

    /// Wait for the next published record, or return the last one if the
    /// execution is over.
    pub async fn changed(&mut self) -> ExecutionRecord {
        let _ = self.record.changed().await;
        self.record.borrow_and_update().clone()
    }

    /// Request cancellation. A no-op once the execution has finished.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.events.send(StepEvent::Cancel {
            reason: reason.into(),
        });
    }
}

/// Register and spawn the driver task for a prepared execution.
pub(crate) async fn spawn_execution(
    state: ExecutionState,
    ctx: ExecutorContext,
    step_timeout: Duration,
    live: LiveExecutions,
) -> ExecutionHandle {
    let execution_id = state.execution_id().clone();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (record_tx, record_rx) = watch::channel(state.record().clone());

    let driver = Driver {
        state,
        ctx,
        step_timeout,
        events_tx: events_tx.clone(),
        record_tx,
        tasks: JoinSet::new(),
        persisted_log: 0,
        last_status: ExecutionStatus::Running,
    };

    live.lock().await.insert(execution_id.clone(), events_tx.clone());
    tokio::spawn(async move {
        let execution_id = driver.run(events_rx).await;
        live.lock().await.remove(&execution_id);
    });

    ExecutionHandle {
        execution_id,
        events: events_tx,
        record: record_rx,
    }
}

/// Single writer for one execution record. Owns the state machine, runs the
/// effects it asks for and persists and publishes every change.
struct Driver {
    state: ExecutionState,
    ctx: ExecutorContext,
    step_timeout: Duration,
    events_tx: mpsc::UnboundedSender<StepEvent>,
    record_tx: watch::Sender<ExecutionRecord>,
    tasks: JoinSet<()>,
    persisted_log: usize,
    last_status: ExecutionStatus,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<StepEvent>) -> ExecutionId {
        let execution_id = self.state.execution_id().clone();
        let snapshot = Arc::clone(self.state.snapshot());
        info!(
            execution_id = %execution_id,
            workflow = %snapshot.id(),
            "Execution started"
        );
        self.ctx.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            workflow_id: snapshot.graph.id.clone(),
            workflow_version: snapshot.version,
        });

        let effects = self.state.start();
        self.step(effects).await;

        let mut cancelled = false;
        while !self.state.is_finished() {
            let Some(event) = events.recv().await else {
                break;
            };
            cancelled |= matches!(event, StepEvent::Cancel { .. });
            let effects = self.state.apply(event);
            self.step(effects).await;
        }

        if cancelled {
            self.ctx.directory.cancel(&execution_id).await;
        }
        self.ctx.approvals.forget_execution(&execution_id).await;
        self.tasks.abort_all();

        let record = self.state.record().clone();
        info!(
            execution_id = %execution_id,
            status = %record.status,
            "Execution finished"
        );
        self.ctx.event_bus.publish(WorkflowEvent::ExecutionFinished {
            trace: Box::new(record),
        });
        execution_id
    }

    /// Carry out one transition. Checkpoints are registered before the
    /// record is published, so anyone who sees `suspended` can decide.
    async fn step(&mut self, effects: Vec<Effect>) {
        let mut invocations = Vec::new();
        for effect in effects {
            match effect {
                Effect::RequestApproval(request) => {
                    self.ctx
                        .approvals
                        .request(request, self.events_tx.clone())
                        .await;
                }
                Effect::Invoke { agent_ref, input } => invocations.push((agent_ref, input)),
            }
        }
        self.commit();
        for (agent_ref, input) in invocations {
            self.invoke(agent_ref, input);
        }
    }

    fn invoke(&mut self, agent_ref: String, input: AgentInput) {
        let directory = Arc::clone(&self.ctx.directory);
        let events = self.events_tx.clone();
        let timeout = self.step_timeout;
        debug!(step_id = %input.step_id, agent = %agent_ref, "Invoking agent");

        self.tasks.spawn(async move {
            let step_id = input.step_id.clone();
            let started = Instant::now();
            let event = match tokio::time::timeout(timeout, directory.invoke(&agent_ref, input)).await {
                Ok(Ok(mut response)) => {
                    if response.elapsed_ms == 0 {
                        response.elapsed_ms = started.elapsed().as_millis() as u64;
                    }
                    StepEvent::AgentCompleted { step_id, response }
                }
                Ok(Err(e)) => StepEvent::AgentFailed {
                    step_id,
                    kind: ErrorKind::AgentInvocation,
                    message: e.to_string(),
                },
                Err(_) => StepEvent::AgentFailed {
                    step_id,
                    kind: ErrorKind::AgentTimeout,
                    message: StepflowError::AgentTimeout {
                        agent: agent_ref,
                        timeout_secs: timeout.as_secs(),
                    }
                    .to_string(),
                },
            };
            // Ignore send error (execution already finished)
            let _ = events.send(event);
        });
    }

    /// Persist and publish what the last transition changed.
    fn commit(&mut self) {
        let execution_id = self.state.execution_id().clone();

        for (step_id, status) in self.state.drain_transitions() {
            self.publish_step(&execution_id, step_id, status);
        }

        let record = self.state.record();
        let new_entries = &record.log[self.persisted_log.min(record.log.len())..];
        if self.persisted_log > 0 {
            for entry in new_entries {
                if let Err(e) = self.ctx.store.append_log(&execution_id, entry) {
                    error!(execution_id = %execution_id, error = %e, "Failed to append execution log");
                }
            }
        }
        if let Err(e) = self.ctx.store.record_execution(record) {
            error!(execution_id = %execution_id, error = %e, "Failed to persist execution record");
        }
        for entry in new_entries {
            self.ctx.event_bus.publish(WorkflowEvent::LogAppended {
                execution_id: execution_id.clone(),
                entry: entry.clone(),
            });
        }
        self.persisted_log = record.log.len();

        if record.status != self.last_status {
            self.last_status = record.status;
            self.ctx.event_bus.publish(WorkflowEvent::ExecutionStatusChanged {
                execution_id: execution_id.clone(),
                status: record.status,
            });
        }

        self.record_tx.send_replace(record.clone());
    }

    fn publish_step(&self, execution_id: &ExecutionId, step_id: StepId, status: NodeStatus) {
        debug!(execution_id = %execution_id, step_id = %step_id, %status, "Step status changed");
        self.ctx.event_bus.publish(WorkflowEvent::StepStatusChanged {
            execution_id: execution_id.clone(),
            step_id,
            status,
        });
    }
}
