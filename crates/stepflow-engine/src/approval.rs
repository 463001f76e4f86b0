use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventBus;
use stepflow_core::types::{
    ApprovalDecision, ApprovalRecord, ApprovalRequest, ExecutionId, StepId, WorkflowEvent,
};

use crate::state::StepEvent;

type Key = (ExecutionId, StepId);

struct Pending {
    request: ApprovalRequest,
    resume: mpsc::UnboundedSender<StepEvent>,
    timer: JoinHandle<()>,
}

/// Tracks checkpoints awaiting a human decision and routes decisions back to
/// the execution that raised them.
///
/// `decide` may be called from any task. A checkpoint left undecided past the
/// configured timeout is rejected with a system comment.
pub struct ApprovalCoordinator {
    pending: Mutex<HashMap<Key, Pending>>,
    history: Mutex<Vec<ApprovalRecord>>,
    event_bus: Arc<EventBus>,
    timeout: Duration,
}

impl ApprovalCoordinator {
    pub fn new(event_bus: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            event_bus,
            timeout,
        }
    }

    /// Queue a checkpoint. The decision is delivered to `resume`.
    pub async fn request(
        self: &Arc<Self>,
        request: ApprovalRequest,
        resume: mpsc::UnboundedSender<StepEvent>,
    ) {
        let key = (request.execution_id.clone(), request.step_id.clone());

        info!(
            execution_id = %request.execution_id,
            step_id = %request.step_id,
            "Checkpoint awaiting approval"
        );
        self.event_bus.publish(WorkflowEvent::ApprovalRequested {
            request: request.clone(),
        });

        // held while the timer is armed so it cannot fire before the entry exists
        let mut pending = self.pending.lock().await;

        let coordinator = Arc::clone(self);
        let timer_key = key.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let comment = StepflowError::ApprovalTimeout {
                step: timer_key.1.to_string(),
                timeout_secs: timeout.as_secs(),
            }
            .to_string();
            coordinator
                .resolve(&timer_key, ApprovalDecision::Reject, comment, true)
                .await;
        });

        let previous = pending.insert(
            key,
            Pending {
                request,
                resume,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// Record a reviewer's decision on a waiting checkpoint.
    pub async fn decide(
        &self,
        execution_id: &ExecutionId,
        step_id: &StepId,
        decision: ApprovalDecision,
        comment: impl Into<String>,
    ) -> Result<()> {
        let key = (execution_id.clone(), step_id.clone());
        if self.resolve(&key, decision, comment.into(), false).await {
            Ok(())
        } else {
            Err(StepflowError::NotAwaitingApproval {
                execution: execution_id.to_string(),
                step: step_id.to_string(),
            })
        }
    }

    async fn resolve(
        &self,
        key: &Key,
        decision: ApprovalDecision,
        comment: String,
        timed_out: bool,
    ) -> bool {
        let Some(entry) = self.pending.lock().await.remove(key) else {
            return false;
        };
        // the timer resolving itself must not abort its own task
        if !timed_out {
            entry.timer.abort();
        } else {
            warn!(
                execution_id = %key.0,
                step_id = %key.1,
                "Checkpoint timed out without a decision"
            );
        }

        self.event_bus.publish(WorkflowEvent::ApprovalResolved {
            execution_id: key.0.clone(),
            step_id: key.1.clone(),
            decision,
            timed_out,
        });
        // Ignore send error (execution may have been cancelled)
        let _ = entry.resume.send(StepEvent::ApprovalDecided {
            step_id: key.1.clone(),
            decision,
            comment: comment.clone(),
            timed_out,
        });

        self.history.lock().await.push(ApprovalRecord {
            request: entry.request,
            decision,
            comment,
            timed_out,
            decided_at: Utc::now(),
        });
        true
    }

    /// Drop every pending checkpoint of an execution without deciding it.
    pub async fn forget_execution(&self, execution_id: &ExecutionId) {
        self.pending.lock().await.retain(|(exec, _), entry| {
            if exec == execution_id {
                entry.timer.abort();
                false
            } else {
                true
            }
        });
    }

    /// All checkpoints awaiting a decision, oldest first.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub async fn pending_for(&self, execution_id: &ExecutionId) -> Vec<ApprovalRequest> {
        self.pending_requests()
            .await
            .into_iter()
            .filter(|r| &r.execution_id == execution_id)
            .collect()
    }

    /// Resolved checkpoints in decision order.
    pub async fn history(&self) -> Vec<ApprovalRecord> {
        self.history.lock().await.clone()
    }
}
