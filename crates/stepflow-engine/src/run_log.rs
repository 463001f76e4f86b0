use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepflow_core::event::EventBus;
use stepflow_core::types::{ExecutionId, LogLevel, StepId, WorkflowEvent};

/// JSONL audit sink.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{audit_dir}/{execution_id}.jsonl`. Lines are flushed as they are written,
/// so a crash never loses an entry that was already reported.
pub struct AuditLogger {
    audit_dir: PathBuf,
}

/// One line of an audit file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuditLine {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl AuditLine {
    fn new(execution_id: &ExecutionId, event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.to_string(),
            event_type,
            step_id: None,
            level: None,
            message: None,
            detail: None,
        }
    }

    fn step(mut self, step_id: &StepId) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }
}

impl AuditLogger {
    pub fn new(audit_dir: PathBuf) -> Self {
        Self { audit_dir }
    }

    pub fn path_for(&self, execution_id: &ExecutionId) -> PathBuf {
        self.audit_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.audit_dir).await {
            error!(error = %e, "Failed to create audit directory");
            return;
        }
        info!(dir = %self.audit_dir.display(), "AuditLogger started");

        let mut rx = event_bus.subscribe();
        let mut writers: HashMap<ExecutionId, BufWriter<File>> = HashMap::new();

        loop {
            // drain buffered events before honouring cancellation
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let execution_id = event.execution_id().clone();
                            let finished = matches!(event, WorkflowEvent::ExecutionFinished { .. });
                            let line = to_line(&event);
                            if let Err(e) = self.write(&mut writers, &execution_id, &line).await {
                                error!(execution_id = %execution_id, error = %e, "Failed to write audit entry");
                            }
                            if finished {
                                if let Some(mut writer) = writers.remove(&execution_id) {
                                    writer.flush().await.ok();
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "AuditLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, AuditLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("AuditLogger cancelled");
                    break;
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
    }

    async fn write(
        &self,
        writers: &mut HashMap<ExecutionId, BufWriter<File>>,
        execution_id: &ExecutionId,
        line: &AuditLine,
    ) -> std::io::Result<()> {
        if !writers.contains_key(execution_id) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(execution_id))
                .await?;
            writers.insert(execution_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(execution_id) else {
            return Ok(());
        };

        let mut json = serde_json::to_string(line)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await
    }
}

fn to_line(event: &WorkflowEvent) -> AuditLine {
    match event {
        WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id,
            workflow_version,
        } => AuditLine {
            detail: Some(serde_json::json!({
                "workflowId": workflow_id,
                "workflowVersion": workflow_version,
            })),
            ..AuditLine::new(execution_id, "execution_started")
        },
        WorkflowEvent::StepStatusChanged {
            execution_id,
            step_id,
            status,
        } => AuditLine {
            message: Some(status.to_string()),
            ..AuditLine::new(execution_id, "step_status").step(step_id)
        },
        WorkflowEvent::LogAppended {
            execution_id,
            entry,
        } => AuditLine {
            timestamp: entry.timestamp.to_rfc3339(),
            step_id: entry.step_id.as_ref().map(ToString::to_string),
            level: Some(entry.level),
            message: Some(entry.message.clone()),
            detail: entry
                .error_kind
                .map(|kind| serde_json::json!({ "errorKind": kind })),
            ..AuditLine::new(execution_id, "log")
        },
        WorkflowEvent::ApprovalRequested { request } => AuditLine {
            detail: Some(serde_json::json!({
                "supervisors": request.supervisors,
                "output": request.output,
            })),
            ..AuditLine::new(&request.execution_id, "approval_requested").step(&request.step_id)
        },
        WorkflowEvent::ApprovalResolved {
            execution_id,
            step_id,
            decision,
            timed_out,
        } => AuditLine {
            detail: Some(serde_json::json!({
                "decision": decision,
                "timedOut": timed_out,
            })),
            ..AuditLine::new(execution_id, "approval_resolved").step(step_id)
        },
        WorkflowEvent::ExecutionStatusChanged {
            execution_id,
            status,
        } => AuditLine {
            message: Some(status.to_string()),
            ..AuditLine::new(execution_id, "execution_status")
        },
        WorkflowEvent::ExecutionFinished { trace } => AuditLine {
            message: Some(trace.status.to_string()),
            detail: serde_json::to_value(trace.as_ref()).ok(),
            ..AuditLine::new(&trace.execution_id, "execution_finished")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::execution::{ExecutionRecord, LogEntry};
    use stepflow_core::types::{ErrorKind, ExecutionStatus, NodeStatus, WorkflowId};

    #[tokio::test]
    async fn writes_one_file_per_execution() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("audit");
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let logger = AuditLogger::new(dir.clone());
        let path = logger.path_for(&ExecutionId::from("exec-1"));

        let handle = tokio::spawn(logger.run(bus.clone(), cancel.clone()));
        // let the logger subscribe
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let exec = ExecutionId::from("exec-1");
        let step = StepId::from("score");
        bus.publish(WorkflowEvent::StepStatusChanged {
            execution_id: exec.clone(),
            step_id: step.clone(),
            status: NodeStatus::Running,
        });
        bus.publish(WorkflowEvent::LogAppended {
            execution_id: exec.clone(),
            entry: LogEntry::error(Some(step.clone()), ErrorKind::AgentTimeout, "slow"),
        });
        let mut trace = ExecutionRecord::new(WorkflowId::from("wf"), 1, [&step]);
        trace.execution_id = exec.clone();
        trace.status = ExecutionStatus::Failed;
        bus.publish(WorkflowEvent::ExecutionFinished {
            trace: Box::new(trace),
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["eventType"], "step_status");
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[1]["stepId"], "score");
        assert_eq!(lines[1]["detail"]["errorKind"], "agent_timeout");
        assert_eq!(lines[2]["eventType"], "execution_finished");
        assert_eq!(lines[2]["detail"]["status"], "failed");
    }
}
