use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ExecutionTrace, LogEntry};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                match $prefix {
                    "" => Self(Uuid::new_v4().to_string()),
                    prefix => Self(format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..12])),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a workflow across all of its versions.
    WorkflowId,
    ""
);
string_id!(
    /// Identifier of a step, unique within its workflow.
    StepId,
    "step"
);
string_id!(
    /// Identifier of a connection, unique within its workflow.
    ConnectionId,
    "conn"
);
string_id!(
    /// Identifier of one run of a workflow snapshot.
    ExecutionId,
    ""
);

/// How much human oversight a step receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitlMode {
    #[default]
    FullyAi,
    Hitl,
    Standby,
    InCharge,
    Hybrid,
}

impl HitlMode {
    /// Whether a human is involved at all.
    pub fn is_supervised(&self) -> bool {
        !matches!(self, Self::FullyAi)
    }
}

impl fmt::Display for HitlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullyAi => "fully-ai",
            Self::Hitl => "hitl",
            Self::Standby => "standby",
            Self::InCharge => "in-charge",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Per-step status inside an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting-approval",
        };
        f.write_str(s)
    }
}

/// Overall status of an execution record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Running,
    Success,
    Failed,
    Suspended,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Machine-readable failure tag recorded next to error log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AgentInvocation,
    AgentTimeout,
    LoopBoundExceeded,
    ApprovalRejected,
    ApprovalTimeout,
    Cancelled,
}

/// A human decision on a HITL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl std::str::FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Ok(Self::Approve),
            "reject" | "rejected" | "no" | "n" => Ok(Self::Reject),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// A checkpoint waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub agent_ref: String,
    pub role: String,
    pub supervisors: BTreeSet<String>,
    /// The agent output the reviewer is asked to accept.
    pub output: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

/// A resolved checkpoint, kept for the approval history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub request: ApprovalRequest,
    pub decision: ApprovalDecision,
    pub comment: String,
    pub timed_out: bool,
    pub decided_at: DateTime<Utc>,
}

/// Events published on the bus for audit and notification consumers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// An execution started against a snapshot.
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        workflow_version: u32,
    },
    /// A step changed status.
    StepStatusChanged {
        execution_id: ExecutionId,
        step_id: StepId,
        status: NodeStatus,
    },
    /// A log entry was appended to an execution.
    LogAppended {
        execution_id: ExecutionId,
        entry: LogEntry,
    },
    /// A checkpoint is waiting for a decision.
    ApprovalRequested { request: ApprovalRequest },
    /// A checkpoint was decided (by a human or by timeout).
    ApprovalResolved {
        execution_id: ExecutionId,
        step_id: StepId,
        decision: ApprovalDecision,
        timed_out: bool,
    },
    /// The record status changed.
    ExecutionStatusChanged {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// The execution reached a terminal status.
    ExecutionFinished { trace: Box<ExecutionTrace> },
}

impl WorkflowEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStatusChanged { execution_id, .. }
            | Self::LogAppended { execution_id, .. }
            | Self::ApprovalResolved { execution_id, .. }
            | Self::ExecutionStatusChanged { execution_id, .. } => execution_id,
            Self::ApprovalRequested { request } => &request.execution_id,
            Self::ExecutionFinished { trace } => &trace.execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(StepId::new().as_str().starts_with("step-"));
        assert!(ConnectionId::new().as_str().starts_with("conn-"));
        assert_ne!(StepId::new(), StepId::new());
    }

    #[test]
    fn statuses_serialize_kebab_case() {
        let json = serde_json::to_string(&NodeStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting-approval\"");
        let json = serde_json::to_string(&HitlMode::InCharge).unwrap();
        assert_eq!(json, "\"in-charge\"");
        let mode: HitlMode = serde_json::from_str("\"fully-ai\"").unwrap();
        assert_eq!(mode, HitlMode::FullyAi);
    }

    #[test]
    fn terminal_states() {
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::AwaitingApproval.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Suspended.is_terminal());
    }

    #[test]
    fn decision_parsing() {
        assert_eq!("approve".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Approve);
        assert_eq!("N".parse::<ApprovalDecision>().unwrap(), ApprovalDecision::Reject);
        assert!("maybe".parse::<ApprovalDecision>().is_err());
    }

    #[test]
    fn log_level_display_matches_wire_name() {
        for level in [LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(
                serde_json::to_value(level).unwrap(),
                serde_json::Value::String(level.to_string())
            );
        }
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
