use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepflowError {
    // Structural errors
    #[error("Workflow failed validation: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Cycle detected in workflow graph at step {step}")]
    Cycle { step: String },

    // Runtime errors
    #[error("Agent invocation failed: {agent}: {message}")]
    AgentInvocation { agent: String, message: String },

    #[error("Agent timeout after {timeout_secs}s: {agent}")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    #[error("Loop bound of {bound} iterations exceeded at step {step}")]
    LoopBoundExceeded { step: String, bound: u32 },

    #[error("No decision on step {step} within {timeout_secs}s; rejected automatically")]
    ApprovalTimeout { step: String, timeout_secs: u64 },

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Step {step} of execution {execution} is not awaiting approval")]
    NotAwaitingApproval { execution: String, step: String },

    #[error("Execution record {0} is terminal and can no longer be modified")]
    RecordSealed(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepflowError>;
