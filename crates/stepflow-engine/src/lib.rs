pub mod approval;
pub mod directory;
pub mod executor;
pub mod run_log;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use approval::ApprovalCoordinator;
pub use directory::HttpAgentDirectory;
pub use executor::{ExecutionHandle, ExecutorContext};
pub use run_log::AuditLogger;
pub use runtime::WorkflowEngine;
pub use scheduler::WorkflowScheduler;
pub use state::{EdgeState, Effect, ExecutionState, StepEvent};
