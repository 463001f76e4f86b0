pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{Result, StepflowError};
pub use event::EventBus;
pub use execution::{ExecutionRecord, ExecutionTrace, LogEntry};
pub use types::*;
pub use workflow::*;
