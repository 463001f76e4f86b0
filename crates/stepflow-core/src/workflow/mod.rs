pub mod connection;
pub mod graph;
pub mod metadata;
pub mod order;
pub mod schedule;
pub mod snapshot;
pub mod step;
pub mod validation;

pub use connection::Connection;
pub use graph::WorkflowGraph;
pub use metadata::{MetadataPatch, WorkflowMetadata};
pub use order::{find_cycle, loop_body, reaches, topological_order};
pub use schedule::{Frequency, Schedule};
pub use snapshot::{SnapshotId, VersionInfo, WorkflowSnapshot, WorkflowStats, WorkflowSummary};
pub use step::{Step, StepPatch, StepSpec};
pub use validation::{validate, validate_with_directory, ValidationReport};
