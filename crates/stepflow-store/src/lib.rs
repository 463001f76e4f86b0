mod sqlite;

pub use sqlite::SqliteWorkflowStore;
