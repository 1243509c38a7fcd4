//! Error taxonomy shared by every Notiflow crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotiflowError {
    /// Missing or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Task store read/write failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Task configuration rejected before dispatch (email syntax, missing fields).
    #[error("{0}")]
    Validation(String),

    /// Template could not be parsed or rendered.
    #[error("Error in template: {0}")]
    Template(String),

    /// Rule condition matched the injection denylist.
    #[error("Unsafe condition detected: {0}")]
    UnsafeCondition(String),

    /// An execution record already exists for this task and minute.
    #[error("Task {task_id} already has an execution record for minute {minute}")]
    DuplicateExecution { task_id: String, minute: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NotiflowError>;
