use super::TaskStatus;
use thiserror::Error;

/// Errors returned synchronously by [`AssemblyTask`](super::AssemblyTask)
///
/// Failures reported by the backend never show up here; they move the task
/// to [`TaskStatus::Failed`] and are announced through the event bus.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid inference settings: {0}")]
    InvalidSettings(String),

    #[error("A run is already in flight (status {0})")]
    AlreadyRunning(TaskStatus),

    #[error("Step {step} is outside [-2, {last}]")]
    InvalidStep { step: i64, last: i64 },

    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("Export failed: {0}")]
    Export(#[from] serde_json::Error),
}
