#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task type \"{0}\" is not registered")]
    UnknownTaskType(String),

    #[error("Task type \"{task}\" is not initialized in execution context {context}")]
    NotInitialized { task: String, context: usize },

    #[error("Payload type mismatch for task type \"{0}\"")]
    PayloadMismatch(String),

    #[error("{0}")]
    Failed(String),

    #[error("Execution context terminated")]
    Terminated,

    #[error("Failed to spawn execution context: {0}")]
    Spawn(String),
}

impl TaskError {
    /// Task-level failure carrying a message back to the caller
    pub fn failed(message: impl std::fmt::Display) -> Self {
        TaskError::Failed(message.to_string())
    }
}
