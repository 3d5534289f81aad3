//! Messages exchanged between the manager and its execution contexts

use crate::task::{ErasedShared, ErasedTask, Payload};
use std::fmt;
use std::sync::Arc;

/// Identifier of a single `run` request, unique for the manager's lifetime
pub type RequestId = u64;

/// Manager -> execution context
pub(crate) enum WorkerMessage {
    /// Build the private scope for `task`; no reply
    Init {
        task: String,
        handler: Arc<dyn ErasedTask>,
        dependencies: ErasedShared,
    },
    /// Run `task` with `config`; answered by exactly one reply
    Run {
        task: String,
        id: RequestId,
        config: Payload,
    },
}

/// Execution context -> manager
pub(crate) enum WorkerReply {
    Complete { id: RequestId, result: Payload },
    Error { id: RequestId, error: String },
}

impl WorkerReply {
    pub(crate) fn id(&self) -> RequestId {
        match self {
            WorkerReply::Complete { id, .. } | WorkerReply::Error { id, .. } => *id,
        }
    }

    pub(crate) fn into_outcome(self) -> Result<Payload, String> {
        match self {
            WorkerReply::Complete { result, .. } => Ok(result),
            WorkerReply::Error { error, .. } => Err(error),
        }
    }
}

impl fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMessage::Init { task, .. } => f.debug_struct("Init").field("task", task).finish(),
            WorkerMessage::Run { task, id, .. } => f
                .debug_struct("Run")
                .field("task", task)
                .field("id", id)
                .finish(),
        }
    }
}

impl fmt::Debug for WorkerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerReply::Complete { id, .. } => f.debug_struct("Complete").field("id", id).finish(),
            WorkerReply::Error { id, error } => f
                .debug_struct("Error")
                .field("id", id)
                .field("error", error)
                .finish(),
        }
    }
}
