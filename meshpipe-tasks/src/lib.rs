//! Meshpipe task manager
//!
//! Runs registered tasks on a bounded pool of execution contexts.
//!
//! Key properties:
//! - Contexts are created lazily up to the worker limit, then requests go to
//!   the context with the lowest outstanding cost
//! - Each context keeps a private scope per task type, built once by `init`
//! - Requests and replies cross the context boundary as messages; config and
//!   result buffers move by ownership, never by copy
//! - A worker limit of zero runs one inline context on the caller's executor

mod context;
pub mod error;
pub mod manager;
pub mod message;
pub mod task;

pub use error::*;
pub use manager::*;
pub use message::RequestId;
pub use task::*;
