//! Meshpipe geometry loader
//!
//! Decodes compressed geometry on a [`meshpipe_tasks::TaskManager`] and builds
//! renderer-facing [`BufferGeometry`] from the result.
//!
//! Key properties:
//! - Each input buffer is decoded at most once; identical requests share the
//!   pending result
//! - Buffer bytes move into the execution context, so a buffer cannot be
//!   decoded again with different settings while it still holds data
//! - Cache entries live only as long as their buffer

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod geometry;
pub mod loader;
pub mod task;

pub use buffer::EncodedBuffer;
pub use cache::{DecodeCache, GeometryFuture};
pub use config::*;
pub use error::*;
pub use geometry::*;
pub use loader::GeometryLoader;
pub use task::{DecodeRequest, DecodeScope, DecodeTask, DECODE_TASK};
