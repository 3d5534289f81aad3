//! Meshpipe geometry codec
//!
//! Binding to the compressed geometry format consumed by the decode task.
//!
//! Key properties:
//! - Mesh and point-cloud payloads with quantized or delta-coded attributes
//! - Native objects (decoders, buffers, geometry, extraction arrays) are tracked
//!   by the owning [`CodecModule`] and must be released explicitly or on drop
//! - Accelerated flavor dequantizes attributes in parallel with rayon

pub mod bitstream;
pub mod encoder;
pub mod error;
pub mod module;
pub mod native;
pub mod types;

pub use encoder::*;
pub use error::*;
pub use module::*;
pub use native::*;
pub use types::*;
