use meshpipe_codec::CodecError;
use meshpipe_tasks::TaskError;
use std::path::PathBuf;

/// Failures raised while decoding inside the decode task
///
/// These cross the execution context boundary as the reply's error message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unexpected geometry type")]
    UnexpectedGeometryType,

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Unexpected attribute type: {0}")]
    UnexpectedAttributeType(String),

    #[error("Attribute \"{name}\" not found for unique id {unique_id}")]
    MissingUniqueId { name: String, unique_id: u32 },

    #[error("Attribute \"{0}\" must be addressed by unique id")]
    ExpectedUniqueId(String),

    #[error("Attribute \"{name}\" cannot be represented as {attribute_type}")]
    Unrepresentable { name: String, attribute_type: &'static str },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<DecodeError> for TaskError {
    fn from(e: DecodeError) -> Self {
        TaskError::failed(e)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoaderError {
    #[error("Unable to re-decode a buffer with different settings, buffer has already been transferred")]
    BufferConflict,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Invalid task configuration: {0}")]
    Config(String),
}
