use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid header")]
    InvalidHeader,

    #[error("Unsupported bitstream version {0}")]
    UnsupportedVersion(u8),

    #[error("Unexpected geometry type")]
    UnexpectedGeometryType,

    #[error("Buffer truncated")]
    Truncated,

    #[error("Varint overflow")]
    VarintOverflow,

    #[error("Invalid attribute semantic {0}")]
    InvalidSemantic(u8),

    #[error("Invalid attribute data type {0}")]
    InvalidDataType(u8),

    #[error("Invalid attribute encoding {0}")]
    InvalidEncoding(u8),

    #[error("Invalid component count {0}")]
    InvalidComponentCount(u8),

    #[error("Invalid quantization bits {0}")]
    InvalidQuantization(u8),

    #[error("Face index {index} out of range for {num_points} points")]
    FaceIndexOutOfRange { index: u64, num_points: usize },

    #[error("{0} trailing bytes after geometry")]
    TrailingBytes(usize),

    #[error("Inconsistent attribute: {0}")]
    InconsistentAttribute(String),

    #[error("Decoder module not found at {0}")]
    ModuleNotFound(PathBuf),
}
