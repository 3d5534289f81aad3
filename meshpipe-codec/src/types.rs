//! Codec enumerations and format constants

/// File signature at the start of every encoded buffer
pub const MAGIC: [u8; 4] = *b"MPGC";

/// Current bitstream version
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound for components per attribute
pub const MAX_COMPONENTS: u8 = 16;

/// Encoded geometry kind
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryType {
    PointCloud = 0,
    TriangularMesh = 1,
    Invalid = 0xFF,
}

impl GeometryType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => GeometryType::PointCloud,
            1 => GeometryType::TriangularMesh,
            _ => GeometryType::Invalid,
        }
    }
}

/// Attribute semantic (the codec's type enumeration)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantic {
    Position = 0,
    Normal = 1,
    Color = 2,
    TexCoord = 3,
    Generic = 4,
}

impl Semantic {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Semantic::Position),
            1 => Some(Semantic::Normal),
            2 => Some(Semantic::Color),
            3 => Some(Semantic::TexCoord),
            4 => Some(Semantic::Generic),
            _ => None,
        }
    }

    /// Look up a semantic by its enumeration name (`"POSITION"`, `"TEX_COORD"`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "POSITION" => Some(Semantic::Position),
            "NORMAL" => Some(Semantic::Normal),
            "COLOR" => Some(Semantic::Color),
            "TEX_COORD" => Some(Semantic::TexCoord),
            "GENERIC" => Some(Semantic::Generic),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Semantic::Position => "POSITION",
            Semantic::Normal => "NORMAL",
            Semantic::Color => "COLOR",
            Semantic::TexCoord => "TEX_COORD",
            Semantic::Generic => "GENERIC",
        }
    }
}

/// Storage type of attribute values inside the bitstream
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int8 = 0,
    Uint8 = 1,
    Int16 = 2,
    Uint16 = 3,
    Int32 = 4,
    Uint32 = 5,
    Float32 = 6,
}

impl DataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataType::Int8),
            1 => Some(DataType::Uint8),
            2 => Some(DataType::Int16),
            3 => Some(DataType::Uint16),
            4 => Some(DataType::Int32),
            5 => Some(DataType::Uint32),
            6 => Some(DataType::Float32),
            _ => None,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        self == DataType::Float32
    }

    /// Inclusive value range for integer types
    pub fn integer_range(self) -> (i64, i64) {
        match self {
            DataType::Int8 => (i8::MIN as i64, i8::MAX as i64),
            DataType::Uint8 => (0, u8::MAX as i64),
            DataType::Int16 => (i16::MIN as i64, i16::MAX as i64),
            DataType::Uint16 => (0, u16::MAX as i64),
            DataType::Int32 => (i32::MIN as i64, i32::MAX as i64),
            DataType::Uint32 => (0, u32::MAX as i64),
            DataType::Float32 => (i64::MIN, i64::MAX),
        }
    }
}

/// Per-attribute value encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeEncoding {
    Raw = 0,      // Little-endian values of the attribute data type
    Delta = 1,    // Zigzag varint deltas per component (integer types)
    Quantized = 2, // Quantized float, zigzag varint deltas per component
}

impl AttributeEncoding {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AttributeEncoding::Raw),
            1 => Some(AttributeEncoding::Delta),
            2 => Some(AttributeEncoding::Quantized),
            _ => None,
        }
    }
}
