//! Codec module: native object factory and bitstream decoder
//!
//! Mirrors the shape of a native codec binding: callers allocate a [`Decoder`],
//! a [`DecoderBuffer`] and a [`Mesh`] or [`PointCloud`], decode into them,
//! pull attribute values out through typed [`CodecArray`]s and destroy every
//! object afterwards.

use crate::bitstream::ByteReader;
use crate::error::CodecError;
use crate::native::{Native, ObjectTracker};
use crate::types::*;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

/// Decoder implementation variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecFlavor {
    /// Parallel attribute extraction on the rayon pool
    #[default]
    Accelerated,
    /// Scalar extraction on the calling thread
    Portable,
}

/// Runtime options for instantiating a [`CodecModule`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecConfig {
    pub flavor: CodecFlavor,
    /// Install location of the decoder; checked for existence when set
    pub module_path: Option<PathBuf>,
}

/// An instantiated codec runtime
pub struct CodecModule {
    config: CodecConfig,
    tracker: Arc<ObjectTracker>,
}

impl CodecModule {
    /// Instantiate the codec runtime
    pub fn instantiate(config: CodecConfig) -> Result<Arc<Self>, CodecError> {
        if let Some(path) = &config.module_path {
            if !path.exists() {
                return Err(CodecError::ModuleNotFound(path.clone()));
            }
        }

        log::debug!("Codec module instantiated ({:?})", config.flavor);

        Ok(Arc::new(Self {
            config,
            tracker: ObjectTracker::new(),
        }))
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Number of native objects allocated and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.tracker.live()
    }

    /// Resolve a semantic through the codec's type enumeration
    pub fn semantic(&self, name: &str) -> Option<Semantic> {
        Semantic::from_name(name)
    }

    pub fn new_decoder(&self) -> Native<Decoder> {
        Native::new(
            &self.tracker,
            Decoder {
                flavor: self.config.flavor,
            },
        )
    }

    pub fn new_decoder_buffer(&self) -> Native<DecoderBuffer> {
        Native::new(&self.tracker, DecoderBuffer::default())
    }

    pub fn new_mesh(&self) -> Native<Mesh> {
        Native::new(&self.tracker, Mesh::default())
    }

    pub fn new_point_cloud(&self) -> Native<PointCloud> {
        Native::new(&self.tracker, PointCloud::default())
    }

    pub fn new_array<T: ArrayElement>(&self) -> Native<CodecArray<T>> {
        Native::new(&self.tracker, CodecArray { values: Vec::new() })
    }

    /// Release a native object
    pub fn destroy<T>(&self, object: Native<T>) {
        log::trace!("Destroying native object {}", object.handle());
        drop(object);
    }
}

/// Encoded bytes copied into codec memory
#[derive(Debug, Default)]
pub struct DecoderBuffer {
    data: Vec<u8>,
}

impl DecoderBuffer {
    pub fn init(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of a decode call
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    error: Option<String>,
}

impl Status {
    fn success() -> Self {
        Self { error: None }
    }

    fn failure(message: String) -> Self {
        Self {
            error: Some(message),
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_msg(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone)]
enum AttributeStorage {
    Float(Vec<f32>),
    Integer(Vec<i64>),
    Quantized {
        values: Vec<u32>,
        min: Vec<f32>,
        range: f32,
        bits: u8,
    },
}

/// Attribute owned by a decoded geometry
#[derive(Debug, Clone)]
pub struct PointAttribute {
    unique_id: u32,
    semantic: Semantic,
    data_type: DataType,
    num_components: u8,
    storage: AttributeStorage,
}

impl PointAttribute {
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    pub fn semantic(&self) -> Semantic {
        self.semantic
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn num_components(&self) -> usize {
        self.num_components as usize
    }

    fn value_at<T: ArrayElement>(&self, index: usize) -> Option<T> {
        match &self.storage {
            AttributeStorage::Float(values) => T::from_f32(*values.get(index)?),
            AttributeStorage::Integer(values) => T::from_i64(*values.get(index)?),
            AttributeStorage::Quantized {
                values,
                min,
                range,
                bits,
            } => {
                let max_quantized = ((1u32 << bits) - 1) as f32;
                let component = index % self.num_components as usize;
                let quantized = *values.get(index)? as f32;
                T::from_f32(min[component] + quantized * range / max_quantized)
            }
        }
    }
}

/// Decoded geometry body shared by meshes and point clouds
#[derive(Debug, Default)]
pub struct GeometryData {
    decoded: bool,
    num_points: usize,
    faces: Vec<[u32; 3]>,
    attributes: Vec<PointAttribute>,
}

pub trait Geometry {
    fn data(&self) -> &GeometryData;

    fn num_points(&self) -> usize {
        self.data().num_points
    }

    fn num_attributes(&self) -> usize {
        self.data().attributes.len()
    }

    /// True until a decode call has populated the geometry
    fn is_null(&self) -> bool {
        !self.data().decoded
    }
}

#[derive(Debug, Default)]
pub struct Mesh {
    data: GeometryData,
}

impl Mesh {
    pub fn num_faces(&self) -> usize {
        self.data.faces.len()
    }
}

impl Geometry for Mesh {
    fn data(&self) -> &GeometryData {
        &self.data
    }
}

#[derive(Debug, Default)]
pub struct PointCloud {
    data: GeometryData,
}

impl Geometry for PointCloud {
    fn data(&self) -> &GeometryData {
        &self.data
    }
}

impl<G: Geometry> Geometry for Native<G> {
    fn data(&self) -> &GeometryData {
        (**self).data()
    }
}

/// Element types that attribute values can be extracted into
pub trait ArrayElement: Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn from_f32(value: f32) -> Option<Self>;
    fn from_i64(value: i64) -> Option<Self>;
}

macro_rules! integer_element {
    ($ty:ty, $data_type:expr) => {
        impl ArrayElement for $ty {
            const DATA_TYPE: DataType = $data_type;

            fn from_f32(value: f32) -> Option<Self> {
                if value.is_finite() && value >= <$ty>::MIN as f32 && value <= <$ty>::MAX as f32 {
                    Some(value as $ty)
                } else {
                    None
                }
            }

            fn from_i64(value: i64) -> Option<Self> {
                <$ty>::try_from(value).ok()
            }
        }
    };
}

integer_element!(i8, DataType::Int8);
integer_element!(u8, DataType::Uint8);
integer_element!(i16, DataType::Int16);
integer_element!(u16, DataType::Uint16);
integer_element!(i32, DataType::Int32);
integer_element!(u32, DataType::Uint32);

impl ArrayElement for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn from_f32(value: f32) -> Option<Self> {
        Some(value)
    }

    fn from_i64(value: i64) -> Option<Self> {
        Some(value as f32)
    }
}

/// Typed extraction array living in codec memory
#[derive(Debug)]
pub struct CodecArray<T> {
    values: Vec<T>,
}

impl<T: ArrayElement> CodecArray<T> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<T> {
        self.values.get(index).copied()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }
}

/// Bitstream decoder
#[derive(Debug)]
pub struct Decoder {
    flavor: CodecFlavor,
}

impl Decoder {
    /// Peek at the header and report the encoded geometry kind
    pub fn encoded_geometry_type(&self, buffer: &DecoderBuffer) -> GeometryType {
        let mut reader = ByteReader::new(&buffer.data);
        read_header(&mut reader).unwrap_or(GeometryType::Invalid)
    }

    pub fn decode_buffer_to_mesh(&self, buffer: &DecoderBuffer, mesh: &mut Mesh) -> Status {
        decode_into(buffer, GeometryType::TriangularMesh, &mut mesh.data)
    }

    pub fn decode_buffer_to_point_cloud(
        &self,
        buffer: &DecoderBuffer,
        point_cloud: &mut PointCloud,
    ) -> Status {
        decode_into(buffer, GeometryType::PointCloud, &mut point_cloud.data)
    }

    /// Index of the first attribute with `semantic`, or -1
    pub fn attribute_id<G: Geometry + ?Sized>(&self, geometry: &G, semantic: Semantic) -> i32 {
        geometry
            .data()
            .attributes
            .iter()
            .position(|attribute| attribute.semantic == semantic)
            .map(|index| index as i32)
            .unwrap_or(-1)
    }

    pub fn attribute<'g, G: Geometry + ?Sized>(
        &self,
        geometry: &'g G,
        attribute_id: i32,
    ) -> Option<&'g PointAttribute> {
        let index = usize::try_from(attribute_id).ok()?;
        geometry.data().attributes.get(index)
    }

    pub fn attribute_by_unique_id<'g, G: Geometry + ?Sized>(
        &self,
        geometry: &'g G,
        unique_id: u32,
    ) -> Option<&'g PointAttribute> {
        geometry
            .data()
            .attributes
            .iter()
            .find(|attribute| attribute.unique_id == unique_id)
    }

    /// Convert every value of `attribute` into `out`
    ///
    /// Returns false when a value cannot be represented in `T`; `out` is left
    /// empty in that case.
    pub fn attribute_values_for_all_points<T: ArrayElement, G: Geometry + ?Sized>(
        &self,
        geometry: &G,
        attribute: &PointAttribute,
        out: &mut CodecArray<T>,
    ) -> bool {
        let count = geometry.num_points() * attribute.num_components();

        let values: Option<Vec<T>> = match self.flavor {
            CodecFlavor::Accelerated => (0..count)
                .into_par_iter()
                .map(|index| attribute.value_at(index))
                .collect(),
            CodecFlavor::Portable => (0..count).map(|index| attribute.value_at(index)).collect(),
        };

        match values {
            Some(values) => {
                out.values = values;
                true
            }
            None => {
                out.values.clear();
                false
            }
        }
    }

    /// Read the three corner indices of `face` into `out`
    pub fn face_from_mesh(&self, mesh: &Mesh, face: usize, out: &mut CodecArray<i32>) -> bool {
        let Some(corners) = mesh.data.faces.get(face) else {
            return false;
        };

        out.values.clear();
        for &corner in corners {
            match i32::try_from(corner) {
                Ok(index) => out.values.push(index),
                Err(_) => return false,
            }
        }
        true
    }
}

fn decode_into(buffer: &DecoderBuffer, expected: GeometryType, target: &mut GeometryData) -> Status {
    match parse_geometry(&buffer.data, expected) {
        Ok(data) => {
            *target = data;
            Status::success()
        }
        Err(e) => Status::failure(e.to_string()),
    }
}

fn read_header(reader: &mut ByteReader<'_>) -> Result<GeometryType, CodecError> {
    if reader.get_bytes(MAGIC.len())? != &MAGIC[..] {
        return Err(CodecError::InvalidHeader);
    }

    let version = reader.get_u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    match GeometryType::from_u8(reader.get_u8()?) {
        GeometryType::Invalid => Err(CodecError::UnexpectedGeometryType),
        kind => Ok(kind),
    }
}

fn parse_geometry(bytes: &[u8], expected: GeometryType) -> Result<GeometryData, CodecError> {
    let mut reader = ByteReader::new(bytes);

    let kind = read_header(&mut reader)?;
    if kind != expected {
        return Err(CodecError::UnexpectedGeometryType);
    }

    let num_points = reader.get_count()?;
    let num_faces = match kind {
        GeometryType::TriangularMesh => reader.get_count()?,
        _ => 0,
    };

    let num_attributes = reader.get_count()?;
    let mut attributes = Vec::with_capacity(num_attributes.min(32));
    for _ in 0..num_attributes {
        attributes.push(read_attribute(&mut reader, num_points)?);
    }

    let faces = read_faces(&mut reader, num_faces, num_points)?;

    if reader.remaining() > 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }

    Ok(GeometryData {
        decoded: true,
        num_points,
        faces,
        attributes,
    })
}

fn read_attribute(reader: &mut ByteReader<'_>, num_points: usize) -> Result<PointAttribute, CodecError> {
    let unique_id = u32::try_from(reader.get_varint()?).map_err(|_| CodecError::VarintOverflow)?;

    let raw = reader.get_u8()?;
    let semantic = Semantic::from_u8(raw).ok_or(CodecError::InvalidSemantic(raw))?;

    let raw = reader.get_u8()?;
    let data_type = DataType::from_u8(raw).ok_or(CodecError::InvalidDataType(raw))?;

    let num_components = reader.get_u8()?;
    if num_components == 0 || num_components > MAX_COMPONENTS {
        return Err(CodecError::InvalidComponentCount(num_components));
    }

    let raw = reader.get_u8()?;
    let encoding = AttributeEncoding::from_u8(raw).ok_or(CodecError::InvalidEncoding(raw))?;

    let count = num_points
        .checked_mul(num_components as usize)
        .ok_or(CodecError::Truncated)?;

    // Every encoded value occupies at least one byte
    if count > reader.remaining() {
        return Err(CodecError::Truncated);
    }

    let storage = match encoding {
        AttributeEncoding::Raw if data_type.is_float() => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(reader.get_f32()?);
            }
            AttributeStorage::Float(values)
        }
        AttributeEncoding::Raw => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_raw_integer(reader, data_type)?);
            }
            AttributeStorage::Integer(values)
        }
        AttributeEncoding::Delta if !data_type.is_float() => {
            read_integer_deltas(reader, data_type, num_components as usize, count)?
        }
        AttributeEncoding::Quantized if data_type.is_float() => {
            read_quantized(reader, num_components as usize, count)?
        }
        _ => return Err(CodecError::InvalidEncoding(raw)),
    };

    Ok(PointAttribute {
        unique_id,
        semantic,
        data_type,
        num_components,
        storage,
    })
}

fn read_raw_integer(reader: &mut ByteReader<'_>, data_type: DataType) -> Result<i64, CodecError> {
    let bytes = reader.get_bytes(data_type.byte_size())?;

    let value = match data_type {
        DataType::Int8 => bytes[0] as i8 as i64,
        DataType::Uint8 => bytes[0] as i64,
        DataType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        DataType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
        DataType::Int32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        DataType::Uint32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        DataType::Float32 => return Err(CodecError::InvalidDataType(data_type as u8)),
    };

    Ok(value)
}

fn read_integer_deltas(
    reader: &mut ByteReader<'_>,
    data_type: DataType,
    num_components: usize,
    count: usize,
) -> Result<AttributeStorage, CodecError> {
    let (low, high) = data_type.integer_range();
    let mut previous = vec![0i64; num_components];
    let mut values = Vec::with_capacity(count);

    for index in 0..count {
        let component = index % num_components;
        let value = previous[component]
            .checked_add(reader.get_zigzag()?)
            .ok_or(CodecError::VarintOverflow)?;

        if value < low || value > high {
            return Err(CodecError::InconsistentAttribute(format!(
                "value {} out of range for {:?}",
                value, data_type
            )));
        }

        previous[component] = value;
        values.push(value);
    }

    Ok(AttributeStorage::Integer(values))
}

fn read_quantized(
    reader: &mut ByteReader<'_>,
    num_components: usize,
    count: usize,
) -> Result<AttributeStorage, CodecError> {
    let bits = reader.get_u8()?;
    if bits == 0 || bits > 30 {
        return Err(CodecError::InvalidQuantization(bits));
    }
    let max_quantized = (1i64 << bits) - 1;

    let mut min = Vec::with_capacity(num_components);
    for _ in 0..num_components {
        min.push(reader.get_f32()?);
    }
    let range = reader.get_f32()?;

    let mut previous = vec![0i64; num_components];
    let mut values = Vec::with_capacity(count);

    for index in 0..count {
        let component = index % num_components;
        let value = previous[component]
            .checked_add(reader.get_zigzag()?)
            .ok_or(CodecError::VarintOverflow)?;

        if value < 0 || value > max_quantized {
            return Err(CodecError::InconsistentAttribute(format!(
                "quantized value {} exceeds {} bits",
                value, bits
            )));
        }

        previous[component] = value;
        values.push(value as u32);
    }

    Ok(AttributeStorage::Quantized {
        values,
        min,
        range,
        bits,
    })
}

fn read_faces(
    reader: &mut ByteReader<'_>,
    num_faces: usize,
    num_points: usize,
) -> Result<Vec<[u32; 3]>, CodecError> {
    let corners = num_faces.checked_mul(3).ok_or(CodecError::Truncated)?;
    if corners > reader.remaining() {
        return Err(CodecError::Truncated);
    }

    let mut faces = Vec::with_capacity(num_faces);
    let mut previous = 0i64;

    for _ in 0..num_faces {
        let mut face = [0u32; 3];
        for corner in face.iter_mut() {
            previous = previous
                .checked_add(reader.get_zigzag()?)
                .ok_or(CodecError::VarintOverflow)?;

            if previous < 0 || previous as u64 >= num_points as u64 {
                return Err(CodecError::FaceIndexOutOfRange {
                    index: previous.max(0) as u64,
                    num_points,
                });
            }
            *corner = previous as u32;
        }
        faces.push(face);
    }

    Ok(faces)
}
