//! Geometry encoder
//!
//! Produces buffers the decoder understands. Float attributes are stored raw
//! unless quantization is enabled for their semantic; integer attributes are
//! always delta coded.

use crate::bitstream::ByteWriter;
use crate::error::CodecError;
use crate::types::*;
use std::collections::HashMap;

/// Attribute values before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValues {
    Float(Vec<f32>),
    Integer { data_type: DataType, values: Vec<i64> },
}

impl SourceValues {
    fn len(&self) -> usize {
        match self {
            SourceValues::Float(values) => values.len(),
            SourceValues::Integer { values, .. } => values.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttribute {
    pub unique_id: u32,
    pub semantic: Semantic,
    pub num_components: u8,
    pub values: SourceValues,
}

/// Geometry to be encoded
#[derive(Debug, Clone, PartialEq)]
pub struct GeometrySource {
    kind: GeometryType,
    faces: Vec<[u32; 3]>,
    attributes: Vec<SourceAttribute>,
}

impl GeometrySource {
    pub fn mesh(faces: Vec<[u32; 3]>) -> Self {
        Self {
            kind: GeometryType::TriangularMesh,
            faces,
            attributes: Vec::new(),
        }
    }

    pub fn point_cloud() -> Self {
        Self {
            kind: GeometryType::PointCloud,
            faces: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Add a float attribute; its unique id defaults to its position
    pub fn with_float_attribute(mut self, semantic: Semantic, num_components: u8, values: Vec<f32>) -> Self {
        let unique_id = self.attributes.len() as u32;
        self.attributes.push(SourceAttribute {
            unique_id,
            semantic,
            num_components,
            values: SourceValues::Float(values),
        });
        self
    }

    pub fn with_integer_attribute(
        mut self,
        semantic: Semantic,
        data_type: DataType,
        num_components: u8,
        values: Vec<i64>,
    ) -> Self {
        let unique_id = self.attributes.len() as u32;
        self.attributes.push(SourceAttribute {
            unique_id,
            semantic,
            num_components,
            values: SourceValues::Integer { data_type, values },
        });
        self
    }

    /// Override the unique id of the most recently added attribute
    pub fn with_unique_id(mut self, unique_id: u32) -> Self {
        if let Some(attribute) = self.attributes.last_mut() {
            attribute.unique_id = unique_id;
        }
        self
    }

    pub fn kind(&self) -> GeometryType {
        self.kind
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn attributes(&self) -> &[SourceAttribute] {
        &self.attributes
    }

    /// Point count implied by the first attribute
    pub fn num_points(&self) -> usize {
        self.attributes
            .first()
            .map(|attribute| attribute.values.len() / attribute.num_components.max(1) as usize)
            .unwrap_or(0)
    }
}

/// Bitstream encoder
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    quantization: HashMap<Semantic, u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantize float attributes of `semantic` to `bits` bits (1..=30)
    pub fn with_quantization(mut self, semantic: Semantic, bits: u8) -> Self {
        self.quantization.insert(semantic, bits);
        self
    }

    pub fn encode(&self, source: &GeometrySource) -> Result<Vec<u8>, CodecError> {
        if source.kind == GeometryType::Invalid {
            return Err(CodecError::UnexpectedGeometryType);
        }

        let num_points = source.num_points();
        let mut writer = ByteWriter::new();

        writer.put_bytes(&MAGIC);
        writer.put_u8(FORMAT_VERSION);
        writer.put_u8(source.kind as u8);
        writer.put_varint(num_points as u64);
        if source.kind == GeometryType::TriangularMesh {
            writer.put_varint(source.faces.len() as u64);
        }

        writer.put_varint(source.attributes.len() as u64);
        for attribute in &source.attributes {
            self.write_attribute(&mut writer, attribute, num_points)?;
        }

        if source.kind == GeometryType::TriangularMesh {
            write_faces(&mut writer, &source.faces, num_points)?;
        }

        log::trace!("Encoded {} points into {} bytes", num_points, writer.len());

        Ok(writer.into_bytes())
    }

    fn write_attribute(
        &self,
        writer: &mut ByteWriter,
        attribute: &SourceAttribute,
        num_points: usize,
    ) -> Result<(), CodecError> {
        let components = attribute.num_components;
        if components == 0 || components > MAX_COMPONENTS {
            return Err(CodecError::InvalidComponentCount(components));
        }

        if attribute.values.len() != num_points * components as usize {
            return Err(CodecError::InconsistentAttribute(format!(
                "attribute {} has {} values, expected {}",
                attribute.unique_id,
                attribute.values.len(),
                num_points * components as usize
            )));
        }

        writer.put_varint(attribute.unique_id as u64);
        writer.put_u8(attribute.semantic as u8);

        match &attribute.values {
            SourceValues::Float(values) => {
                writer.put_u8(DataType::Float32 as u8);
                writer.put_u8(components);

                match self.quantization.get(&attribute.semantic) {
                    Some(&bits) => {
                        writer.put_u8(AttributeEncoding::Quantized as u8);
                        write_quantized(writer, values, components as usize, bits)?;
                    }
                    None => {
                        writer.put_u8(AttributeEncoding::Raw as u8);
                        for &value in values {
                            writer.put_f32(value);
                        }
                    }
                }
            }
            SourceValues::Integer { data_type, values } => {
                if data_type.is_float() {
                    return Err(CodecError::InconsistentAttribute(
                        "integer values declared as Float32".to_string(),
                    ));
                }

                writer.put_u8(*data_type as u8);
                writer.put_u8(components);
                writer.put_u8(AttributeEncoding::Delta as u8);

                let (low, high) = data_type.integer_range();
                let mut previous = vec![0i64; components as usize];
                for (index, &value) in values.iter().enumerate() {
                    if value < low || value > high {
                        return Err(CodecError::InconsistentAttribute(format!(
                            "value {} out of range for {:?}",
                            value, data_type
                        )));
                    }
                    let component = index % components as usize;
                    writer.put_zigzag(value - previous[component]);
                    previous[component] = value;
                }
            }
        }

        Ok(())
    }
}

fn write_quantized(
    writer: &mut ByteWriter,
    values: &[f32],
    components: usize,
    bits: u8,
) -> Result<(), CodecError> {
    if bits == 0 || bits > 30 {
        return Err(CodecError::InvalidQuantization(bits));
    }
    if values.iter().any(|value| !value.is_finite()) {
        return Err(CodecError::InconsistentAttribute(
            "non-finite value in quantized attribute".to_string(),
        ));
    }

    let mut min = vec![f32::MAX; components];
    let mut max = vec![f32::MIN; components];
    for (index, &value) in values.iter().enumerate() {
        let component = index % components;
        min[component] = min[component].min(value);
        max[component] = max[component].max(value);
    }
    if values.is_empty() {
        min.fill(0.0);
        max.fill(0.0);
    }

    // One range for all components keeps the quantization grid uniform
    let range = min
        .iter()
        .zip(&max)
        .map(|(low, high)| high - low)
        .fold(0.0f32, f32::max);

    let max_quantized = ((1u32 << bits) - 1) as f32;
    let scale = if range > 0.0 { max_quantized / range } else { 0.0 };

    writer.put_u8(bits);
    for &low in &min {
        writer.put_f32(low);
    }
    writer.put_f32(range);

    let mut previous = vec![0i64; components];
    for (index, &value) in values.iter().enumerate() {
        let component = index % components;
        let quantized = ((value - min[component]) * scale + 0.5).floor().clamp(0.0, max_quantized) as i64;
        writer.put_zigzag(quantized - previous[component]);
        previous[component] = quantized;
    }

    Ok(())
}

fn write_faces(writer: &mut ByteWriter, faces: &[[u32; 3]], num_points: usize) -> Result<(), CodecError> {
    let mut previous = 0i64;

    for face in faces {
        for &corner in face {
            if corner as usize >= num_points {
                return Err(CodecError::FaceIndexOutOfRange {
                    index: corner as u64,
                    num_points,
                });
            }
            writer.put_zigzag(corner as i64 - previous);
            previous = corner as i64;
        }
    }

    Ok(())
}
