//! Decoded geometry and the renderer-facing buffers built from it

use crate::config::AttributeType;
use glam::Vec3;
use std::collections::BTreeMap;

/// Owned typed array
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    Int8(Vec<i8>),
    Uint8(Vec<u8>),
    Int16(Vec<i16>),
    Uint16(Vec<u16>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
}

impl TypedArray {
    pub fn len(&self) -> usize {
        match self {
            TypedArray::Int8(v) => v.len(),
            TypedArray::Uint8(v) => v.len(),
            TypedArray::Int16(v) => v.len(),
            TypedArray::Uint16(v) => v.len(),
            TypedArray::Int32(v) => v.len(),
            TypedArray::Uint32(v) => v.len(),
            TypedArray::Float32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attribute_type(&self) -> AttributeType {
        match self {
            TypedArray::Int8(_) => AttributeType::Int8,
            TypedArray::Uint8(_) => AttributeType::Uint8,
            TypedArray::Int16(_) => AttributeType::Int16,
            TypedArray::Uint16(_) => AttributeType::Uint16,
            TypedArray::Int32(_) => AttributeType::Int32,
            TypedArray::Uint32(_) => AttributeType::Uint32,
            TypedArray::Float32(_) => AttributeType::Float32,
        }
    }

    /// Raw bytes for upload
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TypedArray::Int8(v) => bytemuck::cast_slice(v),
            TypedArray::Uint8(v) => v,
            TypedArray::Int16(v) => bytemuck::cast_slice(v),
            TypedArray::Uint16(v) => bytemuck::cast_slice(v),
            TypedArray::Int32(v) => bytemuck::cast_slice(v),
            TypedArray::Uint32(v) => bytemuck::cast_slice(v),
            TypedArray::Float32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TypedArray::Float32(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAttribute {
    pub name: String,
    pub array: TypedArray,
    pub item_size: usize,
}

/// Output of the decode task
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedGeometry {
    /// Three corner indices per triangle, meshes only
    pub index: Option<Vec<u32>>,
    pub attributes: Vec<DecodedAttribute>,
}

/// Typed array viewed as items of `item_size` components
#[derive(Debug, Clone, PartialEq)]
pub struct BufferAttribute {
    array: TypedArray,
    item_size: usize,
}

impl BufferAttribute {
    pub fn new(array: TypedArray, item_size: usize) -> Self {
        Self {
            array,
            item_size: item_size.max(1),
        }
    }

    pub fn array(&self) -> &TypedArray {
        &self.array
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Number of items
    pub fn count(&self) -> usize {
        self.array.len() / self.item_size
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.array.as_bytes()
    }

    pub fn into_array(self) -> TypedArray {
        self.array
    }
}

/// Renderer-facing geometry: named attributes plus an optional index
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BufferGeometry {
    index: Option<BufferAttribute>,
    attributes: BTreeMap<String, BufferAttribute>,
}

impl BufferGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_index(&mut self, index: Vec<u32>) -> &mut Self {
        self.index = Some(BufferAttribute::new(TypedArray::Uint32(index), 1));
        self
    }

    pub fn index(&self) -> Option<&BufferAttribute> {
        self.index.as_ref()
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, attribute: BufferAttribute) -> &mut Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&BufferAttribute> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &BufferAttribute)> {
        self.attributes.iter().map(|(name, attribute)| (name.as_str(), attribute))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Axis-aligned bounds of a three component float `position` attribute
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        let position = self.attribute("position")?;
        if position.item_size() != 3 {
            return None;
        }

        let values = position.array().as_f32()?;
        let mut points = values.chunks_exact(3).map(Vec3::from_slice);
        let first = points.next()?;

        Some(points.fold((first, first), |(min, max), p| (min.min(p), max.max(p))))
    }
}

impl From<DecodedGeometry> for BufferGeometry {
    fn from(decoded: DecodedGeometry) -> Self {
        let mut geometry = BufferGeometry::new();

        if let Some(index) = decoded.index {
            geometry.set_index(index);
        }
        for attribute in decoded.attributes {
            geometry.set_attribute(attribute.name, BufferAttribute::new(attribute.array, attribute.item_size));
        }

        geometry
    }
}
