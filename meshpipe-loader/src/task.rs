//! Geometry decode task
//!
//! Runs inside an execution context. `init` prepares a lazily instantiated
//! codec module per context; `run` decodes one buffer into typed attribute
//! arrays. Every codec-native object is destroyed before `run` returns.

use crate::config::{AttributeKey, AttributeType, TaskConfig};
use crate::error::DecodeError;
use crate::geometry::{DecodedAttribute, DecodedGeometry, TypedArray};
use futures::future::{BoxFuture, FutureExt, Shared};
use meshpipe_codec::{
    ArrayElement, CodecConfig, CodecError, CodecModule, Decoder, Geometry, GeometryType, Mesh, PointAttribute,
    Semantic, Status,
};
use meshpipe_tasks::{Task, TaskError, TaskFuture};
use std::sync::Arc;

/// Task type the loader registers [`DecodeTask`] under
pub const DECODE_TASK: &str = "mesh-decode";

/// Config sent with every decode request
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    /// Encoded bytes, moved into the execution context
    pub buffer: Vec<u8>,
    pub config: TaskConfig,
}

/// Per-context state: the codec module, instantiated on first use
pub struct DecodeScope {
    module: Shared<BoxFuture<'static, Result<Arc<CodecModule>, CodecError>>>,
}

impl DecodeScope {
    pub async fn module(&self) -> Result<Arc<CodecModule>, CodecError> {
        self.module.clone().await
    }
}

pub struct DecodeTask;

impl Task for DecodeTask {
    type Dependencies = CodecConfig;
    type Scope = DecodeScope;
    type Config = DecodeRequest;
    type Output = DecodedGeometry;

    fn init(&self, codec: &CodecConfig) -> DecodeScope {
        let codec = codec.clone();
        DecodeScope {
            module: async move { CodecModule::instantiate(codec) }.boxed().shared(),
        }
    }

    fn run(&self, scope: Arc<DecodeScope>, request: DecodeRequest) -> TaskFuture<DecodedGeometry> {
        async move {
            let module = scope.module().await.map_err(DecodeError::from)?;
            let decoded = decode(&module, &request.buffer, &request.config)?;
            Ok::<_, TaskError>(decoded)
        }
        .boxed()
    }
}

/// Decode `bytes` into the attributes requested by `config`
pub fn decode(module: &CodecModule, bytes: &[u8], config: &TaskConfig) -> Result<DecodedGeometry, DecodeError> {
    let decoder = module.new_decoder();
    let mut buffer = module.new_decoder_buffer();
    buffer.init(bytes);

    let decoded = match decoder.encoded_geometry_type(&buffer) {
        GeometryType::TriangularMesh => {
            let mut mesh = module.new_mesh();
            let status = decoder.decode_buffer_to_mesh(&buffer, &mut mesh);
            check_status(&status, &*mesh)?;

            let mut decoded = decode_attributes(module, &decoder, &*mesh, config)?;
            decoded.index = Some(decode_index(module, &decoder, &mesh)?);
            module.destroy(mesh);
            decoded
        }
        GeometryType::PointCloud => {
            let mut point_cloud = module.new_point_cloud();
            let status = decoder.decode_buffer_to_point_cloud(&buffer, &mut point_cloud);
            check_status(&status, &*point_cloud)?;

            let decoded = decode_attributes(module, &decoder, &*point_cloud, config)?;
            module.destroy(point_cloud);
            decoded
        }
        GeometryType::Invalid => return Err(DecodeError::UnexpectedGeometryType),
    };

    module.destroy(buffer);
    module.destroy(decoder);

    log::debug!(
        "Decoded {} attributes{}",
        decoded.attributes.len(),
        decoded
            .index
            .as_ref()
            .map(|index| format!(", {} faces", index.len() / 3))
            .unwrap_or_default()
    );

    Ok(decoded)
}

fn check_status<G: Geometry + ?Sized>(status: &Status, geometry: &G) -> Result<(), DecodeError> {
    if !status.ok() {
        return Err(DecodeError::DecodingFailed(status.error_msg().to_owned()));
    }
    if geometry.is_null() {
        return Err(DecodeError::DecodingFailed("decoder produced no geometry".to_owned()));
    }
    Ok(())
}

fn decode_attributes<G: Geometry + ?Sized>(
    module: &CodecModule,
    decoder: &Decoder,
    geometry: &G,
    config: &TaskConfig,
) -> Result<DecodedGeometry, DecodeError> {
    let mut decoded = DecodedGeometry::default();

    for (name, key) in &config.attribute_ids {
        let Some(attribute) = find_attribute(module, decoder, geometry, name, key, config.use_unique_ids)? else {
            log::trace!("Attribute \"{}\" not present, skipping", name);
            continue;
        };

        let attribute_type: AttributeType = match config.attribute_types.get(name) {
            Some(attribute_type) => attribute_type.parse()?,
            None => return Err(DecodeError::UnexpectedAttributeType(format!("none given for \"{}\"", name))),
        };

        decoded.attributes.push(DecodedAttribute {
            name: name.clone(),
            array: extract(module, decoder, geometry, attribute, name, attribute_type)?,
            item_size: attribute.num_components(),
        });
    }

    Ok(decoded)
}

fn find_attribute<'g, G: Geometry + ?Sized>(
    module: &CodecModule,
    decoder: &Decoder,
    geometry: &'g G,
    name: &str,
    key: &AttributeKey,
    use_unique_ids: bool,
) -> Result<Option<&'g PointAttribute>, DecodeError> {
    if use_unique_ids {
        let AttributeKey::Unique(unique_id) = *key else {
            return Err(DecodeError::ExpectedUniqueId(name.to_owned()));
        };
        return decoder
            .attribute_by_unique_id(geometry, unique_id)
            .map(Some)
            .ok_or_else(|| DecodeError::MissingUniqueId {
                name: name.to_owned(),
                unique_id,
            });
    }

    let semantic = match key {
        AttributeKey::Semantic(semantic) => module.semantic(semantic),
        AttributeKey::Unique(value) => u8::try_from(*value).ok().and_then(Semantic::from_u8),
    };
    let Some(semantic) = semantic else {
        return Ok(None);
    };

    let attribute_id = decoder.attribute_id(geometry, semantic);
    if attribute_id == -1 {
        return Ok(None);
    }
    Ok(decoder.attribute(geometry, attribute_id))
}

fn extract<G: Geometry + ?Sized>(
    module: &CodecModule,
    decoder: &Decoder,
    geometry: &G,
    attribute: &PointAttribute,
    name: &str,
    attribute_type: AttributeType,
) -> Result<TypedArray, DecodeError> {
    let array = match attribute_type {
        AttributeType::Int8 => TypedArray::Int8(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Uint8 => TypedArray::Uint8(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Int16 => TypedArray::Int16(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Uint16 => TypedArray::Uint16(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Int32 => TypedArray::Int32(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Uint32 => TypedArray::Uint32(extract_values(module, decoder, geometry, attribute)),
        AttributeType::Float32 => TypedArray::Float32(extract_values(module, decoder, geometry, attribute)),
    };

    let expected = geometry.num_points() * attribute.num_components();
    if array.len() != expected {
        return Err(DecodeError::Unrepresentable {
            name: name.to_owned(),
            attribute_type: attribute_type.name(),
        });
    }

    Ok(array)
}

/// Copy every value of `attribute` out of codec memory; empty on failure
fn extract_values<T: ArrayElement, G: Geometry + ?Sized>(
    module: &CodecModule,
    decoder: &Decoder,
    geometry: &G,
    attribute: &PointAttribute,
) -> Vec<T> {
    let mut array = module.new_array::<T>();
    let values = if decoder.attribute_values_for_all_points(geometry, attribute, &mut *array) {
        array.values().to_vec()
    } else {
        Vec::new()
    };

    module.destroy(array);
    values
}

fn decode_index(module: &CodecModule, decoder: &Decoder, mesh: &Mesh) -> Result<Vec<u32>, DecodeError> {
    let num_faces = mesh.num_faces();
    let mut index = Vec::with_capacity(num_faces * 3);
    let mut face = module.new_array::<i32>();

    for i in 0..num_faces {
        if !decoder.face_from_mesh(mesh, i, &mut face) {
            return Err(DecodeError::DecodingFailed(format!("unreadable face {}", i)));
        }
        index.extend(face.values().iter().map(|&corner| corner as u32));
    }

    module.destroy(face);
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use meshpipe_codec::{CodecFlavor, DataType, Encoder, GeometrySource};
    use std::collections::BTreeMap;

    fn module() -> Arc<CodecModule> {
        CodecModule::instantiate(CodecConfig::default()).unwrap()
    }

    fn quad() -> GeometrySource {
        GeometrySource::mesh(vec![[0, 1, 2], [2, 1, 3]])
            .with_float_attribute(
                Semantic::Position,
                3,
                vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0],
            )
            .with_float_attribute(Semantic::TexCoord, 2, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0])
    }

    fn semantic_config(entries: &[(&str, &str, &str)]) -> TaskConfig {
        TaskConfig {
            attribute_ids: entries
                .iter()
                .map(|(name, semantic, _)| (name.to_string(), AttributeKey::from(*semantic)))
                .collect(),
            attribute_types: entries
                .iter()
                .map(|(name, _, ty)| (name.to_string(), ty.to_string()))
                .collect(),
            use_unique_ids: false,
        }
    }

    #[test]
    fn test_mesh_index_and_positions() {
        let module = module();
        let bytes = Encoder::new().encode(&quad()).unwrap();
        let config = semantic_config(&[("position", "POSITION", "Float32Array")]);

        let decoded = decode(&module, &bytes, &config).unwrap();

        assert_eq!(decoded.index.as_ref().map(Vec::len), Some(3 * 2));
        assert_eq!(decoded.index, Some(vec![0, 1, 2, 2, 1, 3]));
        assert_eq!(decoded.attributes.len(), 1);
        assert_eq!(decoded.attributes[0].array.len(), 4 * 3);
        assert_eq!(decoded.attributes[0].item_size, 3);
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_absent_semantic_is_omitted() {
        let module = module();
        let bytes = Encoder::new().encode(&quad()).unwrap();
        let config = semantic_config(&[
            ("position", "POSITION", "Float32Array"),
            ("normal", "NORMAL", "Float32Array"),
            ("weird", "NOT_A_SEMANTIC", "Float32Array"),
            ("uv", "TEX_COORD", "Float32Array"),
        ]);

        let decoded = decode(&module, &bytes, &config).unwrap();
        let names: Vec<&str> = decoded.attributes.iter().map(|a| a.name.as_str()).collect();

        assert_eq!(names, vec!["position", "uv"]);
        assert_eq!(decoded.attributes[1].item_size, 2);
    }

    #[test]
    fn test_point_cloud_has_no_index() {
        let module = module();
        let source = GeometrySource::point_cloud()
            .with_float_attribute(Semantic::Position, 3, vec![0.5; 30])
            .with_integer_attribute(Semantic::Color, DataType::Uint8, 4, vec![255; 40]);
        let bytes = Encoder::new().encode(&source).unwrap();
        let config = semantic_config(&[
            ("position", "POSITION", "Float32Array"),
            ("color", "COLOR", "Uint8Array"),
        ]);

        let decoded = decode(&module, &bytes, &config).unwrap();

        assert!(decoded.index.is_none());
        let color = decoded.attributes.iter().find(|a| a.name == "color").unwrap();
        assert_eq!(color.array, TypedArray::Uint8(vec![255; 40]));
    }

    #[test]
    fn test_unique_id_lookup() {
        let module = module();
        let source = GeometrySource::point_cloud()
            .with_float_attribute(Semantic::Generic, 1, vec![1.0, 2.0])
            .with_unique_id(17);
        let bytes = Encoder::new().encode(&source).unwrap();

        let mut config = TaskConfig {
            attribute_ids: BTreeMap::from([("weight".to_string(), AttributeKey::Unique(17))]),
            attribute_types: BTreeMap::from([("weight".to_string(), "Float32Array".to_string())]),
            use_unique_ids: true,
        };
        let decoded = decode(&module, &bytes, &config).unwrap();
        assert_eq!(decoded.attributes[0].array, TypedArray::Float32(vec![1.0, 2.0]));

        config.attribute_ids.insert("weight".to_string(), AttributeKey::Unique(18));
        assert_eq!(
            decode(&module, &bytes, &config),
            Err(DecodeError::MissingUniqueId {
                name: "weight".to_string(),
                unique_id: 18
            })
        );
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_unexpected_attribute_type() {
        let module = module();
        let bytes = Encoder::new().encode(&quad()).unwrap();
        let config = semantic_config(&[("position", "POSITION", "Float64Array")]);

        let error = decode(&module, &bytes, &config).unwrap_err();
        assert!(error.to_string().starts_with("Unexpected attribute type"));
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_absent_attribute_type_is_not_checked() {
        let module = module();
        let bytes = Encoder::new().encode(&quad()).unwrap();
        let config = semantic_config(&[
            ("position", "POSITION", "Float32Array"),
            ("normal", "NORMAL", "Float64Array"),
        ]);

        let decoded = decode(&module, &bytes, &config).unwrap();
        assert_eq!(decoded.attributes.len(), 1);
        assert_eq!(decoded.attributes[0].name, "position");
    }

    #[test]
    fn test_missing_attribute_type_is_fatal() {
        let module = module();
        let bytes = Encoder::new().encode(&quad()).unwrap();
        let mut config = semantic_config(&[("position", "POSITION", "Float32Array")]);
        config.attribute_types.clear();

        assert_eq!(
            decode(&module, &bytes, &config),
            Err(DecodeError::UnexpectedAttributeType(
                "none given for \"position\"".to_string()
            ))
        );
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_invalid_buffers() {
        let module = module();
        let config = semantic_config(&[("position", "POSITION", "Float32Array")]);

        assert_eq!(
            decode(&module, b"garbage", &config),
            Err(DecodeError::UnexpectedGeometryType)
        );

        let mut bytes = Encoder::new().encode(&quad()).unwrap();
        bytes.truncate(bytes.len() - 2);
        let error = decode(&module, &bytes, &config).unwrap_err();
        assert!(error.to_string().starts_with("Decoding failed: "));
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_task_runs_through_scope() {
        let task = DecodeTask;
        let scope = Arc::new(task.init(&CodecConfig {
            flavor: CodecFlavor::Portable,
            module_path: None,
        }));
        let request = DecodeRequest {
            buffer: Encoder::new().encode(&quad()).unwrap(),
            config: semantic_config(&[("position", "POSITION", "Float32Array")]),
        };

        let decoded = block_on(task.run(Arc::clone(&scope), request)).unwrap();
        assert_eq!(decoded.attributes.len(), 1);

        let module = block_on(scope.module()).unwrap();
        assert_eq!(module.config().flavor, CodecFlavor::Portable);
        assert_eq!(module.live_objects(), 0);
    }

    #[test]
    fn test_missing_module_path_fails_run() {
        let task = DecodeTask;
        let scope = Arc::new(task.init(&CodecConfig {
            flavor: CodecFlavor::Accelerated,
            module_path: Some("/nonexistent/meshpipe/decoder".into()),
        }));
        let request = DecodeRequest {
            buffer: Vec::new(),
            config: semantic_config(&[]),
        };

        assert!(matches!(block_on(task.run(scope, request)), Err(TaskError::Failed(_))));
    }
}
