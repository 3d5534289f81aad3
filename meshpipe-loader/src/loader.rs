//! Geometry loader facade
//!
//! Turns encoded buffers (or files) into [`BufferGeometry`] by running the
//! decode task on a [`TaskManager`]. Decodes are memoized per buffer.

use crate::buffer::EncodedBuffer;
use crate::cache::{DecodeCache, GeometryFuture};
use crate::config::{AttributeKey, LoaderConfig, TaskConfig};
use crate::error::LoaderError;
use crate::geometry::BufferGeometry;
use crate::task::{DecodeRequest, DecodeTask, DECODE_TASK};
use futures::future::{self, FutureExt};
use meshpipe_codec::CodecConfig;
use meshpipe_tasks::{Dependencies, TaskManager};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct GeometryLoader {
    manager: TaskManager,
    config: RwLock<LoaderConfig>,
    cache: Arc<DecodeCache>,
}

impl GeometryLoader {
    pub fn new(manager: TaskManager) -> Self {
        Self::with_config(manager, LoaderConfig::default())
    }

    pub fn with_config(manager: TaskManager, config: LoaderConfig) -> Self {
        Self {
            manager,
            config: RwLock::new(config),
            cache: Arc::new(DecodeCache::new()),
        }
    }

    /// Share a decode cache with other loaders
    pub fn with_cache(mut self, cache: Arc<DecodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<DecodeCache> {
        &self.cache
    }

    pub fn config(&self) -> LoaderConfig {
        self.config.read().clone()
    }

    /// Decoder install location; applies to contexts initialized afterwards
    pub fn set_decoder_path(&self, path: impl Into<PathBuf>) -> &Self {
        self.config.write().decoder_path = Some(path.into());
        self
    }

    pub fn set_decoder_config(&self, decoder_config: CodecConfig) -> &Self {
        self.config.write().decoder_config = decoder_config;
        self
    }

    pub fn set_attribute_ids(&self, attribute_ids: BTreeMap<String, AttributeKey>) -> &Self {
        self.config.write().attribute_ids = attribute_ids;
        self
    }

    pub fn set_attribute_types(&self, attribute_types: BTreeMap<String, String>) -> &Self {
        self.config.write().attribute_types = attribute_types;
        self
    }

    pub fn set_worker_limit(&self, worker_limit: usize) -> &Self {
        self.manager.set_worker_limit(worker_limit);
        self
    }

    /// Register the decode task ahead of the first decode
    pub fn preload(&self) -> &Self {
        self.ensure_registered();
        self
    }

    /// Read `path` and decode it with the default attribute maps
    pub fn load(&self, path: impl AsRef<Path>) -> GeometryFuture {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => {
                log::debug!("Read {} bytes from {}", bytes.len(), path.display());
                self.parse(&EncodedBuffer::new(bytes))
            }
            Err(e) => failed(LoaderError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Decode `buffer` with the default attribute maps
    pub fn parse(&self, buffer: &EncodedBuffer) -> GeometryFuture {
        let config = self.config.read().default_task_config();
        self.decode_geometry(buffer, config)
    }

    /// Decode with explicit maps
    ///
    /// Passing `attribute_ids` switches lookup to per-file unique ids; omitted
    /// maps fall back to the defaults.
    pub fn decode_with_attributes(
        &self,
        buffer: &EncodedBuffer,
        attribute_ids: Option<BTreeMap<String, AttributeKey>>,
        attribute_types: Option<BTreeMap<String, String>>,
    ) -> GeometryFuture {
        let config = {
            let defaults = self.config.read();
            TaskConfig {
                use_unique_ids: attribute_ids.is_some(),
                attribute_ids: attribute_ids.unwrap_or_else(|| defaults.attribute_ids.clone()),
                attribute_types: attribute_types.unwrap_or_else(|| defaults.attribute_types.clone()),
            }
        };

        self.decode_geometry(buffer, config)
    }

    /// Decode `buffer` with `config`, at most once per buffer
    ///
    /// The buffer's bytes are transferred when the decode is dispatched.
    pub fn decode_geometry(&self, buffer: &EncodedBuffer, config: TaskConfig) -> GeometryFuture {
        let fingerprint = match config.fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) => return failed(e),
        };

        let submitted = self
            .cache
            .get_or_submit(buffer, fingerprint, || self.submit(buffer.clone(), config));

        submitted.unwrap_or_else(failed)
    }

    /// Drop every cached decode
    pub fn dispose(&self) {
        self.cache.clear();
        log::debug!("Geometry loader disposed");
    }

    fn ensure_registered(&self) {
        if self.manager.is_registered(DECODE_TASK) {
            return;
        }

        let codec = self.config.read().codec_config();
        log::debug!("Registering {} task ({:?})", DECODE_TASK, codec.flavor);
        self.manager
            .register_with(DECODE_TASK, DecodeTask, Dependencies::ready(codec));
    }

    fn submit(&self, buffer: EncodedBuffer, config: TaskConfig) -> GeometryFuture {
        self.ensure_registered();
        let manager = self.manager.clone();

        async move {
            let bytes = buffer.transfer();
            drop(buffer);

            let cost = bytes.len() as f64;
            let request = DecodeRequest { buffer: bytes, config };
            let decoded = manager.run::<DecodeTask>(DECODE_TASK, request, cost).await?;

            Ok::<_, LoaderError>(Arc::new(BufferGeometry::from(decoded)))
        }
        .boxed()
        .shared()
    }
}

fn failed(error: LoaderError) -> GeometryFuture {
    future::ready(Err(error)).boxed().shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use meshpipe_codec::{Encoder, GeometrySource, Semantic};
    use meshpipe_tasks::TaskError;

    fn triangle_bytes() -> Vec<u8> {
        let source = GeometrySource::mesh(vec![[0, 1, 2]])
            .with_float_attribute(Semantic::Position, 3, vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0, 1.0])
            .with_float_attribute(Semantic::Normal, 3, vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        Encoder::new().encode(&source).unwrap()
    }

    #[test]
    fn test_parse_builds_geometry() {
        for limit in [0, 2] {
            let loader = GeometryLoader::new(TaskManager::with_worker_limit(limit));
            let buffer = EncodedBuffer::new(triangle_bytes());

            let geometry = block_on(loader.parse(&buffer)).unwrap();

            assert_eq!(geometry.index().map(|index| index.count()), Some(3));
            assert_eq!(geometry.attribute("position").map(|p| p.count()), Some(3));
            assert_eq!(geometry.attribute("normal").map(|n| n.item_size()), Some(3));
            assert!(geometry.attribute("uv").is_none());
            assert_eq!(
                geometry.bounding_box(),
                Some((glam::Vec3::ZERO, glam::Vec3::new(2.0, 3.0, 1.0)))
            );
            assert!(buffer.is_empty(), "bytes should have been transferred");
        }
    }

    #[test]
    fn test_concurrent_decodes_share_one_request() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(2));
        let buffer = EncodedBuffer::new(triangle_bytes());

        let first = loader.parse(&buffer);
        let second = loader.parse(&buffer);
        let (first, second) = block_on(future::join(first, second));

        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(loader.manager().stats().requests_issued, 1);

        // Completed decodes are served from the cache as well
        block_on(loader.parse(&buffer)).unwrap();
        assert_eq!(loader.manager().stats().requests_issued, 1);
    }

    #[test]
    fn test_conflicting_settings_on_untransferred_buffer() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(1));
        let buffer = EncodedBuffer::new(triangle_bytes());

        let pending = loader.parse(&buffer);
        let ids = BTreeMap::from([("position".to_string(), AttributeKey::Unique(0))]);
        let conflicting = loader.decode_with_attributes(&buffer, Some(ids), None);

        assert_eq!(block_on(conflicting).err(), Some(LoaderError::BufferConflict));
        assert!(block_on(pending).is_ok());
    }

    #[test]
    fn test_transferred_buffer_is_resubmitted() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(1));
        let buffer = EncodedBuffer::new(triangle_bytes());

        block_on(loader.parse(&buffer)).unwrap();
        assert!(buffer.is_empty());

        let ids = BTreeMap::from([("position".to_string(), AttributeKey::Unique(0))]);
        let result = block_on(loader.decode_with_attributes(&buffer, Some(ids), None));

        assert_eq!(loader.manager().stats().requests_issued, 2);
        assert_eq!(
            result.err(),
            Some(LoaderError::Task(TaskError::Failed("Unexpected geometry type".to_string())))
        );
    }

    #[test]
    fn test_unique_id_decode() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(1));
        let buffer = EncodedBuffer::new(triangle_bytes());

        let ids = BTreeMap::from([
            ("position".to_string(), AttributeKey::Unique(0)),
            ("normal".to_string(), AttributeKey::Unique(1)),
        ]);
        let types = BTreeMap::from([
            ("position".to_string(), "Float32Array".to_string()),
            ("normal".to_string(), "Int8Array".to_string()),
        ]);
        let geometry = block_on(loader.decode_with_attributes(&buffer, Some(ids), Some(types))).unwrap();

        let normal = geometry.attribute("normal").unwrap();
        assert_eq!(normal.array(), &crate::TypedArray::Int8(vec![0, 0, 1, 0, 0, 1, 0, 0, 1]));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!("meshpipe-loader-{}.mpgc", std::process::id()));
        std::fs::write(&path, triangle_bytes()).unwrap();

        let loader = GeometryLoader::new(TaskManager::with_worker_limit(1));
        let geometry = block_on(loader.load(&path));
        std::fs::remove_file(&path).ok();

        assert_eq!(geometry.unwrap().index().map(|index| index.count()), Some(3));

        let missing = block_on(loader.load(path.with_extension("missing")));
        assert!(matches!(missing, Err(LoaderError::Io { .. })));
    }

    #[test]
    fn test_missing_decoder_path_fails_decode() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(0));
        loader.set_decoder_path("/nonexistent/meshpipe/decoder").preload();

        let result = block_on(loader.parse(&EncodedBuffer::new(triangle_bytes())));
        assert!(matches!(result, Err(LoaderError::Task(TaskError::Failed(_)))));
    }

    #[test]
    fn test_dispose_clears_cache() {
        let loader = GeometryLoader::new(TaskManager::with_worker_limit(1));
        let buffer = EncodedBuffer::new(triangle_bytes());

        block_on(loader.parse(&buffer)).unwrap();
        assert_eq!(loader.cache().len(), 1);

        loader.dispose();
        assert!(loader.cache().is_empty());
    }
}
