//! Decode results keyed by input buffer identity

use crate::buffer::{EncodedBuffer, WeakBuffer};
use crate::error::LoaderError;
use crate::geometry::BufferGeometry;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Pending or completed decode, cloneable across callers
pub type GeometryFuture = Shared<BoxFuture<'static, Result<Arc<BufferGeometry>, LoaderError>>>;

struct Entry {
    buffer: WeakBuffer,
    fingerprint: String,
    result: GeometryFuture,
}

/// One decode per live buffer
///
/// Entries hold their buffer weakly and are pruned once it is dropped.
#[derive(Default)]
pub struct DecodeCache {
    entries: Mutex<HashMap<usize, Entry>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the decode registered for `buffer`, or register the one built
    /// by `submit`
    ///
    /// A second request for the same buffer with another fingerprint fails
    /// with [`LoaderError::BufferConflict`] while the buffer still holds
    /// bytes. Once it reports empty the request is submitted again.
    pub fn get_or_submit<F>(
        &self,
        buffer: &EncodedBuffer,
        fingerprint: String,
        submit: F,
    ) -> Result<GeometryFuture, LoaderError>
    where
        F: FnOnce() -> GeometryFuture,
    {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.buffer.is_alive());

        let key = buffer.identity();
        if let Some(entry) = entries.get(&key).filter(|entry| entry.buffer.refers_to(buffer)) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.result.clone());
            }
            if !buffer.is_empty() {
                return Err(LoaderError::BufferConflict);
            }

            log::warn!(
                "Re-decoding an empty buffer with different settings; it may already have been transferred"
            );
        }

        let result = submit();
        entries.insert(
            key,
            Entry {
                buffer: buffer.downgrade(),
                fingerprint,
                result: result.clone(),
            },
        );

        Ok(result)
    }

    /// Number of entries whose buffer is still alive
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.buffer.is_alive());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
