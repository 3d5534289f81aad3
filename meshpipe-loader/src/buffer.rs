//! Encoded input buffers with transferable ownership

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Shared handle to encoded geometry bytes
///
/// Clones refer to the same buffer. Dispatching a decode transfers the bytes
/// out, after which every handle reports a length of zero.
#[derive(Debug, Clone, Default)]
pub struct EncodedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl EncodedBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Move the bytes out, leaving the buffer empty
    pub fn transfer(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// True when both handles refer to the same buffer
    pub fn ptr_eq(&self, other: &EncodedBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.bytes) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Arc::downgrade(&self.bytes))
    }
}

impl From<Vec<u8>> for EncodedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Non-owning reference used as a cache key
#[derive(Debug, Clone)]
pub(crate) struct WeakBuffer(Weak<Mutex<Vec<u8>>>);

impl WeakBuffer {
    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub(crate) fn refers_to(&self, buffer: &EncodedBuffer) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&buffer.bytes))
    }
}
