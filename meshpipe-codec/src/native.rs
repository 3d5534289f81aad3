//! Tracked codec-native objects
//!
//! Every object handed out by a [`CodecModule`](crate::CodecModule) is wrapped in
//! [`Native`], which counts against the module's live-object tally until it is
//! destroyed. Dropping a handle releases it, so early returns and `?` paths
//! never leak codec memory.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-object accounting shared by a module and its handles
#[derive(Debug)]
pub struct ObjectTracker {
    live: AtomicUsize,
    next_ptr: AtomicU64,
}

impl ObjectTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicUsize::new(0),
            next_ptr: AtomicU64::new(1),
        })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn acquire(&self) -> u64 {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.next_ptr.fetch_add(1, Ordering::Relaxed)
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a codec-native object
pub struct Native<T> {
    ptr: u64,
    value: T,
    tracker: Arc<ObjectTracker>,
}

impl<T> Native<T> {
    pub(crate) fn new(tracker: &Arc<ObjectTracker>, value: T) -> Self {
        let ptr = tracker.acquire();
        Self {
            ptr,
            value,
            tracker: Arc::clone(tracker),
        }
    }

    /// Allocation address of the handle (never zero)
    pub fn handle(&self) -> u64 {
        self.ptr
    }
}

impl<T> Deref for Native<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Native<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Native<T> {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for Native<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Native")
            .field("handle", &self.ptr)
            .field("value", &self.value)
            .finish()
    }
}
