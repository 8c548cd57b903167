//! # Audio Buffer Management
//!
//! Accumulates the encoded audio fragments a browser streams while the user is speaking.
//! Fragments are opaque (webm/ogg container bytes), so the buffer never inspects them;
//! it only preserves arrival order until the recording is flushed as one blob.
//!
//! ## Key Features:
//! - **Ordered**: Fragments come back out in the order they were appended
//! - **Atomic flush**: Concatenate-and-clear happens under a single lock, so a chunk is
//!   never returned twice and never lost between the read and the clear
//! - **Thread safety**: Safe for concurrent access from the registry and the connection worker

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-client accumulator of raw audio fragments.
///
/// Uses an internal Mutex so the buffer can be shared through an `Arc` without the
/// caller holding a lock across await points.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment. No size cap is enforced here.
    pub fn append(&self, data: Vec<u8>) {
        self.lock().push(data);
    }

    /// Return every buffered fragment concatenated in arrival order and empty the buffer.
    ///
    /// Returns an empty vector when nothing was buffered.
    pub fn flush_and_clear(&self) -> Vec<u8> {
        let chunks = std::mem::take(&mut *self.lock());
        chunks.concat()
    }

    /// Drop all buffered audio without reading it.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of fragments currently buffered.
    pub fn chunk_count(&self) -> usize {
        self.lock().len()
    }

    /// Total bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().iter().all(Vec::is_empty)
    }

    // A poisoned lock only means another thread panicked mid-push; the Vec is still valid.
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
