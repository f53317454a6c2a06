//! In-memory replay cache bounded by LRU eviction

use crate::{ReplayCache, ReplayEntry, StorageError, DEFAULT_REPLAY_CACHE_CAPACITY};
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

/// In-memory replay cache.
///
/// When more than `capacity` sources are tracked the least recently heard
/// source is forgotten, so a very old packet from it would be accepted again.
pub struct MemoryReplayCache {
    entries: LruCache<u16, ReplayEntry>,
}

impl MemoryReplayCache {
    /// Create a cache tracking at most `capacity` sources
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Create an unbounded cache
    pub fn unbounded() -> Self {
        Self {
            entries: LruCache::unbounded(),
        }
    }
}

impl Default for MemoryReplayCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CACHE_CAPACITY)
    }
}

impl ReplayCache for MemoryReplayCache {
    fn highest(&self, src: u16) -> Option<ReplayEntry> {
        self.entries.peek(&src).copied()
    }

    fn check_and_update(
        &mut self,
        src: u16,
        iv_index: u32,
        seq: u32,
    ) -> Result<bool, StorageError> {
        let candidate = ReplayEntry { iv_index, seq };

        if let Some(current) = self.entries.get(&src) {
            if candidate <= *current {
                debug!(src, seq, highest = current.seq, "replay rejected");
                return Ok(false);
            }
        }

        if let Some((evicted, _)) = self.entries.push(src, candidate) {
            if evicted != src {
                debug!(src = evicted, "replay cache evicted source");
            }
        }
        Ok(true)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&mut self) -> Result<(), StorageError> {
        debug!("replay snapshot (no-op for memory backend)");
        Ok(())
    }
}
