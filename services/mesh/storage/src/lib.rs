//! Key store and replay protection storage for mesh, with pluggable backends.
//!
//! This crate holds the state the transport layers consult on every packet:
//! the installed network, application and device keys together with the IV
//! index, and the replay cache that remembers the highest sequence number
//! accepted from each source address. Replay caches come in an in-memory
//! LRU-bounded flavor and a file-persisted one.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod keys;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use backend::file::{FileReplayCache, FileReplayConfig};
pub use backend::mem::MemoryReplayCache;
pub use keys::{ApplicationKey, KeyIndex, KeyStore, NetworkKey};

/// Default number of sources tracked by the in-memory replay cache
pub const DEFAULT_REPLAY_CACHE_CAPACITY: usize = 1024;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Device or application key not installed
    #[error("Key not found: {0}")]
    NotFound(KeyIndex),
    /// Network key index not installed
    #[error("Network key not found: {0}")]
    NetKeyNotFound(u16),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Highest accepted message from one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// IV index the sequence number was accepted under
    pub iv_index: u32,
    /// Highest accepted sequence number
    pub seq: u32,
}

/// Per-source replay protection.
///
/// A packet `(iv_index, seq)` from `src` is fresh only if it orders strictly
/// after the cached entry for `src`.
pub trait ReplayCache: Send {
    /// Highest accepted entry for a source
    fn highest(&self, src: u16) -> Option<ReplayEntry>;

    /// Accept and record `(iv_index, seq)` if fresh; returns false on replay
    fn check_and_update(&mut self, src: u16, iv_index: u32, seq: u32)
        -> Result<bool, StorageError>;

    /// Number of tracked sources
    fn len(&self) -> usize;

    /// True if no source is tracked
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush to durable storage (no-op for volatile backends)
    fn snapshot(&mut self) -> Result<(), StorageError>;
}

/// Replay cache backend configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayCacheMode {
    /// In-memory LRU-bounded cache
    InMemory {
        /// Maximum tracked sources
        capacity: usize,
    },
    /// In-memory cache that never forgets a source
    Unbounded,
    /// JSON file snapshot of the high-water marks
    File {
        /// Snapshot file path
        path: PathBuf,
        /// Snapshot after this many accepted packets (0 = only on demand)
        snapshot_every: u32,
    },
}

impl Default for ReplayCacheMode {
    fn default() -> Self {
        ReplayCacheMode::InMemory {
            capacity: DEFAULT_REPLAY_CACHE_CAPACITY,
        }
    }
}

impl ReplayCacheMode {
    /// Create a replay cache from configuration
    pub fn from_mode(mode: ReplayCacheMode) -> Result<Box<dyn ReplayCache>, StorageError> {
        match mode {
            ReplayCacheMode::InMemory { capacity } => {
                Ok(Box::new(MemoryReplayCache::with_capacity(capacity)))
            }
            ReplayCacheMode::Unbounded => Ok(Box::new(MemoryReplayCache::unbounded())),
            ReplayCacheMode::File {
                path,
                snapshot_every,
            } => Ok(Box::new(FileReplayCache::open(FileReplayConfig {
                path,
                snapshot_every,
            })?)),
        }
    }
}
