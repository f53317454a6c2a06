//! File-based replay cache with JSON snapshots and recovery

use crate::{ReplayCache, ReplayEntry, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Configuration for the file-based replay cache
#[derive(Clone, Debug)]
pub struct FileReplayConfig {
    /// Snapshot file
    pub path: PathBuf,
    /// Snapshot after this many accepted packets (0 = only on demand)
    pub snapshot_every: u32,
}

impl Default for FileReplayConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./meshdata/replay.json"),
            snapshot_every: 64,
        }
    }
}

/// Snapshot file content
#[derive(Serialize, Deserialize, Debug, Default)]
struct ReplayState {
    entries: BTreeMap<u16, ReplayEntry>,
}

/// Replay cache persisted to a JSON file.
///
/// High-water marks survive restarts, so packets replayed after a reboot are
/// still rejected as long as a snapshot was taken after they were accepted.
pub struct FileReplayCache {
    config: FileReplayConfig,
    state: ReplayState,
    /// Accepted packets since the last snapshot
    pending: u32,
}

impl FileReplayCache {
    /// Open the cache, loading an existing snapshot if present
    pub fn open(config: FileReplayConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let state = if config.path.exists() {
            let content = std::fs::read_to_string(&config.path)?;
            let state: ReplayState = serde_json::from_str(&content)
                .map_err(|e| StorageError::Corruption(format!("{}: {}", config.path.display(), e)))?;
            info!(
                "Loaded replay cache from {} ({} sources)",
                config.path.display(),
                state.entries.len()
            );
            state
        } else {
            ReplayState::default()
        };

        Ok(Self {
            config,
            state,
            pending: 0,
        })
    }

    fn write_snapshot(&self) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.config.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.config.path)?;
        Ok(())
    }
}

impl ReplayCache for FileReplayCache {
    fn highest(&self, src: u16) -> Option<ReplayEntry> {
        self.state.entries.get(&src).copied()
    }

    fn check_and_update(
        &mut self,
        src: u16,
        iv_index: u32,
        seq: u32,
    ) -> Result<bool, StorageError> {
        let candidate = ReplayEntry { iv_index, seq };

        if let Some(current) = self.state.entries.get(&src) {
            if candidate <= *current {
                debug!(src, seq, highest = current.seq, "replay rejected");
                return Ok(false);
            }
        }

        self.state.entries.insert(src, candidate);
        self.pending += 1;

        if self.config.snapshot_every > 0 && self.pending >= self.config.snapshot_every {
            self.snapshot()?;
        }
        Ok(true)
    }

    fn len(&self) -> usize {
        self.state.entries.len()
    }

    fn snapshot(&mut self) -> Result<(), StorageError> {
        debug!("FileReplayCache snapshot ({} sources)", self.state.entries.len());
        self.write_snapshot()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for FileReplayCache {
    fn drop(&mut self) {
        if self.pending > 0 {
            if let Err(e) = self.write_snapshot() {
                warn!("Failed to flush replay cache on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_replay_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileReplayConfig {
            path: dir.path().join("replay.json"),
            snapshot_every: 0,
        };

        {
            let mut cache = FileReplayCache::open(config.clone()).unwrap();
            assert!(cache.check_and_update(0x0003, 0x12345678, 0x3129ab).unwrap());
            assert!(cache.check_and_update(0x1201, 0x12345678, 1).unwrap());
            cache.snapshot().unwrap();
        }

        let mut cache = FileReplayCache::open(config).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(!cache.check_and_update(0x0003, 0x12345678, 0x3129ab).unwrap());
        assert!(cache.check_and_update(0x0003, 0x12345678, 0x3129ac).unwrap());
    }

    #[test]
    fn test_periodic_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replay.json");
        let mut cache = FileReplayCache::open(FileReplayConfig {
            path: path.clone(),
            snapshot_every: 2,
        })
        .unwrap();

        cache.check_and_update(1, 0, 1).unwrap();
        assert!(!path.exists());
        cache.check_and_update(1, 0, 2).unwrap();
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"seq\": 2"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        std::fs::write(&path, "not json").unwrap();

        let result = FileReplayCache::open(FileReplayConfig {
            path,
            snapshot_every: 0,
        });
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }
}
