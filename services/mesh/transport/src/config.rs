//! Transport stack configuration.

use mesh_storage::ReplayCacheMode;
use mesh_wire::segment::{
    DEFAULT_COMPLETED_CAPACITY, DEFAULT_MAX_REASSEMBLIES, DEFAULT_REASSEMBLY_TIMEOUT,
};
use mesh_wire::ReassemblyConfig;
use std::time::Duration;

/// Configuration for a [`crate::MeshStack`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Replay cache backend
    pub replay_cache: ReplayCacheMode,
    /// Partial messages idle longer than this are dropped
    pub reassembly_timeout: Duration,
    /// Maximum concurrent reassemblies
    pub max_reassemblies: usize,
    /// Completed messages remembered for duplicate suppression
    pub completed_capacity: usize,
    /// Maximum queued network PDUs; `None` buffers without limit
    pub send_queue_limit: Option<usize>,
}

impl TransportConfig {
    /// Reassembly bounds derived from this configuration
    pub fn reassembly(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            timeout: self.reassembly_timeout,
            max_contexts: self.max_reassemblies,
            completed_capacity: self.completed_capacity,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            replay_cache: ReplayCacheMode::default(),
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_reassemblies: DEFAULT_MAX_REASSEMBLIES,
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
            send_queue_limit: Some(64),
        }
    }
}
