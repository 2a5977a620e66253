use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine configuration. All sizes are in bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_dir: PathBuf,
    /// Size of the session contexts file, a multiple of the sector size.
    pub sector_file_size: usize,
    /// Ring capacity of each per-session replay index. Must be a power of
    /// two so ring offsets reduce to a mask.
    pub replay_index_capacity: usize,
    /// Bound on the number of open per-session index files: sets * ways.
    pub index_cache_sets: usize,
    pub index_cache_ways: usize,
    /// Largest single journal fragment; larger messages are fragmented.
    pub max_payload: usize,
    pub outbound_stream_id: u32,
    pub inbound_stream_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("fix-logs"),
            sector_file_size: 64 * 1024,
            replay_index_capacity: 64 * 1024,
            index_cache_sets: 16,
            index_cache_ways: 4,
            max_payload: 4 * 1024,
            outbound_stream_id: 1,
            inbound_stream_id: 2,
        }
    }
}

impl Config {
    pub fn session_contexts_path(&self) -> PathBuf {
        self.log_dir.join("session-contexts")
    }

    pub fn validate(&self) -> Result<()> {
        if !self.replay_index_capacity.is_power_of_two() {
            return Err(Error::IndexCapacityNotPowerOfTwo(
                self.replay_index_capacity,
            ));
        }
        Ok(())
    }
}
