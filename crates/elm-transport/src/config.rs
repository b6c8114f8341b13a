//! Adapter timing configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of the ELM327 transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElmConfig {
    /// Added to the caller's receive timeout (ms)
    pub read_timeout_offset_ms: u64,
    /// Timeout for AT command answers (ms)
    pub command_timeout_ms: u64,
    /// Timeout for a CAN frame from the ECU (ms)
    pub data_timeout_ms: u64,
    /// Timeout for a CAN frame through a Carly adapter (ms)
    pub carly_data_timeout_ms: u64,
    /// Block size advertised in our flow control frames
    pub can_block_size: u8,
    /// Separation time advertised in our flow control frames
    pub can_sep_time: u8,
    /// Worker idle wait between polling passes (ms)
    pub poll_interval_ms: u64,
    /// Lower bound for the gap between consecutive frames we send (ms)
    pub min_frame_gap_ms: u64,
    /// Drive WGSoft adapters through the full transport path instead of refusing them
    pub allow_full_transport: bool,
}

impl Default for ElmConfig {
    fn default() -> Self {
        Self {
            read_timeout_offset_ms: 1000,
            command_timeout_ms: 1500,
            data_timeout_ms: 2000,
            carly_data_timeout_ms: 500,
            can_block_size: 8,
            can_sep_time: 0,
            poll_interval_ms: 10,
            min_frame_gap_ms: 50,
            allow_full_transport: false,
        }
    }
}

impl ElmConfig {
    /// Load from a TOML (or any `config`-supported) file, with `ELM_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("ELM"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout_offset(&self) -> Duration {
        Duration::from_millis(self.read_timeout_offset_ms)
    }
}
