//! Protocol tunables shared by client and server.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::heartbeat::HEARTBEAT_PAYLOAD;
use crate::wire::{CodecError, FrameCodec, DEFAULT_HEADER_SIZE, DEFAULT_MAX_FRAME_LEN};

/// Framing and liveness settings. Durations are in milliseconds on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Length header width in bytes (default 4).
    #[serde(default = "default_header_size")]
    pub header_size: usize,
    /// Largest accepted payload (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Client heartbeat period (default 5 s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Server stale-connection sweep period (default 10 s).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Time without a heartbeat after which a connection is evicted (default 10 s).
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

fn default_header_size() -> usize {
    DEFAULT_HEADER_SIZE
}
fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}
fn default_stale_after_ms() -> u64 {
    10_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            header_size: default_header_size(),
            max_frame_len: default_max_frame_len(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("stale threshold ({stale_ms} ms) must exceed heartbeat interval ({heartbeat_ms} ms)")]
    StaleNotAboveHeartbeat { stale_ms: u64, heartbeat_ms: u64 },
    #[error("max frame length {0} cannot carry a heartbeat")]
    FrameTooSmallForHeartbeat(u32),
}

impl ProtocolConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn codec(&self) -> Result<FrameCodec, ConfigError> {
        Ok(FrameCodec::new(self.header_size, self.max_frame_len)?)
    }

    /// Check every setting; returns the codec they describe.
    pub fn validate(&self) -> Result<FrameCodec, ConfigError> {
        let codec = self.codec()?;
        if (self.max_frame_len as usize) < HEARTBEAT_PAYLOAD.len() {
            return Err(ConfigError::FrameTooSmallForHeartbeat(self.max_frame_len));
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("stale_after_ms", self.stale_after_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.stale_after_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::StaleNotAboveHeartbeat {
                stale_ms: self.stale_after_ms,
                heartbeat_ms: self.heartbeat_interval_ms,
            });
        }
        Ok(codec)
    }
}
