//! Reliable-channel configuration. Plain values constructed in code, with a
//! TOML loader for tooling and tests. Validation happens once, up front;
//! the channel never re-checks these bounds at runtime.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

/// Hard ceiling on the sliding-window size.
pub const MAX_WINDOW_SIZE: u16 = 256;
/// Hard ceiling on a single frame payload.
pub const MAX_PAYLOAD_CEILING: usize = 4096;
/// The adaptive retransmission timeout never drops below this.
pub const RTO_FLOOR_MS: u64 = 50;

/// Configuration for one reliable channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Protocol version advertised in START metadata.
    pub version: u8,

    /// Sliding-window size W, in frames (1..=256).
    pub window_size: u16,

    /// Retransmissions allowed per frame before the channel fails.
    pub max_retries: u32,

    /// Retransmission timeout floor in milliseconds (initial RTO).
    pub timeout_base_ms: u64,

    /// Retransmission timeout ceiling in milliseconds; also bounds the
    /// handshake and teardown waits.
    pub timeout_max_ms: u64,

    /// Idle interval between HEARTBEAT frames. Liveness expires at three
    /// missed intervals.
    pub heartbeat_interval_ms: u64,

    /// Largest DATA payload the channel will put in one frame (1..=4096).
    pub max_payload_size: usize,

    /// First sequence number this side allocates. Zero in production;
    /// tests set values near the wrap point.
    pub initial_sequence: u16,

    /// Reserved knob, accepted and ignored.
    pub enable_compression: bool,
    /// Reserved knob, accepted and ignored.
    pub enable_encryption: bool,
    /// Reserved knob, accepted and ignored.
    pub encryption_key: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            version: 1,
            window_size: 4,
            max_retries: 3,
            timeout_base_ms: 500,
            timeout_max_ms: 2000,
            heartbeat_interval_ms: 1000,
            max_payload_size: 1024,
            initial_sequence: 0,
            enable_compression: false,
            enable_encryption: false,
            encryption_key: String::new(),
        }
    }
}

impl ChannelConfig {
    /// Check every bound the protocol depends on. Called by
    /// `ReliableChannel::initialize`; a failure here is non-recoverable at
    /// the call site.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(Error::config(format!(
                "window_size {} outside 1..={MAX_WINDOW_SIZE}",
                self.window_size
            )));
        }
        if self.max_payload_size == 0 || self.max_payload_size > MAX_PAYLOAD_CEILING {
            return Err(Error::config(format!(
                "max_payload_size {} outside 1..={MAX_PAYLOAD_CEILING}",
                self.max_payload_size
            )));
        }
        if self.timeout_base_ms == 0 {
            return Err(Error::config("timeout_base_ms must be non-zero"));
        }
        if self.timeout_max_ms < self.timeout_base_ms {
            return Err(Error::config(format!(
                "timeout_max_ms {} below timeout_base_ms {}",
                self.timeout_max_ms, self.timeout_base_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::config("heartbeat_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<ChannelConfig>(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn timeout_base(&self) -> Duration {
        Duration::from_millis(self.timeout_base_ms)
    }

    pub fn timeout_max(&self) -> Duration {
        Duration::from_millis(self.timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Peer is considered unreachable after this much inactivity.
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(3))
    }
}
