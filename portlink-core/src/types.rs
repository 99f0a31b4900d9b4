//! Sequence arithmetic and session identity.
//!
//! Frame sequence numbers are 16-bit and wrap; every comparison in the
//! sliding-window logic goes through the helpers here so wraparound is
//! handled in exactly one place.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distinct sequence values (u16 space).
pub const SEQ_SPACE: u32 = 65_536;

/// Distance from `from` to `to` walking forward through the wrapping
/// sequence space. `seq_distance(65535, 1) == 2`.
#[inline]
pub fn seq_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Whether `seq` falls inside the window `[base, base + window)` modulo
/// 65536. A zero-sized window contains nothing.
#[inline]
pub fn seq_in_window(seq: u16, base: u16, window: u16) -> bool {
    seq_distance(base, seq) < window
}

/// Identifier of one reliable session, chosen at random by the handshake
/// initiator and echoed by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl SessionId {
    /// Draw a fresh random identifier.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for SessionId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}
