#![forbid(unsafe_code)]

//! Portlink transport abstraction.
//!
//! A [`Transport`] is a bidirectional byte pipe with asynchronous delivery
//! callbacks. The reliable channel is oblivious to the physical medium
//! behind the trait; the in-process [`LoopbackTransport`] pair in this crate
//! is the reference implementation and doubles as the protocol's
//! fault-injection bench.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod loopback;

pub use loopback::{LoopbackConfig, LoopbackStats, LoopbackTransport};

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

/// Transport lifecycle. `Error` is terminal; everything else cycles from
/// `Closed` through `Opening`, `Open`, and `Closing` back to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Closing,
    Error,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Closed => "closed",
            TransportState::Opening => "opening",
            TransportState::Open => "open",
            TransportState::Closing => "closing",
            TransportState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("already open")]
    AlreadyOpen,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("open failed: {0}")]
    OpenFailed(String),
    #[error("not open")]
    NotOpen,
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Invoked from the transport's worker whenever bytes arrive. May fire on
/// any task; bytes across calls form one logical stream with no frame
/// boundaries preserved.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Invoked on every lifecycle transition.
pub type StateCallback = Arc<dyn Fn(TransportState) + Send + Sync>;
/// Invoked when the transport rejects or loses work internally.
pub type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Abstract byte pipe consumed by the reliable channel.
///
/// `write` is all-or-nothing and must not block beyond a short bounded
/// interval; implementations buffer internally. Partial writes are never
/// surfaced.
pub trait Transport: Send + Sync {
    /// Bring the pipe up. Fails with `AlreadyOpen`, `InvalidConfig`, or
    /// `OpenFailed`.
    fn open(&self) -> Result<()>;

    /// Terminate delivery. Outstanding writes complete or are discarded.
    fn close(&self);

    /// Queue `bytes` for delivery to the peer. Fails with `NotOpen` or
    /// `WriteFailed`; on success all bytes were accepted.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    fn set_data_callback(&self, cb: Option<DataCallback>);
    fn set_state_callback(&self, cb: Option<StateCallback>);
    fn set_error_callback(&self, cb: Option<ErrorCallback>);

    fn state(&self) -> TransportState;

    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }
}
