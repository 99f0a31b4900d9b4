#![forbid(unsafe_code)]

//! Portlink reliable stream layer.
//!
//! Frame model and wire codec, sliding send/receive windows with 16-bit
//! wraparound arithmetic, adaptive retransmission timing, and the
//! [`ReliableChannel`] that ties them to a transport.

pub mod channel;
pub mod codec;
pub mod frame;
pub mod rtt;
pub mod stats;
pub mod window;

pub use channel::{
    ChannelErrorCallback, ConnectionCallback, DeliveryCallback, ProgressCallback,
    ReliableChannel, SessionState,
};
pub use codec::FrameCodec;
pub use frame::{DecodeError, Frame, FrameKind, StartMetadata};
pub use stats::ChannelStats;
