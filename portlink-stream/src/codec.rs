//! Streaming frame extraction with resynchronization.
//!
//! The codec owns a growing byte buffer fed by [`FrameCodec::append`] and
//! polled by [`FrameCodec::try_next_frame`]. Transport callbacks do not
//! preserve frame boundaries, and the wire may lose or corrupt bytes; the
//! codec scans for the header sentinel, discards garbage in front of it,
//! and skips past the sentinel of any frame that fails validation so a
//! later genuine frame is always recoverable.

use crate::frame::{self, DecodeError, Frame, FRAME_OVERHEAD, HEADER_LEN, HEADER_MAGIC};
use bytes::{Buf, BytesMut};

/// Little-endian bytes of [`HEADER_MAGIC`] as they appear on the wire.
const MAGIC_BYTES: [u8; 2] = HEADER_MAGIC.to_le_bytes();

pub struct FrameCodec {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    /// Feed raw transport bytes into the scan buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// `None` means more input is needed. `Some(Err(_))` reports one
    /// rejected frame (bytes up to and including its header sentinel are
    /// consumed); callers typically loop until `None`.
    pub fn try_next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        // Discard garbage in front of the first header sentinel. If no
        // sentinel is visible, everything except a possible first half of
        // one at the very end is unrecoverable.
        match find_magic(&self.buf) {
            Some(pos) => {
                if pos > 0 {
                    self.buf.advance(pos);
                }
            }
            None => {
                let keep = usize::from(self.buf.last() == Some(&MAGIC_BYTES[0]));
                let drop = self.buf.len() - keep;
                if drop > 0 {
                    self.buf.advance(drop);
                }
                return None;
            }
        }

        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let length = u16::from_le_bytes([self.buf[5], self.buf[6]]) as usize;
        if length > self.max_payload {
            // Bogus header; skip its sentinel and rescan from the next byte.
            self.buf.advance(MAGIC_BYTES.len());
            return Some(Err(DecodeError::LengthOverflow(length as u16)));
        }
        let total = FRAME_OVERHEAD + length;
        if self.buf.len() < total {
            return None;
        }
        match frame::decode(&self.buf[..total], self.max_payload) {
            Ok(frame) => {
                self.buf.advance(total);
                Some(Ok(frame))
            }
            Err(err) => {
                self.buf.advance(MAGIC_BYTES.len());
                Some(Err(err))
            }
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC_BYTES.len())
        .position(|w| w == MAGIC_BYTES)
}
