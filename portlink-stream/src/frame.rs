//! Frame model and single-frame wire serialization.
//!
//! Wire layout, little-endian throughout, no padding:
//!
//! ```text
//! [header_magic u16 = 0xAA55]
//! [kind u8] [sequence u16] [length u16] [crc32 u32]
//! [payload ...length bytes]
//! [trailer_magic u16 = 0x55AA]
//! ```
//!
//! The CRC32 (IEEE 802.3, reflected 0xEDB88320) covers kind, sequence,
//! length, and payload. Magics frame the unit for stream resynchronization
//! and are not covered.

use bytes::{BufMut, Bytes, BytesMut};
use portlink_core::{Error, SessionId};
use thiserror::Error;

pub const HEADER_MAGIC: u16 = 0xAA55;
pub const TRAILER_MAGIC: u16 = 0x55AA;

/// Fixed header: magic + kind + sequence + length + crc32.
pub const HEADER_LEN: usize = 11;
pub const TRAILER_LEN: usize = 2;
/// Size of an empty-payload frame.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

/// Default largest DATA payload per frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

/// Atomic protocol unit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Start = 0x01,
    Data = 0x02,
    End = 0x03,
    Ack = 0x10,
    Nak = 0x11,
    Heartbeat = 0x20,
}

impl FrameKind {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Start),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::End),
            0x10 => Some(Self::Ack),
            0x11 => Some(Self::Nak),
            0x20 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Why a byte sequence failed to decode as a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Header or trailer sentinel missing.
    #[error("magic mismatch")]
    MagicMismatch,
    /// Declared payload length above the configured cap.
    #[error("length {0} overflows payload cap")]
    LengthOverflow(u16),
    /// Integrity tag did not match the frame contents.
    #[error("crc mismatch")]
    CrcMismatch,
    /// Fewer bytes than the frame declares.
    #[error("truncated frame")]
    Truncated,
    /// CRC-valid frame carrying a kind this protocol does not define.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Payload-free frame (ACK, NAK, END, HEARTBEAT).
    pub fn control(kind: FrameKind, sequence: u16) -> Self {
        Self {
            kind,
            sequence,
            payload: Bytes::new(),
        }
    }

    pub fn data(sequence: u16, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            sequence,
            payload,
        }
    }

    /// Encoded size on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

fn frame_crc(kind: u8, sequence: u16, length: u16, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize a frame. Payload larger than `max_payload` is a programmer
/// error; debug builds fail fast, release builds truncate.
pub fn encode(kind: FrameKind, sequence: u16, payload: &[u8], max_payload: usize) -> Bytes {
    debug_assert!(
        payload.len() <= max_payload,
        "payload {} exceeds cap {max_payload}",
        payload.len()
    );
    let take = payload.len().min(max_payload);
    let payload = &payload[..take];
    let length = take as u16;

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + take);
    buf.put_u16_le(HEADER_MAGIC);
    buf.put_u8(kind as u8);
    buf.put_u16_le(sequence);
    buf.put_u16_le(length);
    buf.put_u32_le(frame_crc(kind as u8, sequence, length, payload));
    buf.put_slice(payload);
    buf.put_u16_le(TRAILER_MAGIC);
    buf.freeze()
}

/// Decode one frame from the front of `bytes`. Never looks past
/// `FRAME_OVERHEAD + length`; trailing bytes are ignored.
pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Frame, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != HEADER_MAGIC {
        return Err(DecodeError::MagicMismatch);
    }
    let kind_byte = bytes[2];
    let sequence = u16::from_le_bytes([bytes[3], bytes[4]]);
    let length = u16::from_le_bytes([bytes[5], bytes[6]]);
    if length as usize > max_payload {
        return Err(DecodeError::LengthOverflow(length));
    }
    let total = FRAME_OVERHEAD + length as usize;
    if bytes.len() < total {
        return Err(DecodeError::Truncated);
    }
    let crc = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
    let payload = &bytes[HEADER_LEN..HEADER_LEN + length as usize];
    let trailer = u16::from_le_bytes([bytes[total - 2], bytes[total - 1]]);
    if trailer != TRAILER_MAGIC {
        return Err(DecodeError::MagicMismatch);
    }
    if frame_crc(kind_byte, sequence, length, payload) != crc {
        return Err(DecodeError::CrcMismatch);
    }
    let kind = FrameKind::from_wire(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;
    Ok(Frame {
        kind,
        sequence,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Payload of a START frame.
///
/// `version u8 | flags u8 | name_len u16 | name | file_size u64 |
/// modify_time u64 | session_id u16`, little-endian. A plain handshake
/// carries an empty name and zero size/mtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMetadata {
    pub version: u8,
    pub flags: u8,
    pub file_name: String,
    pub file_size: u64,
    pub modify_time: u64,
    pub session_id: SessionId,
}

impl StartMetadata {
    /// Handshake metadata with no file attached.
    pub fn bare(version: u8, session_id: SessionId) -> Self {
        Self {
            version,
            flags: 0,
            file_name: String::new(),
            file_size: 0,
            modify_time: 0,
            session_id,
        }
    }

    /// Whether this START announces a file stream.
    pub fn has_file(&self) -> bool {
        !self.file_name.is_empty() || self.file_size > 0
    }

    pub fn encode(&self) -> Bytes {
        let name = self.file_name.as_bytes();
        let mut buf = BytesMut::with_capacity(2 + 2 + name.len() + 8 + 8 + 2);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        buf.put_u64_le(self.file_size);
        buf.put_u64_le(self.modify_time);
        buf.put_u16_le(self.session_id.get());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        const FIXED_TAIL: usize = 8 + 8 + 2;
        if payload.len() < 4 {
            return Err(Error::protocol("start metadata too short"));
        }
        let version = payload[0];
        let flags = payload[1];
        let name_len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
        let name_end = 4usize
            .checked_add(name_len)
            .ok_or_else(|| Error::protocol("start metadata name length overflow"))?;
        if name_end + FIXED_TAIL > payload.len() {
            return Err(Error::protocol("start metadata name overruns payload"));
        }
        let file_name = core::str::from_utf8(&payload[4..name_end])
            .map_err(|_| Error::protocol("start metadata name is not utf-8"))?
            .to_owned();
        let rest = &payload[name_end..];
        let file_size = u64::from_le_bytes(rest[0..8].try_into().map_err(|_| {
            Error::protocol("start metadata truncated")
        })?);
        let modify_time = u64::from_le_bytes(rest[8..16].try_into().map_err(|_| {
            Error::protocol("start metadata truncated")
        })?);
        let session_id = u16::from_le_bytes(rest[16..18].try_into().map_err(|_| {
            Error::protocol("start metadata truncated")
        })?);
        Ok(Self {
            version,
            flags,
            file_name,
            file_size,
            modify_time,
            session_id: SessionId(session_id),
        })
    }
}
