//! Sliding send and receive windows over the wrapping 16-bit sequence
//! space.
//!
//! The send window tracks in-flight frames awaiting acknowledgment; the
//! receive window re-orders out-of-sequence arrivals for strict in-order
//! delivery. Both express membership as `(seq - base) mod 65536 < W`.

use crate::frame::FrameKind;
use bytes::Bytes;
use portlink_core::types::SEQ_SPACE;
use portlink_core::{seq_distance, seq_in_window};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight frame awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SendSlot {
    pub sequence: u16,
    pub kind: FrameKind,
    /// Pre-encoded wire image, reused verbatim on retransmit.
    pub wire: Bytes,
    pub payload_len: usize,
    pub first_sent: Instant,
    pub last_sent: Instant,
    /// Per-slot effective timeout; doubles on each retransmission.
    pub rto: Duration,
    pub retries: u32,
}

/// Sender half: slots live in `[base, base + W)`, fronted by the oldest
/// unacknowledged sequence.
#[derive(Debug)]
pub struct SendWindow {
    base: u16,
    next: u16,
    size: u16,
    slots: VecDeque<SendSlot>,
}

impl SendWindow {
    pub fn new(initial_sequence: u16, size: u16) -> Self {
        Self {
            base: initial_sequence,
            next: initial_sequence,
            size,
            slots: VecDeque::with_capacity(size as usize),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Next sequence number to be allocated.
    pub fn next_sequence(&self) -> u16 {
        self.next
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `(send_next - send_base) mod 65536 < W`.
    pub fn has_space(&self) -> bool {
        seq_distance(self.base, self.next) < self.size
    }

    /// Allocate the next sequence and admit a slot for it. Callers check
    /// [`SendWindow::has_space`] first; pushing into a full window is a
    /// logic error upstream.
    pub fn push(
        &mut self,
        kind: FrameKind,
        wire: Bytes,
        payload_len: usize,
        now: Instant,
        rto: Duration,
    ) -> u16 {
        debug_assert!(self.has_space(), "send window overfilled");
        let sequence = self.next;
        self.next = self.next.wrapping_add(1);
        self.slots.push_back(SendSlot {
            sequence,
            kind,
            wire,
            payload_len,
            first_sent: now,
            last_sent: now,
            rto,
            retries: 0,
        });
        sequence
    }

    /// Cumulative acknowledgment: every slot at distance `<= (seq - base)`
    /// is acknowledged and the window base advances past them. Returns the
    /// retired slots (oldest first); empty when `seq` is outside the
    /// window, which makes repeated ACKs idempotent.
    pub fn ack_cumulative(&mut self, seq: u16) -> Vec<SendSlot> {
        let span = self.slots.len() as u16;
        if !seq_in_window(seq, self.base, span) {
            return Vec::new();
        }
        let count = seq_distance(self.base, seq) as usize + 1;
        let retired: Vec<SendSlot> = self.slots.drain(..count).collect();
        self.base = self.base.wrapping_add(count as u16);
        retired
    }

    pub fn slot_mut(&mut self, seq: u16) -> Option<&mut SendSlot> {
        let span = self.slots.len() as u16;
        if !seq_in_window(seq, self.base, span) {
            return None;
        }
        let idx = seq_distance(self.base, seq) as usize;
        self.slots.get_mut(idx)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SendSlot> {
        self.slots.iter_mut()
    }
}

/// What the receive window did with an arriving sequenced frame, and which
/// acknowledgment the peer should see for it.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome<V> {
    /// The frame completed an in-order run; deliver these now.
    Delivered(Vec<(u16, V)>),
    /// Ahead of `receive_next` but inside the window; buffered.
    Buffered,
    /// Same as `Buffered`, but this sequence was already buffered; the
    /// stored copy is replaced with the latest arrival.
    BufferedDuplicate,
    /// Behind the window: already delivered, the peer missed our ACK.
    DuplicateBelow,
    /// Too far ahead; dropped.
    OutOfWindow,
}

/// Receiver half: buffers out-of-order arrivals in
/// `[receive_next, receive_next + W)` and releases strict in-order runs.
#[derive(Debug)]
pub struct RecvWindow<V> {
    next: u16,
    size: u16,
    buffered: HashMap<u16, V>,
}

impl<V> RecvWindow<V> {
    pub fn new(initial_sequence: u16, size: u16) -> Self {
        Self {
            next: initial_sequence,
            size,
            buffered: HashMap::new(),
        }
    }

    /// Next in-order sequence expected.
    pub fn next_sequence(&self) -> u16 {
        self.next
    }

    /// Re-base the window, discarding any buffered out-of-order state.
    /// Used when a handshake establishes the peer's sequence origin.
    pub fn rebase(&mut self, next: u16) {
        self.next = next;
        self.buffered.clear();
    }

    pub fn pending(&self) -> usize {
        self.buffered.len()
    }

    pub fn accept(&mut self, seq: u16, value: V) -> RecvOutcome<V> {
        if seq == self.next {
            let mut run = vec![(seq, value)];
            self.next = self.next.wrapping_add(1);
            while let Some(v) = self.buffered.remove(&self.next) {
                run.push((self.next, v));
                self.next = self.next.wrapping_add(1);
            }
            return RecvOutcome::Delivered(run);
        }
        if seq_in_window(seq, self.next, self.size) {
            return match self.buffered.insert(seq, value) {
                Some(_) => RecvOutcome::BufferedDuplicate,
                None => RecvOutcome::Buffered,
            };
        }
        // Behind the window means the payload was already delivered and the
        // peer is retransmitting because our ACK got lost. Anything else is
        // far ahead of the window and unusable.
        let behind = seq_distance(seq, self.next);
        if u32::from(behind) <= SEQ_SPACE / 2 {
            RecvOutcome::DuplicateBelow
        } else {
            RecvOutcome::OutOfWindow
        }
    }
}
