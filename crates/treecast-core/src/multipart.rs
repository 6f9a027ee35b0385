//! Multipart framing over fixed 32-byte packets.
//!
//! A message longer than one packet is cut into parts. Each part carries a
//! sequence number and a message id followed by up to 29 message bytes.
//! Sequence numbers start at the message kind's band value and increase by
//! one per part, wrapping at 256. Every part goes on the air several times;
//! the combiner drops the repeats.

use zerocopy::byteorder::U16;
use zerocopy::AsBytes;

use crate::wire::{Packet, PartHeader, PACKET_SIZE, PART_HEADER_SIZE, PART_PAYLOAD_SIZE};

/// A fresh random message id.
pub fn random_message_id() -> u16 {
    rand::random()
}

/// Number of packets needed to carry `len` message bytes.
pub fn parts_for(len: usize) -> usize {
    len.div_ceil(PART_PAYLOAD_SIZE)
}

// ── Splitter ──────────────────────────────────────────────────────────────────

/// Cuts a message into packets. Iterate to get the parts in order.
pub struct Splitter<'a> {
    src: &'a [u8],
    seq: u8,
    message_id: u16,
    cursor: usize,
}

impl<'a> Splitter<'a> {
    pub fn new(src: &'a [u8], seq: u8, message_id: u16) -> Self {
        Self {
            src,
            seq,
            message_id,
            cursor: 0,
        }
    }

    /// True if there are more parts to emit.
    pub fn more(&self) -> bool {
        self.cursor < self.src.len()
    }
}

impl Iterator for Splitter<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if !self.more() {
            return None;
        }
        let mut packet = [0u8; PACKET_SIZE];
        let header = PartHeader {
            seq: self.seq,
            message_id: U16::new(self.message_id),
        };
        packet[..PART_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let take = (self.src.len() - self.cursor).min(PART_PAYLOAD_SIZE);
        packet[PART_HEADER_SIZE..PART_HEADER_SIZE + take]
            .copy_from_slice(&self.src[self.cursor..self.cursor + take]);

        self.seq = self.seq.wrapping_add(1);
        self.cursor += PART_PAYLOAD_SIZE;
        Some(packet)
    }
}

// ── Combiner ──────────────────────────────────────────────────────────────────

/// Why reassembly of a message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MultipartError {
    #[error("out-of-sequence part: expected {expected}, got {got}")]
    BadSequence { expected: u8, got: u8 },

    #[error("timed out waiting for the next part")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

/// Reassembles the parts emitted by a `Splitter` into `dst`.
///
/// The first accepted part binds the combiner to its message id; parts of
/// other messages are ignored. Any error is permanent for the instance.
pub struct Combiner<'a> {
    dst: &'a mut [u8],
    seq: u8,
    cursor: usize,
    message_id: Option<u16>,
    error: Option<MultipartError>,
}

impl<'a> Combiner<'a> {
    /// Combine into all of `dst`; its length is the expected message length.
    pub fn new(dst: &'a mut [u8], seq: u8) -> Self {
        Self {
            dst,
            seq,
            cursor: 0,
            message_id: None,
            error: None,
        }
    }

    /// True while parts are still expected and no error has occurred.
    pub fn more(&self) -> bool {
        self.error.is_none() && self.cursor < self.dst.len()
    }

    pub fn remaining(&self) -> usize {
        self.dst.len().saturating_sub(self.cursor)
    }

    pub fn error(&self) -> Option<MultipartError> {
        self.error
    }

    /// Stop combining with `err`. Later parts are refused.
    pub fn abort(&mut self, err: MultipartError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Feed one packet. Returns whether more parts are expected.
    pub fn put(&mut self, packet: &Packet) -> Result<bool, MultipartError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.more() {
            return Ok(false);
        }

        let seq = packet[0];
        if seq == self.seq.wrapping_sub(1) {
            // Repeat of the part just taken.
            return Ok(true);
        }
        if seq != self.seq {
            let err = MultipartError::BadSequence {
                expected: self.seq,
                got: seq,
            };
            self.error = Some(err);
            return Err(err);
        }

        let message_id = u16::from_le_bytes([packet[1], packet[2]]);
        match self.message_id {
            None => self.message_id = Some(message_id),
            Some(bound) if bound != message_id => return Ok(true),
            Some(_) => {}
        }

        let take = self.remaining().min(PART_PAYLOAD_SIZE);
        self.dst[self.cursor..self.cursor + take]
            .copy_from_slice(&packet[PART_HEADER_SIZE..PART_HEADER_SIZE + take]);
        self.seq = self.seq.wrapping_add(1);
        self.cursor += PART_PAYLOAD_SIZE;
        Ok(self.more())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
