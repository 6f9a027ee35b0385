//! Treecast wire format: on-air types for everything a station says.
//!
//! These types ARE the protocol. Every message travels as a run of fixed
//! 32-byte packets (see `multipart`); the structs below are the reassembled
//! message bodies. Changing a field here breaks interoperability with every
//! station already on the air.
//!
//! All types are #[repr(C, packed)] with little-endian integers and use
//! zerocopy derives, so a message is its own send/receive buffer. There is
//! no unsafe code in this module.

use std::fmt;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LE, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Protocol limits ───────────────────────────────────────────────────────────

/// Current protocol version, carried in the first byte of every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of one packet on the air.
pub const PACKET_SIZE: usize = 32;

/// Multipart sub-header: sequence number (1 byte) + message id (2 bytes).
pub const PART_HEADER_SIZE: usize = 3;

/// Message bytes carried by one packet.
pub const PART_PAYLOAD_SIZE: usize = PACKET_SIZE - PART_HEADER_SIZE;

/// Largest chunk a station will send or accept. Only a file's final chunk may be shorter.
pub const MAX_CHUNK_SIZE: u32 = 384;

/// Deepest Merkle tree supported, i.e. the longest hash chain.
pub const MAX_TREE_DEPTH: u8 = 11;

/// Largest file that fits a tree of `MAX_TREE_DEPTH`.
pub const MAX_FILE_SIZE: u32 = (1 << MAX_TREE_DEPTH) * MAX_CHUNK_SIZE;

/// Longest filename (without the terminating NUL) a hash chain can carry.
pub const MAX_FILENAME_LENGTH: usize = 32;

/// Capacity of a `ChunkQueue`.
pub const CHUNK_QUEUE_LEN: usize = 8;

/// How long a transmitter listens for requests after a beacon, in milliseconds.
pub const LISTEN_DURATION_MS: u16 = 100;

/// Times each packet is put on the air. There are no acknowledgements.
pub const RETRANSMITS: u8 = 3;

/// Largest station id. Zero means "no station" in yield fields.
pub const MAX_STATION_ID: u16 = 0xffff;

/// A 32-byte digest (see `crypto::hash`).
pub type Hash = [u8; 32];

/// One packet as it goes on the air.
pub type Packet = [u8; PACKET_SIZE];

// ── Sequence bands ────────────────────────────────────────────────────────────

/// Transmitter is entering its request-listen window (beacon).
pub const SEQ_TAKING_REQS: u8 = 0;

/// Receiver is making a request during a listen window.
pub const SEQ_MAKING_REQ: u8 = 8;

/// First part of a hash chain.
pub const SEQ_CHAIN_START: u8 = 32;

/// Last sequence value reserved for the hash-chain band.
pub const SEQ_CHAIN_FINAL: u8 = SEQ_CHAIN_START + MAX_TREE_DEPTH - 1;

/// First part of a data chunk.
pub const SEQ_CHUNK_START: u8 = 64;

/// Message types, identified by the sequence number of their first part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Beacon,
    Request,
    HashChain,
    DataChunk,
}

impl MessageKind {
    /// Classify a packet by its leading sequence number. Only the exact
    /// start value of a band opens a message; continuation parts return None.
    pub fn from_start_seq(seq: u8) -> Option<Self> {
        match seq {
            SEQ_TAKING_REQS => Some(Self::Beacon),
            SEQ_MAKING_REQ => Some(Self::Request),
            SEQ_CHAIN_START => Some(Self::HashChain),
            SEQ_CHUNK_START => Some(Self::DataChunk),
            _ => None,
        }
    }

    pub fn start_seq(self) -> u8 {
        match self {
            Self::Beacon => SEQ_TAKING_REQS,
            Self::Request => SEQ_MAKING_REQ,
            Self::HashChain => SEQ_CHAIN_START,
            Self::DataChunk => SEQ_CHUNK_START,
        }
    }

    /// Smallest valid `message_length` for this kind.
    pub fn min_len(self) -> usize {
        match self {
            Self::Beacon => std::mem::size_of::<ListenForReqMessage>(),
            Self::Request => std::mem::size_of::<ReqMessage>(),
            Self::HashChain => HashChainMessage::HEADER_LEN,
            Self::DataChunk => DataChunkMessage::HEADER_LEN,
        }
    }

    /// Largest valid `message_length` for this kind.
    pub fn max_len(self) -> usize {
        match self {
            Self::Beacon => std::mem::size_of::<ListenForReqMessage>(),
            Self::Request => std::mem::size_of::<ReqMessage>(),
            Self::HashChain => std::mem::size_of::<HashChainMessage>(),
            Self::DataChunk => std::mem::size_of::<DataChunkMessage>(),
        }
    }
}

// ── Packet headers ────────────────────────────────────────────────────────────

/// The multipart sub-header at the front of every packet.
///
/// Wire size: 3 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PartHeader {
    pub seq: u8,
    pub message_id: U16<LE>,
}

assert_eq_size!(PartHeader, [u8; 3]);

/// View of the first packet of a message: the sub-header followed by the
/// common message prefix (protocol version and total message length).
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StartPart {
    pub seq: u8,
    pub message_id: U16<LE>,
    pub version: u8,
    pub message_length: U32<LE>,
}

assert_eq_size!(StartPart, [u8; 8]);

impl StartPart {
    pub fn parse(packet: &Packet) -> Option<Self> {
        Self::read_from_prefix(&packet[..])
    }

    /// Check version and declared length against the bounds of `kind`.
    /// Returns the message length on success.
    pub fn validate(&self, kind: MessageKind) -> Result<usize, WireError> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        let len = self.message_length.get() as usize;
        if len < kind.min_len() || len > kind.max_len() {
            return Err(WireError::Length { kind, len });
        }
        Ok(len)
    }
}

// ── Hash chain ────────────────────────────────────────────────────────────────

/// Fixed portion of a hash-chain message.
///
/// Wire size: 115 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HashChainHeader {
    pub version: u8,
    /// Length of the whole message including this header, in bytes.
    pub message_length: U32<LE>,
    /// Index of the chunk this chain describes.
    pub chunk: U16<LE>,
    pub num_chunks: U16<LE>,
    /// Tree depth, which is also the number of entries in `chain`.
    pub tree_depth: u8,
    /// Chunk size in bytes. Only the last chunk may be smaller.
    pub chunk_size: U32<LE>,
    pub file_size: U32<LE>,
    pub chunk_hash: Hash,
    pub root_hash: Hash,
    /// NUL-terminated; byte `MAX_FILENAME_LENGTH` must always be NUL.
    pub filename: [u8; MAX_FILENAME_LENGTH + 1],
}

assert_eq_size!(HashChainHeader, [u8; 115]);

/// A chunk's hash plus the sibling hashes that connect it to the root.
///
/// `chain[0]` is the leaf's sibling, `chain[tree_depth - 1]` the root's
/// child on the other side. Only the first `tree_depth` entries are sent.
///
/// Wire size: up to 467 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HashChainMessage {
    pub header: HashChainHeader,
    pub chain: [Hash; MAX_TREE_DEPTH as usize],
}

assert_eq_size!(HashChainMessage, [u8; 467]);

impl HashChainMessage {
    pub const HEADER_LEN: usize = std::mem::size_of::<HashChainHeader>();

    /// On-air length of a chain message for a tree of `tree_depth`.
    pub fn wire_len(tree_depth: u8) -> usize {
        Self::HEADER_LEN + 32 * usize::from(tree_depth)
    }

    pub fn chunk(&self) -> u16 {
        self.header.chunk.get()
    }

    pub fn num_chunks(&self) -> u16 {
        self.header.num_chunks.get()
    }

    pub fn tree_depth(&self) -> u8 {
        self.header.tree_depth
    }

    pub fn chunk_size(&self) -> u32 {
        self.header.chunk_size.get()
    }

    pub fn file_size(&self) -> u32 {
        self.header.file_size.get()
    }

    pub fn root_hash(&self) -> Hash {
        self.header.root_hash
    }

    /// Bytes of this message that go on the air.
    pub fn wire_bytes(&self) -> &[u8] {
        let len = (self.header.message_length.get() as usize).min(std::mem::size_of::<Self>());
        &self.as_bytes()[..len]
    }

    /// The filename up to its terminating NUL, if it is valid UTF-8.
    pub fn filename(&self) -> Option<&str> {
        let raw = &self.header.filename;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end]).ok()
    }

    pub fn set_filename(&mut self, name: &str) -> Result<(), WireError> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FILENAME_LENGTH {
            return Err(WireError::FilenameTooLong(bytes.len()));
        }
        self.header.filename = [0u8; MAX_FILENAME_LENGTH + 1];
        self.header.filename[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn clear_filename(&mut self) {
        self.header.filename = [0u8; MAX_FILENAME_LENGTH + 1];
    }

    /// True if the filename is NUL-terminated, non-empty, and made only of
    /// characters legal on the station's storage.
    pub fn filename_is_legal(&self) -> bool {
        let raw = &self.header.filename;
        if raw[MAX_FILENAME_LENGTH] != 0 {
            return false;
        }
        let name = raw.iter().take_while(|&&b| b != 0);
        let mut len = 0;
        for &c in name {
            if !legal_filename_char(c) {
                return false;
            }
            len += 1;
        }
        len > 0
    }
}

/// Characters a FAT long filename may contain.
pub fn legal_filename_char(c: u8) -> bool {
    if matches!(c, b'/' | b'\\' | b'"' | b'*' | b':' | b'<' | b'>' | b'?' | b'|') {
        return false;
    }
    (0x20..0x7f).contains(&c)
}

// ── Data chunk ────────────────────────────────────────────────────────────────

/// Fixed portion of a data-chunk message.
///
/// Wire size: 43 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataChunkHeader {
    pub version: u8,
    pub message_length: U32<LE>,
    pub chunk: U16<LE>,
    pub root_hash: Hash,
    /// Bytes of `data` in use.
    pub chunk_size: U32<LE>,
}

assert_eq_size!(DataChunkHeader, [u8; 43]);

/// One chunk of file content.
///
/// Wire size: up to 427 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataChunkMessage {
    pub header: DataChunkHeader,
    pub data: [u8; MAX_CHUNK_SIZE as usize],
}

assert_eq_size!(DataChunkMessage, [u8; 427]);

impl DataChunkMessage {
    pub const HEADER_LEN: usize = std::mem::size_of::<DataChunkHeader>();

    pub fn chunk(&self) -> u16 {
        self.header.chunk.get()
    }

    pub fn chunk_size(&self) -> u32 {
        self.header.chunk_size.get()
    }

    /// The chunk bytes. Clamped to the buffer if the declared size is oversized.
    pub fn payload(&self) -> &[u8] {
        let len = (self.chunk_size() as usize).min(self.data.len());
        &self.data[..len]
    }

    pub fn wire_bytes(&self) -> &[u8] {
        let len = (self.header.message_length.get() as usize).min(std::mem::size_of::<Self>());
        &self.as_bytes()[..len]
    }
}

// ── Chunk queue ───────────────────────────────────────────────────────────────

/// Bounded, order-preserving, duplicate-free list of chunk indices.
///
/// Used both for "chunks I am missing" and "chunks to (re)transmit".
/// Embedded verbatim in beacons and requests.
///
/// Wire size: 17 bytes.
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkQueue {
    len: u8,
    reqs: [U16<LE>; CHUNK_QUEUE_LEN],
}

assert_eq_size!(ChunkQueue, [u8; 17]);

impl ChunkQueue {
    pub fn new() -> Self {
        Self::new_zeroed()
    }

    pub fn len(&self) -> usize {
        usize::from(self.len).min(CHUNK_QUEUE_LEN)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= CHUNK_QUEUE_LEN
    }

    /// Add `chunk` unless already present. Returns false only if the queue is full.
    pub fn push(&mut self, chunk: u16) -> bool {
        if self.contains(chunk) {
            return true;
        }
        if self.is_full() {
            return false;
        }
        let n = self.len();
        self.reqs[n] = U16::new(chunk);
        self.len += 1;
        true
    }

    /// Merge every index of `other`, stopping at the first overflow.
    pub fn push_all(&mut self, other: &ChunkQueue) -> bool {
        other.iter().all(|chunk| self.push(chunk))
    }

    /// Remove and return the most recently added index.
    pub fn pop(&mut self) -> Option<u16> {
        if self.is_empty() {
            return None;
        }
        self.len -= 1;
        Some(self.reqs[usize::from(self.len)].get())
    }

    /// Remove `chunk` if present, keeping the order of the rest.
    pub fn remove(&mut self, chunk: u16) {
        let n = self.len();
        if let Some(i) = self.reqs[..n].iter().position(|r| r.get() == chunk) {
            self.reqs.copy_within(i + 1..n, i);
            self.len -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn contains(&self, chunk: u16) -> bool {
        self.iter().any(|c| c == chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.reqs[..self.len()].iter().map(|r| r.get())
    }

    /// Sanity-check a queue received off the air. An impossible length
    /// empties the queue and fails.
    pub fn verify(&mut self) -> bool {
        if usize::from(self.len) > CHUNK_QUEUE_LEN {
            self.len = 0;
            return false;
        }
        true
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// ── Beacon and request ────────────────────────────────────────────────────────

/// Broadcast by the transmitter as it opens a request-listen window.
///
/// Wire size: 58 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ListenForReqMessage {
    pub version: u8,
    pub message_length: U32<LE>,
    pub root_hash: Hash,
    /// Length of the listen window in milliseconds. Zero when offering a yield.
    pub listen_duration: U16<LE>,
    /// Chunks the transmitter is missing. A listener holding any of them
    /// asks for the channel.
    pub missing: ChunkQueue,
    /// Zero, or the id of the station the channel is being yielded to.
    pub yield_to_rx_id: U16<LE>,
}

assert_eq_size!(ListenForReqMessage, [u8; 58]);

impl ListenForReqMessage {
    pub fn new(root_hash: Hash, missing: &ChunkQueue, listen_duration: u16, yield_to: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_length: U32::new(std::mem::size_of::<Self>() as u32),
            root_hash,
            listen_duration: U16::new(listen_duration),
            missing: *missing,
            yield_to_rx_id: U16::new(yield_to),
        }
    }
}

/// Sent by a receiver during a listen window.
///
/// Wire size: 56 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ReqMessage {
    pub version: u8,
    pub message_length: U32<LE>,
    pub root_hash: Hash,
    /// Chunks the receiver wants (re)sent.
    pub wanted: ChunkQueue,
    /// Zero, or the id of the station asking to take over the channel.
    pub yield_request: U16<LE>,
}

assert_eq_size!(ReqMessage, [u8; 56]);

impl ReqMessage {
    pub fn new(root_hash: Hash, wanted: &ChunkQueue, yield_request: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_length: U32::new(std::mem::size_of::<Self>() as u32),
            root_hash,
            wanted: *wanted,
            yield_request: U16::new(yield_request),
        }
    }

    /// True if this is a well-formed request.
    pub fn verify(&mut self) -> bool {
        self.version == PROTOCOL_VERSION && self.wanted.verify()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    #[error("message length {len} out of bounds for {kind:?}")]
    Length { kind: MessageKind, len: usize },

    #[error("filename of {0} bytes exceeds the 32-byte limit")]
    FilenameTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
