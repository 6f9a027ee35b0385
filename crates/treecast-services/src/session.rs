//! State shared by the receiver and the transmitter.
//!
//! A `Session` owns one station's view of one file on one channel: the
//! radio, the open tree and data file, and the queue of chunks the station
//! is still missing. `Receiver` and `Transmitter` drive it.

use std::io::{self, Seek, SeekFrom, Write};
use std::time::{Duration, Instant};

use zerocopy::byteorder::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use treecast_core::config::SessionConfig;
use treecast_core::multipart::{self, Combiner, MultipartError, Splitter};
use treecast_core::wire::{
    ChunkQueue, DataChunkMessage, Hash, MessageKind, Packet, StartPart, MAX_CHUNK_SIZE,
    PROTOCOL_VERSION, RETRANSMITS,
};

use crate::context::Context;
use crate::merkle::{Geometry, MerkleStore, StoreError};
use crate::naming;
use crate::radio::Radio;
use crate::storage::{read_full, Storage, StorageFile};

/// Carrier-sense dwell per interference sample.
pub const INTERFERENCE_DWELL: Duration = Duration::from_millis(10);

/// More carriers than this in one interference check means the channel is busy.
pub const INTERFERENCE_THRESHOLD: u32 = 3;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a session ended without its normal outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no packet received before the timeout")]
    Timeout,

    #[error("channel busy: carrier on {carriers} samples")]
    Interference { carriers: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("refusing to send or receive tree file {0}")]
    RefuseTree(String),

    #[error("no file is bound to this session")]
    Unbound,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("data file {op} failed: {kind}")]
    Io { op: &'static str, kind: io::ErrorKind },
}

impl SessionError {
    fn io(op: &'static str, err: &io::Error) -> Self {
        Self::Io {
            op,
            kind: err.kind(),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session<'a, R: Radio, S: Storage> {
    pub(crate) radio: &'a mut R,
    pub(crate) storage: &'a S,
    pub(crate) tree: Option<MerkleStore<S::File>>,
    pub(crate) data: Option<S::File>,
    pub(crate) filename: String,
    pub(crate) missing: ChunkQueue,
    pub(crate) last_scanned: u16,
    pub(crate) ctx: Context,
    pub(crate) config: SessionConfig,
}

impl<'a, R: Radio, S: Storage> Session<'a, R, S> {
    /// A session not yet tied to any file. A receiver binds it to the
    /// first file it hears a valid hash chain for.
    pub fn new(radio: &'a mut R, storage: &'a S, ctx: Context, config: SessionConfig) -> Self {
        radio.open_broadcast();
        Self {
            radio,
            storage,
            tree: None,
            data: None,
            filename: String::new(),
            missing: ChunkQueue::new(),
            last_scanned: 0,
            ctx,
            config,
        }
    }

    /// A session for the existing file `name`. Its tree is opened, or built
    /// from the file's contents.
    pub fn with_file(
        radio: &'a mut R,
        storage: &'a S,
        name: &str,
        ctx: Context,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        if naming::is_tree_name(name) {
            return Err(SessionError::RefuseTree(name.to_string()));
        }
        let mut data = storage.open(name).map_err(|e| SessionError::io("open", &e))?;
        let tree = MerkleStore::open_local(
            storage,
            &naming::tree_name(name),
            &mut data,
            config.fault_policy,
        )?;
        tracing::debug!(
            file = name,
            root = %hex::encode(tree.root_hash()),
            chunks = tree.geometry().num_chunks,
            "opened file"
        );
        let mut session = Self::new(radio, storage, ctx, config);
        session.tree = Some(tree);
        session.data = Some(data);
        session.filename = name.to_string();
        Ok(session)
    }

    pub fn is_bound(&self) -> bool {
        self.tree.is_some()
    }

    /// Name of the bound data file. Empty while unbound.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn root_hash(&self) -> Option<Hash> {
        self.tree.as_ref().map(|t| t.root_hash())
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.tree.as_ref().map(|t| t.geometry())
    }

    pub fn tree_mut(&mut self) -> Option<&mut MerkleStore<S::File>> {
        self.tree.as_mut()
    }

    /// Chunks this station knows it is missing.
    pub fn missing(&self) -> &ChunkQueue {
        &self.missing
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn tree(&mut self) -> Result<&mut MerkleStore<S::File>, SessionError> {
        self.tree.as_mut().ok_or(SessionError::Unbound)
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.ctx.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ── Chunk I/O ────────────────────────────────────────────────────────────

    /// Read chunk `chunk` of the data file into a ready-to-send message.
    /// A chunk starting at or past the end of the file is empty.
    pub fn load_chunk(&mut self, chunk: u16) -> Result<DataChunkMessage, SessionError> {
        let tree = self.tree.as_ref().ok_or(SessionError::Unbound)?;
        let (geometry, root_hash) = (tree.geometry(), tree.root_hash());
        let data = self.data.as_mut().ok_or(SessionError::Unbound)?;

        let chunk_size = geometry.chunk_size.min(MAX_CHUNK_SIZE) as usize;
        let offset = u64::from(chunk) * chunk_size as u64;
        let file_len = data.len().map_err(|e| SessionError::io("stat", &e))?;

        let mut msg = DataChunkMessage::new_zeroed();
        let size = if offset >= file_len {
            0
        } else {
            data.seek(SeekFrom::Start(offset))
                .map_err(|e| SessionError::io("seek", &e))?;
            let n = read_full(data, &mut msg.data[..chunk_size])
                .map_err(|e| SessionError::io("read", &e))?;
            if n == 0 {
                return Err(SessionError::Io {
                    op: "read",
                    kind: io::ErrorKind::UnexpectedEof,
                });
            }
            n
        };
        msg.header.version = PROTOCOL_VERSION;
        msg.header.message_length = U32::new((DataChunkMessage::HEADER_LEN + size) as u32);
        msg.header.chunk = U16::new(chunk);
        msg.header.root_hash = root_hash;
        msg.header.chunk_size = U32::new(size as u32);
        Ok(msg)
    }

    /// Write a chunk into the data file at its offset and flush.
    pub fn save_chunk(&mut self, msg: &DataChunkMessage) -> Result<(), SessionError> {
        let geometry = self.tree.as_ref().ok_or(SessionError::Unbound)?.geometry();
        let data = self.data.as_mut().ok_or(SessionError::Unbound)?;
        let offset = u64::from(msg.chunk()) * u64::from(geometry.chunk_size);
        data.seek(SeekFrom::Start(offset))
            .map_err(|e| SessionError::io("seek", &e))?;
        data.write_all(msg.payload())
            .map_err(|e| SessionError::io("write", &e))?;
        data.sync().map_err(|e| SessionError::io("sync", &e))
    }

    // ── Packet I/O ───────────────────────────────────────────────────────────

    /// Send `message` as multipart packets starting at `seq`, each part
    /// repeated `RETRANSMITS` times.
    pub fn broadcast(&mut self, message: &[u8], seq: u8) {
        let message_id = multipart::random_message_id();
        for part in Splitter::new(message, seq, message_id) {
            self.radio.transmit(&part, RETRANSMITS);
        }
    }

    /// Wait up to `timeout` for one packet.
    pub fn receive_packet(&mut self, timeout: Duration) -> Result<Packet, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout);
            }
            let slice = deadline.min(now + Context::POLL);
            if let Some(packet) = self.radio.receive_until(slice) {
                return Ok(packet);
            }
        }
    }

    /// Feed `first` and then received packets to `combiner` until the
    /// message is whole. A receive timeout aborts the combiner.
    pub fn receive_multipart(
        &mut self,
        combiner: &mut Combiner<'_>,
        first: &Packet,
        timeout: Duration,
    ) -> Result<(), MultipartError> {
        combiner.put(first)?;
        while combiner.more() {
            match self.receive_packet(timeout) {
                Ok(packet) => {
                    combiner.put(&packet)?;
                }
                Err(SessionError::Cancelled) => {
                    combiner.abort(MultipartError::Cancelled);
                    return Err(MultipartError::Cancelled);
                }
                Err(_) => {
                    combiner.abort(MultipartError::Timeout);
                    return Err(MultipartError::Timeout);
                }
            }
        }
        Ok(())
    }

    /// Reassemble the message of `kind` that `first` starts. Malformed or
    /// incomplete messages are dropped and yield None.
    pub fn receive_message<T>(
        &mut self,
        first: &Packet,
        kind: MessageKind,
        timeout: Duration,
    ) -> Result<Option<T>, SessionError>
    where
        T: AsBytes + FromBytes + FromZeroes,
    {
        let Some(start) = StartPart::parse(first) else {
            return Ok(None);
        };
        let len = match start.validate(kind) {
            Ok(len) => len.min(std::mem::size_of::<T>()),
            Err(e) => {
                tracing::debug!(error = %e, "dropping message");
                return Ok(None);
            }
        };
        let mut msg = T::new_zeroed();
        let received = {
            let mut combiner = Combiner::new(&mut msg.as_bytes_mut()[..len], kind.start_seq());
            self.receive_multipart(&mut combiner, first, timeout)
        };
        match received {
            Ok(()) => Ok(Some(msg)),
            Err(MultipartError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) => {
                tracing::debug!(error = %e, ?kind, "dropping partial message");
                Ok(None)
            }
        }
    }

    /// Count carrier detections over `duration` in 10 ms samples. Packets
    /// heard while sensing are discarded.
    pub fn listen_for_interference(&mut self, duration: Duration) -> Result<u32, SessionError> {
        let samples = (duration.as_millis() / INTERFERENCE_DWELL.as_millis()).max(1);
        let mut carriers = 0;
        for _ in 0..samples {
            self.check_cancelled()?;
            self.radio.start_listening();
            let busy = self.radio.carrier_sense(INTERFERENCE_DWELL);
            self.radio.stop_listening();
            if busy {
                carriers += 1;
            }
            while self.radio.read().is_some() {
                tracing::trace!("flushed packet while sensing");
            }
        }
        Ok(carriers)
    }

    // ── Missing chunks ───────────────────────────────────────────────────────

    /// Spend up to the scan budget looking for incomplete chunks, resuming
    /// where the last scan stopped. Stops early when the missing queue fills.
    pub fn scan_missing_chunks(&mut self) -> Result<(), SessionError> {
        let Some(tree) = self.tree.as_mut() else {
            return Ok(());
        };
        let num_chunks = tree.geometry().num_chunks;
        let deadline = Instant::now() + Duration::from_millis(self.config.scan_budget_ms);
        if self.last_scanned >= num_chunks {
            self.last_scanned = 0;
        }
        for _ in 0..num_chunks {
            if Instant::now() > deadline {
                return Ok(());
            }
            if !tree.chunk_complete(self.last_scanned)? && !self.missing.push(self.last_scanned) {
                return Ok(());
            }
            self.last_scanned = (self.last_scanned + 1) % num_chunks;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
