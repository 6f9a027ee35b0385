//! Receiving side of a session.
//!
//! The receiver listens on its channel and classifies each packet by the
//! sequence number it starts with: hash chains, data chunks and request
//! beacons. Unbound receivers adopt the first file they hear a valid chain
//! for. When a transmitter is missing chunks this station holds, the
//! receiver asks for the channel and reports `ChannelGranted` once the
//! transmitter hands it over.

use std::time::Duration;

use rand::Rng;

use treecast_core::wire::{
    DataChunkMessage, HashChainMessage, ListenForReqMessage, MessageKind, Packet, ReqMessage,
    StartPart, MAX_STATION_ID, PART_HEADER_SIZE, PROTOCOL_VERSION, SEQ_MAKING_REQ,
};
use zerocopy::AsBytes;

use crate::merkle::{HashChain, MerkleStore};
use crate::naming;
use crate::radio::Radio;
use crate::session::{Session, SessionError};
use crate::storage::{self, Storage};

/// Packet offset of the chunk index in the first part of a hash chain:
/// the part header, then `version` and `message_length`.
const CHAIN_CHUNK_OFFSET: usize = PART_HEADER_SIZE + 5;

/// Where this station stands in negotiating for the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldState {
    #[default]
    None,
    /// The transmitter lacks a chunk we hold; ask for the channel.
    Request,
    /// The transmitter named us in a yield offer.
    Granted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Every chunk of the file is here and verified.
    Complete,
    /// The transmitter handed over the channel. Become a transmitter for
    /// the same file.
    ChannelGranted,
}

pub struct Receiver<'a, R: Radio, S: Storage> {
    session: Session<'a, R, S>,
    station_id: u16,
    yield_state: YieldState,
    /// Last beacon said the transmitter is missing chunks.
    tx_incomplete: bool,
    /// Consecutive requests sent with a yield request attached.
    yield_requests: u32,
}

impl<'a, R: Radio, S: Storage> Receiver<'a, R, S> {
    pub fn new(session: Session<'a, R, S>) -> Self {
        let station_id = session
            .config
            .station_id
            .filter(|&id| id != 0)
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_STATION_ID));
        Self {
            session,
            station_id,
            yield_state: YieldState::None,
            tx_incomplete: false,
            yield_requests: 0,
        }
    }

    pub fn station_id(&self) -> u16 {
        self.station_id
    }

    pub fn yield_state(&self) -> YieldState {
        self.yield_state
    }

    pub fn session(&self) -> &Session<'a, R, S> {
        &self.session
    }

    pub fn into_session(self) -> Session<'a, R, S> {
        self.session
    }

    /// Receive until the file is complete, the channel is granted, the
    /// channel goes quiet for the configured timeout, or the context is
    /// cancelled.
    pub fn listen(&mut self) -> Result<RxOutcome, SessionError> {
        let timeout = Duration::from_millis(self.session.config.rx_timeout_ms);
        tracing::info!(
            station = self.station_id,
            channel = self.session.radio.channel(),
            file = self.session.filename(),
            "receiver listening"
        );
        self.session.radio.start_listening();
        loop {
            let packet = self.session.receive_packet(timeout)?;
            self.dispatch(&packet, timeout)?;

            if self.yield_state == YieldState::Granted {
                tracing::info!(station = self.station_id, "channel granted");
                return Ok(RxOutcome::ChannelGranted);
            }
            if let Some(tree) = self.session.tree.as_mut() {
                if tree.is_complete()?
                    && (!self.tx_incomplete
                        || self.yield_requests > self.session.config.max_yield_requests)
                {
                    tracing::info!(
                        file = self.session.filename(),
                        yield_requests = self.yield_requests,
                        "file complete"
                    );
                    return Ok(RxOutcome::Complete);
                }
            }
        }
    }

    fn dispatch(&mut self, packet: &Packet, timeout: Duration) -> Result<(), SessionError> {
        let Some(start) = StartPart::parse(packet) else {
            return Ok(());
        };
        if start.version != PROTOCOL_VERSION {
            tracing::trace!(version = start.version, "ignoring packet");
            return Ok(());
        }
        match MessageKind::from_start_seq(start.seq) {
            Some(MessageKind::HashChain) => self.receive_chain(packet, timeout),
            Some(MessageKind::DataChunk) => self.receive_data(packet, timeout),
            Some(MessageKind::Beacon) => {
                let listen = self.receive_beacon(packet, timeout)?;
                if listen > 0 {
                    let delay = rand::thread_rng().gen_range(0..u64::from(listen));
                    if !self.session.ctx.sleep(Duration::from_millis(delay)) {
                        return Err(SessionError::Cancelled);
                    }
                    self.broadcast_requests();
                }
                Ok(())
            }
            _ => {
                tracing::trace!(seq = start.seq, "ignoring packet");
                Ok(())
            }
        }
    }

    // ── Hash chains ──────────────────────────────────────────────────────────

    fn receive_chain(&mut self, first: &Packet, timeout: Duration) -> Result<(), SessionError> {
        if let Some(tree) = self.session.tree.as_mut() {
            let chunk = u16::from_le_bytes([first[CHAIN_CHUNK_OFFSET], first[CHAIN_CHUNK_OFFSET + 1]]);
            if chunk >= tree.geometry().num_chunks {
                tracing::debug!(chunk, "chain for chunk out of range");
                return Ok(());
            }
            if tree.hash_known(chunk)? {
                // Nothing new in this chain. Use the air time to look for gaps.
                return self.session.scan_missing_chunks();
            }
            self.session.missing.push(chunk);
        }

        let Some(msg) =
            self.session
                .receive_message::<HashChainMessage>(first, MessageKind::HashChain, timeout)?
        else {
            return Ok(());
        };
        let chunk = msg.chunk();
        let mut chain = HashChain::new(msg);

        if self.session.is_bound() {
            if !self.session.tree()?.verify_chain(&mut chain)? {
                tracing::debug!(chunk, "rejecting hash chain");
                return Ok(());
            }
        } else {
            if !chain.verify_standalone() {
                tracing::debug!(chunk, "rejecting hash chain");
                return Ok(());
            }
            if !self.bind(&chain) {
                return Ok(());
            }
        }

        let tree = self.session.tree()?;
        if tree.save(&chain)? {
            tracing::debug!(chunk, levels = chain.levels(), "hash chain saved");
        }
        if !tree.chunk_complete(chunk)? {
            self.session.missing.push(chunk);
        }
        Ok(())
    }

    /// Adopt the file a verified chain describes: open or create its tree,
    /// then its data file. Returns false if either fails.
    fn bind(&mut self, chain: &HashChain) -> bool {
        let msg = &chain.message;
        let Some(name) = msg.filename().map(str::to_string) else {
            return false;
        };
        if naming::is_tree_name(&name) {
            tracing::debug!(file = %name, "ignoring tree file broadcast");
            return false;
        }
        let storage = self.session.storage;
        let tree = match MerkleStore::open_remote(
            storage,
            &naming::tree_name(&name),
            msg,
            self.session.config.fault_policy,
        ) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "cannot open tree");
                return false;
            }
        };
        let data = match storage.open(&name) {
            Ok(file) => file,
            Err(_) => match storage::create_zeroed(storage, &name, u64::from(msg.file_size())) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "cannot create data file");
                    return false;
                }
            },
        };
        tracing::info!(
            file = %name,
            root = %hex::encode(msg.root_hash()),
            chunks = msg.num_chunks(),
            "receiving file"
        );
        self.session.tree = Some(tree);
        self.session.data = Some(data);
        self.session.filename = name;
        true
    }

    // ── Data chunks ──────────────────────────────────────────────────────────

    fn receive_data(&mut self, first: &Packet, timeout: Duration) -> Result<(), SessionError> {
        if !self.session.is_bound() {
            return Ok(());
        }
        let Some(msg) =
            self.session
                .receive_message::<DataChunkMessage>(first, MessageKind::DataChunk, timeout)?
        else {
            return Ok(());
        };
        let chunk = msg.chunk();

        let tree = self.session.tree()?;
        if chunk >= tree.geometry().num_chunks {
            tracing::debug!(chunk, "chunk out of range");
            return Ok(());
        }
        if !tree.hash_known(chunk)? {
            tracing::debug!(chunk, "chunk hash not known yet");
            return Ok(());
        }
        if tree.chunk_complete(chunk)? {
            tracing::trace!(chunk, "duplicate chunk");
            self.session.missing.remove(chunk);
            return Ok(());
        }
        if !tree.verify_chunk(&msg)? {
            tracing::debug!(chunk, "rejecting chunk");
            return Ok(());
        }

        self.session.save_chunk(&msg)?;
        self.session.tree()?.set_chunk_complete(chunk)?;
        self.session.missing.remove(chunk);
        tracing::debug!(chunk, "chunk saved");
        Ok(())
    }

    // ── Beacons and requests ─────────────────────────────────────────────────

    /// Returns the beacon's listen window in milliseconds, zero if no
    /// request should be sent.
    fn receive_beacon(&mut self, first: &Packet, timeout: Duration) -> Result<u16, SessionError> {
        if !self.session.is_bound() {
            return Ok(0);
        }
        match self
            .session
            .receive_message::<ListenForReqMessage>(first, MessageKind::Beacon, timeout)?
        {
            Some(mut msg) => self.handle_beacon(&mut msg),
            None => Ok(0),
        }
    }

    /// Act on a complete beacon. Returns its listen window in milliseconds.
    ///
    /// A beacon naming this station grants it the channel. Otherwise the
    /// receiver decides whether to ask for the channel: it does so when the
    /// transmitter is missing a chunk this station has.
    pub fn handle_beacon(&mut self, msg: &mut ListenForReqMessage) -> Result<u16, SessionError> {
        let Some(tree) = self.session.tree.as_mut() else {
            return Ok(0);
        };
        if msg.root_hash != tree.root_hash() {
            tracing::trace!("beacon for another file");
            return Ok(0);
        }
        let listen = msg.listen_duration.get();
        if msg.yield_to_rx_id.get() == self.station_id {
            self.yield_state = YieldState::Granted;
            return Ok(listen);
        }

        self.yield_state = YieldState::None;
        if msg.missing.verify() {
            self.tx_incomplete = !msg.missing.is_empty();
            let num_chunks = tree.geometry().num_chunks;
            for chunk in msg.missing.iter() {
                if chunk >= num_chunks {
                    continue;
                }
                if tree.chunk_complete(chunk)? {
                    tracing::debug!(chunk, "transmitter lacks a chunk we hold");
                    self.yield_state = YieldState::Request;
                }
            }
        }
        Ok(listen)
    }

    /// Ask for the chunks we are missing, and for the channel if we want it.
    fn broadcast_requests(&mut self) {
        let Some(root_hash) = self.session.root_hash() else {
            return;
        };
        let wants_channel = self.yield_state == YieldState::Request;
        if self.session.missing.is_empty() && !wants_channel {
            return;
        }
        let yield_request = if wants_channel {
            self.yield_requests += 1;
            self.station_id
        } else {
            self.yield_requests = 0;
            0
        };
        let msg = ReqMessage::new(root_hash, &self.session.missing, yield_request);
        tracing::debug!(
            wanted = ?self.session.missing,
            yield_request,
            "sending request"
        );
        self.session.radio.stop_listening();
        self.session.broadcast(msg.as_bytes(), SEQ_MAKING_REQ);
        self.session.radio.start_listening();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
