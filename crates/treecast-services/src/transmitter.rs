//! Transmitting side of a session.
//!
//! One `broadcast` call is one pass over the file. For every chunk index
//! the transmitter first sends whatever has been requested, then announces
//! a short listen window with a beacon and collects requests. A receiver
//! holding chunks the transmitter lacks may ask for the channel; once far
//! enough into the pass the transmitter offers it, and the pass ends when
//! the receiver starts sending.

use std::time::{Duration, Instant};

use zerocopy::AsBytes;

use treecast_core::wire::{
    ChunkQueue, DataChunkMessage, ListenForReqMessage, MessageKind, ReqMessage, StartPart,
    LISTEN_DURATION_MS, SEQ_CHAIN_START, SEQ_CHUNK_START, SEQ_MAKING_REQ, SEQ_TAKING_REQS,
};

use crate::merkle::{CHUNK_COMPLETE, HASH_KNOWN};
use crate::radio::Radio;
use crate::session::{Session, SessionError, INTERFERENCE_THRESHOLD};
use crate::storage::Storage;

/// Channel check before the first packet of a pass.
const PRECHECK_WINDOW: Duration = Duration::from_secs(1);

/// Channel check after each chunk sent.
const CHUNK_CHECK_WINDOW: Duration = Duration::from_millis(100);

const LISTEN_WINDOW: Duration = Duration::from_millis(LISTEN_DURATION_MS as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The pass ran to the end, or nobody asked for anything for a while.
    Finished,
    /// Another station took over the channel.
    Yielded,
}

pub struct Transmitter<'a, R: Radio, S: Storage> {
    session: Session<'a, R, S>,
    /// Chunks to send before the next beacon.
    transmit: ChunkQueue,
    /// Station that asked for the channel, or zero.
    yield_to: u16,
    granted: bool,
    heard_request: bool,
}

impl<'a, R: Radio, S: Storage> Transmitter<'a, R, S> {
    /// Wrap a session bound to a file. A file with gaps gets an initial
    /// scan so the first beacon already advertises what is missing.
    pub fn new(mut session: Session<'a, R, S>) -> Result<Self, SessionError> {
        if !session.tree()?.is_complete()? {
            session.scan_missing_chunks()?;
        }
        Ok(Self {
            session,
            transmit: ChunkQueue::new(),
            yield_to: 0,
            granted: false,
            heard_request: false,
        })
    }

    /// True once any well-formed request for this file has arrived.
    pub fn heard_request(&self) -> bool {
        self.heard_request
    }

    pub fn session(&self) -> &Session<'a, R, S> {
        &self.session
    }

    pub fn into_session(self) -> Session<'a, R, S> {
        self.session
    }

    /// Run one pass over the file.
    pub fn broadcast(&mut self) -> Result<TxOutcome, SessionError> {
        self.check_channel(PRECHECK_WINDOW)?;
        self.session.radio.stop_listening();

        let tree = self.session.tree()?;
        let (num_chunks, root_hash) = (tree.geometry().num_chunks, tree.root_hash());
        tracing::info!(
            file = self.session.filename(),
            root = %hex::encode(&root_hash[..8]),
            chunks = num_chunks,
            channel = self.session.radio.channel(),
            "broadcast starting"
        );

        let mut since_heard = 0u32;
        for i in 0..num_chunks {
            self.drain(num_chunks)?;

            self.transmit.push(i);
            self.broadcast_beacon();
            if self.listen_for_requests()? {
                since_heard = 0;
                self.heard_request = true;
                if self.yield_to != 0 && !self.session.missing.is_empty() && i > num_chunks / 4 {
                    tracing::debug!(station = self.yield_to, chunk = i, "granting yield");
                    self.granted = true;
                }
            } else {
                since_heard += 1;
                if since_heard > self.session.config.idle_rounds {
                    tracing::info!(chunk = i, "no requests heard, stopping");
                    return Ok(TxOutcome::Finished);
                }
            }

            if !self.session.tree()?.is_complete()? {
                self.session.scan_missing_chunks()?;
            }

            if self.granted {
                if self.offer_yield()? {
                    tracing::info!(station = self.yield_to, "channel yielded");
                    return Ok(TxOutcome::Yielded);
                }
                tracing::debug!(station = self.yield_to, "yield not taken, resuming");
                self.granted = false;
                self.yield_to = 0;
            }
        }
        self.drain(num_chunks)?;
        tracing::info!(file = self.session.filename(), "broadcast finished");
        Ok(TxOutcome::Finished)
    }

    /// Send every queued chunk: its chain when the hash is known, and its
    /// data when the chunk is complete too. Chunks not fully held locally
    /// are noted as missing.
    fn drain(&mut self, num_chunks: u16) -> Result<(), SessionError> {
        while let Some(chunk) = self.transmit.pop() {
            self.session.check_cancelled()?;
            if chunk >= num_chunks {
                tracing::debug!(chunk, "ignoring request out of range");
                continue;
            }
            let flags = self.session.tree()?.flags(chunk)?;
            if flags != HASH_KNOWN | CHUNK_COMPLETE {
                self.session.missing.push(chunk);
            }
            if flags & HASH_KNOWN == 0 {
                continue;
            }
            self.broadcast_chain(chunk)?;
            if flags & CHUNK_COMPLETE != 0 {
                self.broadcast_data(chunk)?;
            }
            self.check_channel(CHUNK_CHECK_WINDOW)?;
        }
        Ok(())
    }

    fn check_channel(&mut self, window: Duration) -> Result<(), SessionError> {
        let carriers = self.session.listen_for_interference(window)?;
        if carriers > INTERFERENCE_THRESHOLD {
            tracing::warn!(carriers, "channel not quiet");
            return Err(SessionError::Interference { carriers });
        }
        Ok(())
    }

    fn broadcast_chain(&mut self, chunk: u16) -> Result<(), SessionError> {
        let mut msg = self.session.tree()?.load(chunk)?;
        if let Err(e) = msg.set_filename(&self.session.filename) {
            tracing::warn!(error = %e, "sending chain without filename");
        }
        tracing::trace!(chunk, "sending hash chain");
        self.session.broadcast(msg.wire_bytes(), SEQ_CHAIN_START);
        Ok(())
    }

    fn broadcast_data(&mut self, chunk: u16) -> Result<(), SessionError> {
        let msg: DataChunkMessage = self.session.load_chunk(chunk)?;
        tracing::trace!(chunk, size = msg.chunk_size(), "sending chunk");
        self.session.broadcast(msg.wire_bytes(), SEQ_CHUNK_START);
        Ok(())
    }

    /// Announce a listen window, or when the channel is granted, offer it
    /// to the requesting station.
    fn broadcast_beacon(&mut self) {
        let Some(root_hash) = self.session.root_hash() else {
            return;
        };
        let msg = if self.granted {
            ListenForReqMessage::new(root_hash, &self.session.missing, 0, self.yield_to)
        } else {
            ListenForReqMessage::new(root_hash, &self.session.missing, LISTEN_DURATION_MS, 0)
        };
        self.session.broadcast(msg.as_bytes(), SEQ_TAKING_REQS);
    }

    /// Collect requests for one listen window. Returns true if any valid
    /// request for this file arrived.
    fn listen_for_requests(&mut self) -> Result<bool, SessionError> {
        let root_hash = self.session.tree()?.root_hash();
        let deadline = Instant::now() + LISTEN_WINDOW;
        let mut heard = false;

        self.session.radio.start_listening();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let packet = match self.session.receive_packet(remaining) {
                Ok(packet) => packet,
                Err(SessionError::Timeout) => break,
                Err(e) => {
                    self.session.radio.stop_listening();
                    return Err(e);
                }
            };
            if packet[0] != SEQ_MAKING_REQ {
                continue;
            }
            let Some(mut msg) =
                self.session
                    .receive_message::<ReqMessage>(&packet, MessageKind::Request, remaining)?
            else {
                continue;
            };
            if !msg.verify() || msg.root_hash != root_hash {
                tracing::debug!("rejecting request");
                continue;
            }
            let yield_request = msg.yield_request.get();
            if yield_request != 0 {
                self.yield_to = yield_request;
            }
            tracing::debug!(wanted = ?msg.wanted, yield_request, "request received");
            self.transmit.push_all(&msg.wanted);
            heard = true;
        }
        self.session.radio.stop_listening();
        Ok(heard)
    }

    /// Offer the channel up to the configured number of times. Returns
    /// true once the new transmitter is heard starting a hash chain.
    fn offer_yield(&mut self) -> Result<bool, SessionError> {
        let window = Duration::from_millis(self.session.config.yield_listen_ms);
        for attempt in 0..self.session.config.yield_attempts {
            tracing::debug!(station = self.yield_to, attempt, "offering channel");
            self.broadcast_beacon();
            self.session.radio.start_listening();
            let deadline = Instant::now() + window;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match self.session.receive_packet(deadline - now) {
                    Ok(packet) => {
                        let started = StartPart::parse(&packet)
                            .is_some_and(|start| start.seq == SEQ_CHAIN_START);
                        if started {
                            self.session.radio.stop_listening();
                            return Ok(true);
                        }
                    }
                    Err(SessionError::Timeout) => break,
                    Err(e) => {
                        self.session.radio.stop_listening();
                        return Err(e);
                    }
                }
            }
            self.session.radio.stop_listening();
        }
        Ok(false)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
