//! Persistent Merkle tree over a file's chunks.
//!
//! The tree lives in its own file as fixed 34-byte records:
//!
//!   record 0          header (sizes, counts, depth)
//!   record n + 1      node n (flags, hash)
//!
//! Nodes are laid out layer by layer, leaves first. Layer k starts at
//!   offset(k) = num_leafs + num_leafs/2 + ... + num_leafs/2^(k-1)
//! and the root is node `num_nodes - 1`. Interior node i has children
//! 2*(i - num_leafs) and 2*(i - num_leafs) + 1.
//!
//! Leaves past the last real chunk are padding: their hash is the hash of
//! no bytes and they are always complete.
//!
//! Any I/O or structural error latches a fault on the store. A faulted
//! store refuses every further read and write until `reset`. Under
//! `FaultPolicy::Strict` the fault panics instead.

use std::io::{self, SeekFrom};

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LE, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use treecast_core::config::FaultPolicy;
use treecast_core::crypto;
use treecast_core::wire::{
    DataChunkMessage, Hash, HashChainMessage, MAX_CHUNK_SIZE, MAX_FILE_SIZE, MAX_TREE_DEPTH,
    PROTOCOL_VERSION,
};

use crate::storage::{read_full, Storage, StorageFile};

/// The node's hash is known.
pub const HASH_KNOWN: u8 = 1 << 0;
/// The node's chunk (or every chunk under it) is present and verified.
pub const CHUNK_COMPLETE: u8 = 1 << 1;

const RECORD_SIZE: usize = 34;
const RECORD_INVALID: u8 = 0;
const RECORD_HEADER: u8 = 1;
const RECORD_NODE: u8 = 2;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct HeaderRecord {
    kind: u8,
    file_size: U32<LE>,
    chunk_size: U32<LE>,
    num_chunks: U16<LE>,
    num_leafs: U16<LE>,
    num_nodes: U16<LE>,
    tree_depth: u8,
    _reserved: [u8; 18],
}

assert_eq_size!(HeaderRecord, [u8; RECORD_SIZE]);

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct NodeRecord {
    kind: u8,
    flags: u8,
    hash: Hash,
}

assert_eq_size!(NodeRecord, [u8; RECORD_SIZE]);

impl NodeRecord {
    fn new(flags: u8, hash: Hash) -> Self {
        Self {
            kind: RECORD_NODE,
            flags,
            hash,
        }
    }

    fn known(&self) -> bool {
        self.flags & HASH_KNOWN != 0
    }

    fn complete(&self) -> bool {
        self.flags & CHUNK_COMPLETE != 0
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Shape of a tree, as stored in its header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub file_size: u32,
    pub chunk_size: u32,
    pub num_chunks: u16,
    pub num_leafs: u16,
    pub num_nodes: u16,
    pub tree_depth: u8,
}

impl Geometry {
    /// Smallest depth whose leaf count covers `num_chunks`.
    pub fn depth_for(num_chunks: u16) -> u8 {
        let mut depth = 0;
        while (1u32 << depth) < u32::from(num_chunks) {
            depth += 1;
        }
        depth
    }

    /// Geometry for a file of `file_size` bytes cut into `chunk_size` chunks.
    pub fn for_file(file_size: u64, chunk_size: u32) -> Result<Self, StoreError> {
        if file_size == 0 || file_size > u64::from(MAX_FILE_SIZE) {
            return Err(StoreError::SourceSize(file_size));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(StoreError::InvalidHeader);
        }
        let num_chunks = (file_size - 1) / u64::from(chunk_size) + 1;
        let num_chunks =
            u16::try_from(num_chunks).map_err(|_| StoreError::SourceSize(file_size))?;
        let geometry = Self::with_depth(
            file_size as u32,
            chunk_size,
            num_chunks,
            Self::depth_for(num_chunks),
        );
        geometry.validate()?;
        Ok(geometry)
    }

    /// Geometry described by a hash chain's header.
    pub fn from_message(msg: &HashChainMessage) -> Result<Self, StoreError> {
        if msg.tree_depth() > MAX_TREE_DEPTH {
            return Err(StoreError::InvalidHeader);
        }
        let geometry = Self::with_depth(
            msg.file_size(),
            msg.chunk_size(),
            msg.num_chunks(),
            msg.tree_depth(),
        );
        geometry.validate()?;
        Ok(geometry)
    }

    fn with_depth(file_size: u32, chunk_size: u32, num_chunks: u16, tree_depth: u8) -> Self {
        let num_leafs = 1u16 << tree_depth;
        Self {
            file_size,
            chunk_size,
            num_chunks,
            num_leafs,
            num_nodes: 2 * num_leafs - 1,
            tree_depth,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        let ok = self.tree_depth <= MAX_TREE_DEPTH
            && self.num_leafs == 1 << self.tree_depth
            && self.num_nodes == 2 * self.num_leafs - 1
            && self.num_chunks >= 1
            && self.num_chunks <= self.num_leafs
            && self.chunk_size >= 1
            && self.chunk_size <= MAX_CHUNK_SIZE
            && self.file_size >= 1
            && self.file_size <= MAX_FILE_SIZE;
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidHeader)
        }
    }

    pub fn root(&self) -> u16 {
        self.num_nodes - 1
    }

    /// Index of the first node of `layer` (0 = leaves).
    pub fn layer_offset(&self, layer: u8) -> u16 {
        (0..layer).map(|k| self.num_leafs >> k).sum()
    }

    /// Byte length of `chunk`. Zero past the end of the file.
    pub fn chunk_len(&self, chunk: u16) -> u32 {
        let start = u64::from(chunk) * u64::from(self.chunk_size);
        let end = (start + u64::from(self.chunk_size)).min(u64::from(self.file_size));
        end.saturating_sub(start) as u32
    }

    fn header_record(&self) -> HeaderRecord {
        HeaderRecord {
            kind: RECORD_HEADER,
            file_size: U32::new(self.file_size),
            chunk_size: U32::new(self.chunk_size),
            num_chunks: U16::new(self.num_chunks),
            num_leafs: U16::new(self.num_leafs),
            num_nodes: U16::new(self.num_nodes),
            tree_depth: self.tree_depth,
            _reserved: [0; 18],
        }
    }

    fn from_header_record(rec: &HeaderRecord) -> Result<Self, StoreError> {
        if rec.kind != RECORD_HEADER {
            return Err(StoreError::InvalidHeader);
        }
        let geometry = Self {
            file_size: rec.file_size.get(),
            chunk_size: rec.chunk_size.get(),
            num_chunks: rec.num_chunks.get(),
            num_leafs: rec.num_leafs.get(),
            num_nodes: rec.num_nodes.get(),
            tree_depth: rec.tree_depth,
        };
        geometry.validate()?;
        Ok(geometry)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("tree header is missing or invalid")]
    InvalidHeader,

    #[error("record {index} has kind {found}, expected {expected}")]
    RecordKind { index: u16, expected: u8, found: u8 },

    #[error("tree root does not match the offered root")]
    RootMismatch,

    #[error("source file of {0} bytes is empty or too large")]
    SourceSize(u64),

    #[error("source file ended before chunk {0}")]
    SourceChunk(u16),

    #[error("node {0} is outside the tree")]
    NodeOutOfRange(u16),

    #[error("tree {op} failed: {kind}")]
    Io { op: &'static str, kind: io::ErrorKind },

    #[error("tree is locked by an earlier fault")]
    Locked,
}

impl StoreError {
    fn io(op: &'static str, err: &io::Error) -> Self {
        Self::Io {
            op,
            kind: err.kind(),
        }
    }
}

// ── Hash chains ───────────────────────────────────────────────────────────────

/// A received hash chain plus the outcome of verifying it.
#[derive(Debug, Clone)]
pub struct HashChain {
    pub message: HashChainMessage,
    verified: bool,
    levels: u8,
}

impl HashChain {
    pub fn new(message: HashChainMessage) -> Self {
        Self {
            message,
            verified: false,
            levels: 0,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Number of chain entries that verification walked before reaching a
    /// trusted hash. Only these entries are saved.
    pub fn levels(&self) -> u8 {
        self.levels
    }

    /// Verify a chain with no tree open: check every header field against
    /// protocol limits, then walk the full chain to the message's own root.
    pub fn verify_standalone(&mut self) -> bool {
        self.verified = false;
        let msg = &self.message;
        let depth = msg.tree_depth();
        if depth > MAX_TREE_DEPTH
            || msg.file_size() > MAX_FILE_SIZE
            || msg.chunk_size() > MAX_CHUNK_SIZE
            || u32::from(msg.num_chunks()) > 1 << depth
            || msg.chunk() >= msg.num_chunks()
        {
            return false;
        }
        if !msg.filename_is_legal() {
            tracing::debug!(filename = ?msg.filename(), "rejecting chain with illegal filename");
            return false;
        }
        let mut running = msg.header.chunk_hash;
        for level in 0..depth {
            running = chain_step(msg, level, &running);
        }
        self.verified = running == msg.header.root_hash;
        self.levels = depth;
        self.verified
    }
}

/// Hash `running` with the chain entry at `level`, ordered by the chunk index bit.
fn chain_step(msg: &HashChainMessage, level: u8, running: &Hash) -> Hash {
    let sibling = &msg.chain[usize::from(level)];
    if msg.chunk() & (1 << level) != 0 {
        crypto::hash_pair(sibling, running)
    } else {
        crypto::hash_pair(running, sibling)
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// An open tree file.
pub struct MerkleStore<F: StorageFile> {
    file: F,
    geometry: Geometry,
    root_hash: Hash,
    policy: FaultPolicy,
    fault: Option<StoreError>,
}

impl<F: StorageFile> MerkleStore<F> {
    /// Open tree `name` describing the local file `src`, building it from
    /// `src` if it is missing or its header is unreadable.
    pub fn open_local<S, D>(
        storage: &S,
        name: &str,
        src: &mut D,
        policy: FaultPolicy,
    ) -> Result<Self, StoreError>
    where
        S: Storage<File = F>,
        D: StorageFile,
    {
        if let Ok(mut file) = storage.open(name) {
            match read_header(&mut file) {
                Ok((geometry, root_hash)) => {
                    return Ok(Self::with_file(file, geometry, root_hash, policy));
                }
                Err(e) => tracing::warn!(tree = name, error = %e, "rebuilding unreadable tree"),
            }
        }
        let file = storage
            .create(name)
            .map_err(|e| StoreError::io("create", &e))?;
        Self::build(file, src, policy)
    }

    /// Open tree `name` for the file a received chain describes.
    ///
    /// An existing tree must have the chain's root. Otherwise a blank tree
    /// is created: only the root and the padding leaves are known.
    pub fn open_remote<S>(
        storage: &S,
        name: &str,
        msg: &HashChainMessage,
        policy: FaultPolicy,
    ) -> Result<Self, StoreError>
    where
        S: Storage<File = F>,
    {
        let root_hash = msg.root_hash();
        if let Ok(mut file) = storage.open(name) {
            if let Ok((geometry, existing)) = read_header(&mut file) {
                if existing != root_hash {
                    return Err(StoreError::RootMismatch);
                }
                return Ok(Self::with_file(file, geometry, root_hash, policy));
            }
        }

        let geometry = Geometry::from_message(msg)?;
        let file = storage
            .create(name)
            .map_err(|e| StoreError::io("create", &e))?;
        let mut store = Self::with_file(file, geometry, root_hash, policy);
        store.write_blank()?;
        store.set_hash(geometry.root(), &root_hash)?;
        store.seal_padding()?;
        store.fill()?;
        store.write_header()?;
        store.sync()?;
        tracing::debug!(
            tree = name,
            root = %hex::encode(root_hash),
            chunks = geometry.num_chunks,
            "created blank tree"
        );
        Ok(store)
    }

    fn with_file(file: F, geometry: Geometry, root_hash: Hash, policy: FaultPolicy) -> Self {
        Self {
            file,
            geometry,
            root_hash,
            policy,
            fault: None,
        }
    }

    fn build<D: StorageFile>(file: F, src: &mut D, policy: FaultPolicy) -> Result<Self, StoreError> {
        let size = src.len().map_err(|e| StoreError::io("stat", &e))?;
        let geometry = Geometry::for_file(size, MAX_CHUNK_SIZE)?;
        let mut store = Self::with_file(file, geometry, [0; 32], policy);
        store.write_blank()?;
        store.scan_chunks(src, true)?;
        store.fill()?;
        store.root_hash = store.read_node(geometry.root())?.hash;
        // Header goes last so an interrupted build reads as invalid.
        store.write_header()?;
        store.sync()?;
        tracing::debug!(
            root = %hex::encode(store.root_hash),
            chunks = geometry.num_chunks,
            depth = geometry.tree_depth,
            "built tree"
        );
        Ok(store)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn root_hash(&self) -> Hash {
        self.root_hash
    }

    /// The latched fault, if any.
    pub fn fault(&self) -> Option<&StoreError> {
        self.fault.as_ref()
    }

    /// Clear a latched fault and allow access again.
    pub fn reset(&mut self) {
        self.fault = None;
    }

    /// True once every chunk is complete.
    pub fn is_complete(&mut self) -> Result<bool, StoreError> {
        Ok(self.read_node(self.geometry.root())?.complete())
    }

    /// Raw flags of node `n`.
    pub fn flags(&mut self, n: u16) -> Result<u8, StoreError> {
        Ok(self.read_node(n)?.flags)
    }

    /// Hash of node `n`, if known.
    pub fn hash(&mut self, n: u16) -> Result<Option<Hash>, StoreError> {
        let node = self.read_node(n)?;
        Ok(node.known().then_some(node.hash))
    }

    pub fn hash_known(&mut self, n: u16) -> Result<bool, StoreError> {
        Ok(self.read_node(n)?.known())
    }

    pub fn set_hash(&mut self, n: u16, hash: &Hash) -> Result<(), StoreError> {
        let mut node = self.read_node(n)?;
        node.hash = *hash;
        node.flags |= HASH_KNOWN;
        self.write_node(n, &node)
    }

    pub fn chunk_complete(&mut self, n: u16) -> Result<bool, StoreError> {
        Ok(self.read_node(n)?.complete())
    }

    /// Mark leaf `chunk` complete, then every ancestor whose other subtree
    /// is complete too, stopping at the first that is not. A real chunk
    /// whose hash is still unknown is left untouched.
    pub fn set_chunk_complete(&mut self, chunk: u16) -> Result<(), StoreError> {
        let g = self.geometry;
        if chunk >= g.num_leafs {
            return Err(StoreError::NodeOutOfRange(chunk));
        }
        let mut node = self.read_node(chunk)?;
        if node.complete() {
            return Ok(());
        }
        if chunk < g.num_chunks && !node.known() {
            tracing::debug!(chunk, "not completing chunk with unknown hash");
            return Ok(());
        }
        let mut n = chunk;
        let mut pos = chunk;
        let mut j = 0u16;
        for level in 0..g.tree_depth {
            node.flags |= CHUNK_COMPLETE;
            self.write_node(n, &node)?;
            if !self.chunk_complete(n ^ 1)? {
                return Ok(());
            }
            j += g.num_leafs >> level;
            pos >>= 1;
            n = j + pos;
            node = self.read_node(n)?;
        }
        // n is the root, which has no sibling.
        node.flags |= CHUNK_COMPLETE;
        self.write_node(n, &node)
    }

    /// Hash chain for `chunk`: its hash, the root, and every sibling on the
    /// way up. The filename is left empty.
    pub fn load(&mut self, chunk: u16) -> Result<HashChainMessage, StoreError> {
        let g = self.geometry;
        if chunk >= g.num_leafs {
            return Err(StoreError::NodeOutOfRange(chunk));
        }
        let mut msg = HashChainMessage::new_zeroed();
        msg.header.version = PROTOCOL_VERSION;
        msg.header.message_length = U32::new(HashChainMessage::wire_len(g.tree_depth) as u32);
        msg.header.chunk = U16::new(chunk);
        msg.header.num_chunks = U16::new(g.num_chunks);
        msg.header.tree_depth = g.tree_depth;
        msg.header.chunk_size = U32::new(g.chunk_size);
        msg.header.file_size = U32::new(g.file_size);
        msg.header.root_hash = self.root_hash;
        msg.header.chunk_hash = self.read_node(chunk)?.hash;

        let mut j = 0u16;
        for level in 0..g.tree_depth {
            let sibling = (j + (chunk >> level)) ^ 1;
            msg.chain[usize::from(level)] = self.read_node(sibling)?.hash;
            j += g.num_leafs >> level;
        }
        Ok(msg)
    }

    /// Verify a chain against this tree.
    ///
    /// The header must match the tree. The walk stops at the first ancestor
    /// whose hash is already known and compares against it.
    pub fn verify_chain(&mut self, chain: &mut HashChain) -> Result<bool, StoreError> {
        chain.verified = false;
        let g = self.geometry;
        let msg = &chain.message;
        if msg.file_size() != g.file_size
            || msg.chunk_size() != g.chunk_size
            || msg.tree_depth() != g.tree_depth
            || msg.num_chunks() != g.num_chunks
            || msg.chunk() >= g.num_chunks
            || msg.header.root_hash != self.root_hash
        {
            return Ok(false);
        }
        chain.message.clear_filename();

        let msg = &chain.message;
        let chunk = msg.chunk();
        let mut running = msg.header.chunk_hash;
        let mut j = 0u16;
        for level in 0..g.tree_depth {
            running = chain_step(msg, level, &running);
            j += g.num_leafs >> level;
            let ancestor = self.read_node(j + (chunk >> (level + 1)))?;
            if ancestor.known() {
                chain.verified = ancestor.hash == running;
                chain.levels = level + 1;
                return Ok(chain.verified);
            }
        }
        chain.verified = running == self.root_hash;
        chain.levels = g.tree_depth;
        Ok(chain.verified)
    }

    /// Store a verified chain's hashes. Returns false if nothing was written.
    ///
    /// Stops at the first sibling already known. An unverified chain is a
    /// caller bug: it is refused, logged, and panics under the strict policy.
    pub fn save(&mut self, chain: &HashChain) -> Result<bool, StoreError> {
        let chunk = chain.message.chunk();
        if !chain.verified {
            tracing::error!(chunk, "refusing to save an unverified hash chain");
            if self.policy == FaultPolicy::Strict {
                panic!("unverified hash chain for chunk {chunk} passed to save");
            }
            return Ok(false);
        }
        if self.hash_known(chunk)? {
            tracing::trace!(chunk, "hash chain already saved");
            return Ok(false);
        }
        self.set_hash(chunk, &chain.message.header.chunk_hash)?;

        let mut j = 0u16;
        for level in 0..chain.levels {
            let sibling = (j + (chunk >> level)) ^ 1;
            if self.hash_known(sibling)? {
                break;
            }
            self.set_hash(sibling, &chain.message.chain[usize::from(level)])?;
            j += self.geometry.num_leafs >> level;
        }
        self.sync()?;
        tracing::trace!(chunk, levels = chain.levels, "hash chain saved");
        Ok(true)
    }

    /// True if the chunk's bytes hash to its known leaf hash. False if the
    /// header does not fit this tree or the hash is not yet known.
    pub fn verify_chunk(&mut self, msg: &DataChunkMessage) -> Result<bool, StoreError> {
        let chunk = msg.chunk();
        if msg.chunk_size() > MAX_CHUNK_SIZE || chunk >= self.geometry.num_leafs {
            return Ok(false);
        }
        if msg.header.root_hash != self.root_hash {
            return Ok(false);
        }
        let node = self.read_node(chunk)?;
        if !node.known() {
            return Ok(false);
        }
        Ok(crypto::hash(msg.payload()) == node.hash)
    }

    /// Recompute completeness from the data file `src`: every complete flag
    /// is cleared, then chunks whose bytes match their stored hash are marked again.
    pub fn check<D: StorageFile>(&mut self, src: &mut D) -> Result<(), StoreError> {
        for n in 0..self.geometry.num_nodes {
            let mut node = self.read_node(n)?;
            node.flags &= !CHUNK_COMPLETE;
            self.write_node(n, &node)?;
        }
        self.scan_chunks(src, false)?;
        self.sync()
    }

    /// Fill in every unknown interior hash whose two children are known.
    pub fn fill(&mut self) -> Result<(), StoreError> {
        let g = self.geometry;
        let padding = NodeRecord::new(HASH_KNOWN | CHUNK_COMPLETE, crypto::empty_hash());
        for n in g.num_chunks..g.num_leafs {
            self.write_node(n, &padding)?;
        }
        for n in g.num_leafs..g.num_nodes {
            let mut node = self.read_node(n)?;
            if node.known() {
                continue;
            }
            let left = 2 * (n - g.num_leafs);
            let l = self.read_node(left)?;
            if !l.known() {
                continue;
            }
            let r = self.read_node(left + 1)?;
            if !r.known() {
                continue;
            }
            node.hash = crypto::hash_pair(&l.hash, &r.hash);
            node.flags |= HASH_KNOWN;
            self.write_node(n, &node)?;
        }
        self.sync()
    }

    /// Flush the tree file.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.guard()?;
        if let Err(e) = self.file.sync() {
            return Err(self.latch(StoreError::io("sync", &e)));
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Hash each real chunk of `src`. With `write_hashes` the hashes are
    /// stored and the chunk marked complete; otherwise a chunk is marked
    /// complete only if its hash matches the stored one.
    fn scan_chunks<D: StorageFile>(&mut self, src: &mut D, write_hashes: bool) -> Result<(), StoreError> {
        let g = self.geometry;
        // Padding stays complete even if the source turns out short.
        self.seal_padding()?;
        if let Err(e) = src.seek(SeekFrom::Start(0)) {
            return Err(self.latch(StoreError::io("seek source", &e)));
        }
        let mut buf = vec![0u8; g.chunk_size as usize];
        for chunk in 0..g.num_chunks {
            let len = match read_full(src, &mut buf) {
                Ok(0) => return Err(self.latch(StoreError::SourceChunk(chunk))),
                Ok(len) => len,
                Err(e) => return Err(self.latch(StoreError::io("read source", &e))),
            };
            let hash = crypto::hash(&buf[..len]);
            let matches = if write_hashes {
                self.write_node(chunk, &NodeRecord::new(HASH_KNOWN, hash))?;
                true
            } else {
                let node = self.read_node(chunk)?;
                node.known() && node.hash == hash
            };
            if matches {
                self.set_chunk_complete(chunk)?;
            }
        }
        Ok(())
    }

    /// Give each padding leaf the empty hash and mark it complete.
    fn seal_padding(&mut self) -> Result<(), StoreError> {
        let g = self.geometry;
        let empty = NodeRecord::new(HASH_KNOWN, crypto::empty_hash());
        for n in g.num_chunks..g.num_leafs {
            self.write_node(n, &empty)?;
            self.set_chunk_complete(n)?;
        }
        Ok(())
    }

    /// Invalid header followed by zeroed node records.
    fn write_blank(&mut self) -> Result<(), StoreError> {
        let mut header = HeaderRecord::new_zeroed();
        header.kind = RECORD_INVALID;
        self.write_record(0, header.as_bytes())?;
        let blank = NodeRecord::new(0, [0; 32]);
        for n in 0..self.geometry.num_nodes {
            self.write_node(n, &blank)?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), StoreError> {
        let header = self.geometry.header_record();
        self.write_record(0, header.as_bytes())
    }

    fn read_node(&mut self, n: u16) -> Result<NodeRecord, StoreError> {
        if n >= self.geometry.num_nodes {
            return Err(StoreError::NodeOutOfRange(n));
        }
        let mut node = NodeRecord::new_zeroed();
        self.read_record(n + 1, node.as_bytes_mut())?;
        if node.kind != RECORD_NODE {
            return Err(self.latch(StoreError::RecordKind {
                index: n + 1,
                expected: RECORD_NODE,
                found: node.kind,
            }));
        }
        Ok(node)
    }

    fn write_node(&mut self, n: u16, node: &NodeRecord) -> Result<(), StoreError> {
        if n >= self.geometry.num_nodes {
            return Err(StoreError::NodeOutOfRange(n));
        }
        self.write_record(n + 1, node.as_bytes())
    }

    fn read_record(&mut self, index: u16, buf: &mut [u8]) -> Result<(), StoreError> {
        self.guard()?;
        if let Err(e) = self.file.seek(SeekFrom::Start(record_offset(index))) {
            return Err(self.latch(StoreError::io("seek", &e)));
        }
        if let Err(e) = self.file.read_exact(buf) {
            return Err(self.latch(StoreError::io("read", &e)));
        }
        Ok(())
    }

    fn write_record(&mut self, index: u16, buf: &[u8]) -> Result<(), StoreError> {
        self.guard()?;
        if let Err(e) = self.file.seek(SeekFrom::Start(record_offset(index))) {
            return Err(self.latch(StoreError::io("seek", &e)));
        }
        if let Err(e) = self.file.write_all(buf) {
            return Err(self.latch(StoreError::io("write", &e)));
        }
        Ok(())
    }

    fn guard(&self) -> Result<(), StoreError> {
        match self.fault {
            Some(_) => Err(StoreError::Locked),
            None => Ok(()),
        }
    }

    fn latch(&mut self, err: StoreError) -> StoreError {
        tracing::error!(error = %err, root = %hex::encode(self.root_hash), "tree fault");
        if self.policy == FaultPolicy::Strict {
            panic!("tree fault: {err}");
        }
        self.fault = Some(err.clone());
        err
    }
}

fn record_offset(index: u16) -> u64 {
    u64::from(index) * RECORD_SIZE as u64
}

/// Geometry and root hash of an existing tree file, without opening it as a store.
pub fn read_header<F: StorageFile>(file: &mut F) -> Result<(Geometry, Hash), StoreError> {
    let mut header = HeaderRecord::new_zeroed();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(header.as_bytes_mut()))
        .map_err(|_| StoreError::InvalidHeader)?;
    let geometry = Geometry::from_header_record(&header)?;

    let mut root = NodeRecord::new_zeroed();
    file.seek(SeekFrom::Start(record_offset(geometry.num_nodes)))
        .and_then(|_| file.read_exact(root.as_bytes_mut()))
        .map_err(|_| StoreError::InvalidHeader)?;
    if root.kind != RECORD_NODE {
        return Err(StoreError::InvalidHeader);
    }
    Ok((geometry, root.hash))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DirStorage;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::fs::File;
    use std::io::{Seek, Write};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_storage() -> DirStorage {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir =
            std::env::temp_dir().join(format!("treecast-merkle-test-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        DirStorage::new(&dir).unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + i / 7) as u8).collect()
    }

    fn write_file(storage: &DirStorage, name: &str, data: &[u8]) -> File {
        let mut f = storage.create(name).unwrap();
        f.write_all(data).unwrap();
        f.sync().unwrap();
        f
    }

    fn local_tree(storage: &DirStorage, data: &[u8]) -> MerkleStore<File> {
        let mut src = write_file(storage, "DATA.BIN", data);
        MerkleStore::open_local(storage, "DATA.mkl", &mut src, FaultPolicy::Strict).unwrap()
    }

    fn data_message(store: &MerkleStore<File>, data: &[u8], chunk: u16) -> DataChunkMessage {
        let g = store.geometry();
        let start = chunk as usize * g.chunk_size as usize;
        let len = g.chunk_len(chunk) as usize;
        let mut msg = DataChunkMessage::new_zeroed();
        msg.header.chunk = U16::new(chunk);
        msg.header.root_hash = store.root_hash();
        msg.header.chunk_size = U32::new(len as u32);
        msg.data[..len].copy_from_slice(&data[start..start + len]);
        msg
    }

    fn named_chain(store: &mut MerkleStore<File>, chunk: u16) -> HashChain {
        let mut msg = store.load(chunk).unwrap();
        msg.set_filename("DATA.BIN").unwrap();
        HashChain::new(msg)
    }

    #[test]
    fn depth_covers_every_chunk_count() {
        for c in 1u16..=2048 {
            let g = Geometry::for_file(u64::from(c) * 384, 384).unwrap();
            let d = g.tree_depth;
            assert_eq!(g.num_chunks, c);
            assert_eq!(g.num_leafs, 1 << d);
            if d == 0 {
                assert_eq!(c, 1);
            } else {
                assert!((1u32 << (d - 1)) < u32::from(c) && u32::from(c) <= 1 << d, "c={c}");
            }
            assert_eq!(g.num_nodes, 2 * g.num_leafs - 1);
        }
    }

    #[test]
    fn geometry_limits() {
        assert_eq!(Geometry::for_file(0, 384), Err(StoreError::SourceSize(0)));
        let too_big = u64::from(MAX_FILE_SIZE) + 1;
        assert_eq!(Geometry::for_file(too_big, 384), Err(StoreError::SourceSize(too_big)));
        assert!(Geometry::for_file(u64::from(MAX_FILE_SIZE), 384).is_ok());

        let g = Geometry::for_file(1000, 384).unwrap();
        assert_eq!(g.layer_offset(0), 0);
        assert_eq!(g.layer_offset(1), 4);
        assert_eq!(g.layer_offset(2), 6);
        assert_eq!(g.root(), 6);
        assert_eq!(g.chunk_len(0), 384);
        assert_eq!(g.chunk_len(2), 232);
        assert_eq!(g.chunk_len(3), 0);
    }

    #[test]
    fn thousand_byte_file() {
        let storage = temp_storage();
        let data = content(1000);
        let mut tree = local_tree(&storage, &data);
        let g = tree.geometry();
        assert_eq!((g.num_chunks, g.tree_depth, g.num_leafs), (3, 2, 4));
        assert!(tree.is_complete().unwrap());
        assert_eq!(tree.hash(3).unwrap(), Some(crypto::empty_hash()));

        let leaves: Vec<Hash> = (0..3)
            .map(|c| crypto::hash(&data[c * 384..((c + 1) * 384).min(1000)]))
            .collect();
        let left = crypto::hash_pair(&leaves[0], &leaves[1]);
        let right = crypto::hash_pair(&leaves[2], &crypto::empty_hash());
        assert_eq!(tree.root_hash(), crypto::hash_pair(&left, &right));

        let remote_storage = temp_storage();
        let msg = tree.load(0).unwrap();
        let mut remote =
            MerkleStore::<File>::open_remote(&remote_storage, "R.mkl", &msg, FaultPolicy::Strict)
                .unwrap();
        assert!(remote.chunk_complete(3).unwrap(), "padding leaf complete with no data");
        assert!(!remote.chunk_complete(0).unwrap());
        assert!(!remote.is_complete().unwrap());
        assert_eq!(remote.hash(remote.geometry().root()).unwrap(), Some(tree.root_hash()));

        let _ = std::fs::remove_dir_all(storage.root());
        let _ = std::fs::remove_dir_all(remote_storage.root());
    }

    #[test]
    fn completeness_reaches_root_only_at_the_end() {
        let mut rng = StdRng::seed_from_u64(7);
        for c in [1usize, 2, 3, 5, 8, 13] {
            let storage = temp_storage();
            let mut local = local_tree(&storage, &content(c * 384 - 10));
            let msg = local.load(0).unwrap();
            let mut remote =
                MerkleStore::<File>::open_remote(&storage, "R.mkl", &msg, FaultPolicy::Strict)
                    .unwrap();

            let mut order: Vec<u16> = (0..c as u16).collect();
            order.shuffle(&mut rng);
            for (i, &chunk) in order.iter().enumerate() {
                assert!(!remote.is_complete().unwrap(), "c={c} early after {i}");
                let hash = local.hash(chunk).unwrap().unwrap();
                remote.set_hash(chunk, &hash).unwrap();
                remote.set_chunk_complete(chunk).unwrap();
                remote.set_chunk_complete(chunk).unwrap();
            }
            assert!(remote.is_complete().unwrap(), "c={c}");
            let _ = std::fs::remove_dir_all(storage.root());
        }
    }

    #[test]
    fn every_chain_verifies_and_transfers() {
        let storage = temp_storage();
        let data = content(5 * 384 + 17);
        let mut local = local_tree(&storage, &data);
        let n = local.geometry().num_chunks;

        let mut first = named_chain(&mut local, 0);
        assert!(first.verify_standalone());
        assert_eq!(first.levels(), 3);
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &first.message, FaultPolicy::Strict)
                .unwrap();

        for chunk in 0..n {
            let mut chain = named_chain(&mut local, chunk);
            assert!(remote.verify_chain(&mut chain).unwrap(), "chunk {chunk}");
            assert_eq!(chain.message.filename(), Some(""), "filename cleared");
            remote.save(&chain).unwrap();

            let msg = data_message(&local, &data, chunk);
            assert!(remote.verify_chunk(&msg).unwrap());
            remote.set_chunk_complete(chunk).unwrap();
        }
        assert!(remote.is_complete().unwrap());
        remote.fill().unwrap();
        for node in 0..local.geometry().num_nodes {
            assert_eq!(remote.hash(node).unwrap(), local.hash(node).unwrap(), "node {node}");
        }
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn verification_stops_at_known_ancestor() {
        let storage = temp_storage();
        let mut local = local_tree(&storage, &content(8 * 384));
        let mut first = named_chain(&mut local, 0);
        assert!(first.verify_standalone());
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &first.message, FaultPolicy::Strict)
                .unwrap();
        assert!(remote.save(&first).unwrap());

        // Chunk 2's parent was saved as chunk 0's first-layer sibling.
        let mut chain = named_chain(&mut local, 2);
        assert!(remote.verify_chain(&mut chain).unwrap());
        assert_eq!(chain.levels(), 1);

        let mut chain = named_chain(&mut local, 7);
        assert!(remote.verify_chain(&mut chain).unwrap());
        assert_eq!(chain.levels(), 2);

        // Chunk 0's own ancestors are never stored, only their siblings.
        let mut chain = named_chain(&mut local, 1);
        assert!(remote.verify_chain(&mut chain).unwrap());
        assert_eq!(chain.levels(), 3);
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn save_is_idempotent() {
        let storage = temp_storage();
        let mut local = local_tree(&storage, &content(3000));
        let mut chain = named_chain(&mut local, 2);
        assert!(chain.verify_standalone());
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &chain.message, FaultPolicy::Lenient)
                .unwrap();
        assert!(remote.save(&chain).unwrap());
        assert!(!remote.save(&chain).unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn unverified_save_is_refused() {
        let storage = temp_storage();
        let mut local = local_tree(&storage, &content(3000));
        let chain = named_chain(&mut local, 2);
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &chain.message, FaultPolicy::Lenient)
                .unwrap();
        assert!(!remote.save(&chain).unwrap());
        assert!(!remote.hash_known(2).unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn tampered_chunks_are_rejected() {
        let storage = temp_storage();
        let data = content(6 * 384 - 100);
        let mut tree = local_tree(&storage, &data);
        for chunk in 0..tree.geometry().num_chunks {
            let good = data_message(&tree, &data, chunk);
            assert!(tree.verify_chunk(&good).unwrap());
            for bit in [0usize, 13, 8 * 100 + 3] {
                let mut bad = good;
                let len = bad.chunk_size() as usize;
                let byte = (bit / 8) % len;
                bad.data[byte] ^= 1 << (bit % 8);
                assert!(!tree.verify_chunk(&bad).unwrap(), "chunk {chunk} bit {bit}");
            }
        }
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn tampered_chain_is_rejected() {
        let storage = temp_storage();
        let mut local = local_tree(&storage, &content(4 * 384));
        let mut chain = named_chain(&mut local, 1);
        chain.message.chain[0][0] ^= 0x80;
        assert!(!chain.verify_standalone());
        assert!(!local.verify_chain(&mut chain).unwrap());

        let mut chain = named_chain(&mut local, 1);
        chain.message.set_filename("bad|name").unwrap();
        assert!(!chain.verify_standalone());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn remote_open_rejects_other_root() {
        let storage = temp_storage();
        let mut a = local_tree(&storage, &content(2000));
        let msg = a.load(0).unwrap();
        MerkleStore::<File>::open_remote(&storage, "R.mkl", &msg, FaultPolicy::Strict).unwrap();

        let mut other = msg;
        other.header.root_hash[0] ^= 1;
        let err = MerkleStore::<File>::open_remote(&storage, "R.mkl", &other, FaultPolicy::Strict)
            .err()
            .unwrap();
        assert_eq!(err, StoreError::RootMismatch);
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn reopen_keeps_existing_tree() {
        let storage = temp_storage();
        let data = content(2000);
        let root = local_tree(&storage, &data).root_hash();

        // A different source is ignored when a valid tree already exists.
        let mut src = write_file(&storage, "OTHER.BIN", &content(10));
        let tree =
            MerkleStore::<File>::open_local(&storage, "DATA.mkl", &mut src, FaultPolicy::Strict)
                .unwrap();
        assert_eq!(tree.root_hash(), root);
        assert_eq!(tree.geometry().num_chunks, 6);
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn empty_source_is_refused() {
        let storage = temp_storage();
        let mut src = write_file(&storage, "EMPTY.BIN", &[]);
        let err = MerkleStore::<File>::open_local(&storage, "E.mkl", &mut src, FaultPolicy::Strict)
            .err()
            .unwrap();
        assert_eq!(err, StoreError::SourceSize(0));
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn check_finds_corrupt_chunks() {
        let storage = temp_storage();
        let data = content(1000);
        let mut tree = local_tree(&storage, &data);

        let mut src = storage.open("DATA.BIN").unwrap();
        src.seek(SeekFrom::Start(400)).unwrap();
        src.write_all(b"garbage").unwrap();
        tree.check(&mut src).unwrap();

        assert!(tree.chunk_complete(0).unwrap());
        assert!(!tree.chunk_complete(1).unwrap());
        assert!(tree.chunk_complete(2).unwrap());
        assert!(tree.chunk_complete(3).unwrap(), "padding stays complete");
        assert!(!tree.is_complete().unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn fill_recovers_interior_hashes() {
        let storage = temp_storage();
        let mut local = local_tree(&storage, &content(7 * 384));
        let first = local.load(0).unwrap();
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &first, FaultPolicy::Strict).unwrap();
        for chunk in 0..7 {
            let hash = local.hash(chunk).unwrap().unwrap();
            remote.set_hash(chunk, &hash).unwrap();
        }
        remote.fill().unwrap();
        for node in 0..local.geometry().num_nodes {
            assert_eq!(remote.hash(node).unwrap(), local.hash(node).unwrap(), "node {node}");
        }
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn corrupt_record_latches_fault() {
        let storage = temp_storage();
        let data = content(1000);
        let mut src = write_file(&storage, "DATA.BIN", &data);
        let mut tree =
            MerkleStore::<File>::open_local(&storage, "DATA.mkl", &mut src, FaultPolicy::Lenient)
                .unwrap();

        let mut raw = storage.open("DATA.mkl").unwrap();
        raw.seek(SeekFrom::Start(record_offset(2))).unwrap();
        raw.write_all(&[RECORD_HEADER]).unwrap();
        raw.sync().unwrap();

        assert!(tree.hash_known(0).unwrap());
        assert_eq!(
            tree.hash_known(1),
            Err(StoreError::RecordKind { index: 2, expected: RECORD_NODE, found: RECORD_HEADER })
        );
        assert!(tree.fault().is_some());
        assert_eq!(tree.hash_known(0), Err(StoreError::Locked));

        tree.reset();
        assert!(tree.hash_known(0).unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn check_on_truncated_source_latches_fault() {
        let storage = temp_storage();
        let data = content(1000);
        let mut src = write_file(&storage, "DATA.BIN", &data);
        let mut tree =
            MerkleStore::<File>::open_local(&storage, "DATA.mkl", &mut src, FaultPolicy::Lenient)
                .unwrap();
        let g = tree.geometry();
        assert_eq!((g.num_chunks, g.num_leafs), (3, 4));

        src.set_len(300).unwrap();
        assert_eq!(tree.check(&mut src), Err(StoreError::SourceChunk(1)));
        assert!(tree.fault().is_some());
        assert_eq!(tree.chunk_complete(3), Err(StoreError::Locked));

        tree.reset();
        assert!(tree.chunk_complete(3).unwrap());
        assert!(!tree.chunk_complete(0).unwrap());
        assert!(!tree.chunk_complete(2).unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    fn completion_requires_known_hash() {
        let storage = temp_storage();
        let data = content(1000);
        let mut local = local_tree(&storage, &data);
        let mut chain = named_chain(&mut local, 1);
        let mut remote =
            MerkleStore::<File>::open_remote(&storage, "R.mkl", &chain.message, FaultPolicy::Strict)
                .unwrap();

        remote.set_chunk_complete(2).unwrap();
        assert!(!remote.hash_known(2).unwrap());
        assert!(!remote.chunk_complete(2).unwrap());
        assert!(remote.chunk_complete(3).unwrap());

        assert!(remote.verify_chain(&mut chain).unwrap());
        remote.save(&chain).unwrap();
        remote.set_chunk_complete(1).unwrap();
        assert!(remote.chunk_complete(1).unwrap());
        let _ = std::fs::remove_dir_all(storage.root());
    }

    #[test]
    #[should_panic(expected = "tree fault")]
    fn strict_policy_panics_on_fault() {
        let storage = temp_storage();
        let mut tree = local_tree(&storage, &content(1000));
        let mut raw = storage.open("DATA.mkl").unwrap();
        raw.seek(SeekFrom::Start(record_offset(1))).unwrap();
        raw.write_all(&[RECORD_INVALID]).unwrap();
        raw.sync().unwrap();
        let _ = tree.hash_known(0);
    }
}
