//! Treecast integration test harness.
//!
//! Every scenario runs several stations as threads in one process, joined
//! by an in-process loopback radio. Nothing here needs hardware or root.
//!
//!   cargo test --test integration
//!
//! Each test builds its own `Ether` and its own storage directories, so
//! tests can run in parallel.

use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context as _, Result};

use treecast_core::config::{FaultPolicy, SessionConfig};
use treecast_services::{
    Context, DirStorage, Radio, Session, SessionError, Storage, StorageFile, Transmitter,
    TxOutcome,
};

mod channel;
mod handoff;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A storage directory removed when dropped.
pub struct TempStorage(DirStorage);

impl TempStorage {
    pub fn new(tag: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "treecast-it-{tag}-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        Self(DirStorage::new(&dir).expect("create temp storage"))
    }
}

impl Deref for TempStorage {
    type Target = DirStorage;

    fn deref(&self) -> &DirStorage {
        &self.0
    }
}

impl Drop for TempStorage {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.0.root());
    }
}

/// Deterministic file content that differs from chunk to chunk.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8)
        .collect()
}

pub fn write_file(storage: &DirStorage, name: &str, data: &[u8]) -> Result<()> {
    let mut f = storage
        .create(name)
        .with_context(|| format!("create {name}"))?;
    f.write_all(data)?;
    f.sync()?;
    Ok(())
}

pub fn read_file(storage: &DirStorage, name: &str) -> Result<Vec<u8>> {
    let mut f = storage.open(name).with_context(|| format!("open {name}"))?;
    let mut data = Vec::new();
    f.read_to_end(&mut data)?;
    Ok(data)
}

/// Overwrite `len` bytes at `offset` with garbage.
pub fn corrupt(storage: &DirStorage, name: &str, offset: u64, len: usize) -> Result<()> {
    let mut f = storage.open(name)?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(&vec![0xa5; len])?;
    f.sync()?;
    Ok(())
}

/// Session settings that keep scenarios short.
pub fn quick_config() -> SessionConfig {
    SessionConfig {
        rx_timeout_ms: 3_000,
        fault_policy: FaultPolicy::Strict,
        ..SessionConfig::default()
    }
}

/// Broadcast `name` pass after pass until `ctx` is cancelled. Returns the
/// number of finished passes.
pub fn transmit_until_cancelled<R: Radio>(
    radio: &mut R,
    storage: &DirStorage,
    name: &str,
    ctx: Context,
    config: SessionConfig,
) -> Result<u32, SessionError> {
    let session = Session::with_file(radio, storage, name, ctx, config)?;
    let mut tx = Transmitter::new(session)?;
    let mut passes = 0;
    loop {
        match tx.broadcast() {
            Ok(TxOutcome::Finished) => passes += 1,
            Ok(TxOutcome::Yielded) | Err(SessionError::Cancelled) => return Ok(passes),
            Err(e) => return Err(e),
        }
    }
}
