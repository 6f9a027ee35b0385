//! treecast-services: everything that touches a radio or a disk.
//!
//! `merkle` keeps the per-file hash tree, `session` is the state a receiver
//! and a transmitter share, and `receiver` / `transmitter` drive one channel
//! session each. `radio` and `storage` are the seams to the platform;
//! `loopback` is an in-process radio for tests and simulations.

pub mod context;
pub mod loopback;
pub mod merkle;
pub mod naming;
pub mod radio;
pub mod receiver;
pub mod session;
pub mod storage;
pub mod transmitter;

pub use context::Context;
pub use merkle::{Geometry, HashChain, MerkleStore, StoreError};
pub use radio::Radio;
pub use receiver::{Receiver, RxOutcome, YieldState};
pub use session::{Session, SessionError};
pub use storage::{DirStorage, Storage, StorageFile};
pub use transmitter::{Transmitter, TxOutcome};
