//! treecast-core: wire format, multipart framing, hashing and configuration.
//! All other Treecast crates depend on this one.

pub mod config;
pub mod crypto;
pub mod multipart;
pub mod wire;

pub use config::{FaultPolicy, TreecastConfig};
pub use multipart::{Combiner, MultipartError, Splitter};
pub use wire::{ChunkQueue, Hash, MessageKind, Packet, WireError};
