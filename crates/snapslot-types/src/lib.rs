//! Shared vocabulary for the snapslot engine: the global and per-snapshot
//! state tokens, the persisted snapshot record codec, and the cancellation
//! token threaded through long-running polls.

pub mod cancel;
pub mod record;
pub mod state;

pub use cancel::CancelToken;
pub use record::SnapshotRecord;
pub use state::{SnapshotState, UpdateState};

/// Size of a disk sector in bytes. Every persisted size field is a multiple
/// of this.
pub const SECTOR_SIZE: u64 = 512;

/// Chunk size passed to snapshot targets, in sectors (4 KiB).
pub const SNAPSHOT_CHUNK_SECTORS: u32 = 8;
