//! Typed client for the kernel block-device mapper.
//!
//! The mapper stacks named virtual block devices out of tables of targets;
//! snapslot only ever uses three target types: `linear` passthroughs,
//! `snapshot` copy-on-write overlays, and `snapshot-merge` (the same overlay
//! actively draining back onto its base).
//!
//! Layout follows the trait-plus-backends pattern:
//! - [`traits::Mapper`] is the seam the rest of the engine programs against,
//! - [`kernel::DevMapper`] speaks `DM_*` ioctls to `/dev/mapper/control`,
//! - [`memory::MemMapper`] is a faithful in-memory double for tests.

pub mod kernel;
pub mod memory;
pub mod target;
pub mod traits;

pub use kernel::DevMapper;
pub use memory::MemMapper;
pub use target::{
    parse_snapshot_params, DeviceState, DmTable, DmTarget, SnapshotMode, SnapshotStatus,
    TargetLine, TargetSpec,
};
pub use traits::Mapper;
