//! The persisted per-snapshot record.
//!
//! One file per partition under `<metadata>/snapshots/<name>`, holding a
//! single line of seven space-separated fields:
//!
//! ```text
//! <state> <device_size> <snapshot_size> <cow_partition_size> <cow_file_size>
//!         <sectors_allocated> <metadata_sectors>
//! ```
//!
//! The decoder is strict: exactly seven fields, each numeric field a plain
//! decimal integer. The single concession is one optional trailing newline
//! (see DESIGN.md); trailing spaces, extra fields, or any other deviation
//! are rejected.

use snapslot_error::{Result, SnapError};

use crate::state::SnapshotState;
use crate::SECTOR_SIZE;

/// Sizing and progress for one snapshotted partition. All sizes are bytes
/// and must be sector-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRecord {
    pub state: SnapshotState,
    /// Total size of the partition in the target slot.
    pub device_size: u64,
    /// Leading bytes of the partition subject to copy-on-write. Zero means
    /// the partition fits in free superpartition space and is not
    /// snapshotted.
    pub snapshot_size: u64,
    /// Bytes of cow store reserved inside the superpartition.
    pub cow_partition_size: u64,
    /// Bytes of cow store held in an overflow image file.
    pub cow_file_size: u64,
    /// Snapshot progress counter, read back from the kernel while merging.
    pub sectors_allocated: u64,
    /// Snapshot target metadata counter.
    pub metadata_sectors: u64,
}

impl SnapshotRecord {
    /// Whether this partition is actually snapshotted. Records with
    /// `snapshot_size == 0` exist only as bookkeeping.
    #[must_use]
    pub const fn needs_snapshot(&self) -> bool {
        self.snapshot_size > 0
    }

    #[must_use]
    pub const fn cow_size(&self) -> u64 {
        self.cow_partition_size + self.cow_file_size
    }

    #[must_use]
    pub const fn snapshot_sectors(&self) -> u64 {
        self.snapshot_size / SECTOR_SIZE
    }

    #[must_use]
    pub const fn device_sectors(&self) -> u64 {
        self.device_size / SECTOR_SIZE
    }

    /// Sectors of the trailing region that is passed through to the base
    /// device untouched.
    #[must_use]
    pub const fn tail_sectors(&self) -> u64 {
        (self.device_size - self.snapshot_size) / SECTOR_SIZE
    }

    /// Check sector alignment of every size field and the cow/snapshot
    /// consistency invariant (`snapshot_size > 0 ⇔ cow store > 0`).
    pub fn validate(&self, name: &str) -> Result<()> {
        for (what, value) in [
            ("device size", self.device_size),
            ("snapshot size", self.snapshot_size),
            ("cow partition size", self.cow_partition_size),
            ("cow file size", self.cow_file_size),
        ] {
            if value % SECTOR_SIZE != 0 {
                return Err(SnapError::Misaligned { what, value });
            }
        }
        if self.snapshot_size > self.device_size {
            return Err(SnapError::RecordCorrupt {
                name: name.to_owned(),
                detail: format!(
                    "snapshot size {} exceeds device size {}",
                    self.snapshot_size, self.device_size
                ),
            });
        }
        if (self.snapshot_size > 0) != (self.cow_size() > 0) {
            return Err(SnapError::RecordCorrupt {
                name: name.to_owned(),
                detail: format!(
                    "snapshot size {} inconsistent with cow store size {}",
                    self.snapshot_size,
                    self.cow_size()
                ),
            });
        }
        Ok(())
    }

    /// Render the single-line on-disk form. No trailing newline.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.state,
            self.device_size,
            self.snapshot_size,
            self.cow_partition_size,
            self.cow_file_size,
            self.sectors_allocated,
            self.metadata_sectors
        )
    }

    /// Parse the on-disk form. Strict except for one optional trailing
    /// newline.
    pub fn decode(name: &str, contents: &str) -> Result<Self> {
        let corrupt = |detail: String| SnapError::RecordCorrupt {
            name: name.to_owned(),
            detail,
        };

        let line = contents.strip_suffix('\n').unwrap_or(contents);
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 7 {
            return Err(corrupt(format!("expected 7 fields, found {}", fields.len())));
        }

        let state = SnapshotState::parse_token(fields[0])
            .ok_or_else(|| corrupt(format!("unrecognized state {:?}", fields[0])))?;

        let mut numbers = [0_u64; 6];
        for (slot, field) in numbers.iter_mut().zip(&fields[1..]) {
            *slot = field
                .parse::<u64>()
                .map_err(|_| corrupt(format!("invalid integer field {field:?}")))?;
        }

        Ok(Self {
            state,
            device_size: numbers[0],
            snapshot_size: numbers[1],
            cow_partition_size: numbers[2],
            cow_file_size: numbers[3],
            sectors_allocated: numbers[4],
            metadata_sectors: numbers[5],
        })
    }
}
