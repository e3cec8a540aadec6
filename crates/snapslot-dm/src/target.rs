//! The table/target model and the ad-hoc text formats that ride on it.
//!
//! A table is an ordered sequence of targets; each target covers a
//! contiguous sector range and names a type plus a parameter string. The
//! parameter grammars are fixed by the kernel:
//!
//! - linear: `"<major>:<minor> <start_sector>"`
//! - snapshot / snapshot-merge:
//!   `"<base_major>:<base_minor> <cow_major>:<cow_minor> <mode> <chunk>"`
//!
//! and a snapshot target's *status* line is
//! `"<sectors_allocated>/<total_sectors> <metadata_sectors>"`.

use std::fmt;

use snapslot_error::{Result, SnapError};
use snapslot_types::SNAPSHOT_CHUNK_SECTORS;

/// Activation state of a named mapper device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// The device does not exist.
    Invalid,
    /// The device exists but I/O is gated (no active table, or suspended).
    Suspended,
    /// The device has an active table and passes I/O.
    Active,
}

/// Storage mode of a snapshot target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Writes go only to the cow store and survive reboot (`P`).
    Persistent,
    /// Writes go to the cow store and are discarded on teardown (`N`).
    NotPersistent,
    /// Persistent, with overflow signalling (`O`).
    Overflow,
    /// The cow store is drained back into the base device (`merge`).
    Merge,
}

impl SnapshotMode {
    /// The mode token used in target parameter strings.
    #[must_use]
    pub const fn as_param(self) -> &'static str {
        match self {
            Self::Persistent => "P",
            Self::NotPersistent => "N",
            Self::Overflow => "O",
            Self::Merge => "merge",
        }
    }

    /// The kernel target type implementing this mode.
    #[must_use]
    pub const fn target_type(self) -> &'static str {
        match self {
            Self::Merge => "snapshot-merge",
            _ => "snapshot",
        }
    }
}

/// Tagged target specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Pass the range through to `device`, starting at `start_sector`.
    Linear { device: String, start_sector: u64 },
    /// Overlay `base` with writes captured in `cow`.
    Snapshot {
        base: String,
        cow: String,
        mode: SnapshotMode,
    },
}

impl TargetSpec {
    #[must_use]
    pub fn target_type(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Snapshot { mode, .. } => mode.target_type(),
        }
    }

    /// Render the kernel parameter string.
    #[must_use]
    pub fn params(&self) -> String {
        match self {
            Self::Linear {
                device,
                start_sector,
            } => format!("{device} {start_sector}"),
            Self::Snapshot { base, cow, mode } => {
                format!("{base} {cow} {} {SNAPSHOT_CHUNK_SECTORS}", mode.as_param())
            }
        }
    }
}

/// One target: a sector range plus its specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTarget {
    pub start_sector: u64,
    pub length_sectors: u64,
    pub spec: TargetSpec,
}

/// An ordered sequence of targets forming one device's table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmTable {
    targets: Vec<DmTarget>,
}

impl DmTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a target covering `[start_sector, start_sector + length)`.
    pub fn push(&mut self, start_sector: u64, length_sectors: u64, spec: TargetSpec) -> &mut Self {
        self.targets.push(DmTarget {
            start_sector,
            length_sectors,
            spec,
        });
        self
    }

    /// Convenience: a single linear target spanning `length_sectors` of
    /// `device` from its `start_sector`.
    #[must_use]
    pub fn linear(device: impl Into<String>, start_sector: u64, length_sectors: u64) -> Self {
        let mut table = Self::new();
        table.push(
            0,
            length_sectors,
            TargetSpec::Linear {
                device: device.into(),
                start_sector,
            },
        );
        table
    }

    #[must_use]
    pub fn targets(&self) -> &[DmTarget] {
        &self.targets
    }

    #[must_use]
    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Total sectors covered by the table.
    #[must_use]
    pub fn num_sectors(&self) -> u64 {
        self.targets
            .last()
            .map_or(0, |t| t.start_sector + t.length_sectors)
    }

    /// A loadable table is non-empty, starts at sector zero, and has no
    /// holes or overlaps.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(SnapError::InvalidTable("table has no targets".to_owned()));
        }
        let mut expected = 0_u64;
        for target in &self.targets {
            if target.start_sector != expected {
                return Err(SnapError::InvalidTable(format!(
                    "target starts at sector {}, expected {}",
                    target.start_sector, expected
                )));
            }
            if target.length_sectors == 0 {
                return Err(SnapError::InvalidTable(format!(
                    "zero-length target at sector {}",
                    target.start_sector
                )));
            }
            expected = target.start_sector + target.length_sectors;
        }
        Ok(())
    }
}

impl fmt::Display for DmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for target in &self.targets {
            writeln!(
                f,
                "{} {} {} {}",
                target.start_sector,
                target.length_sectors,
                target.spec.target_type(),
                target.spec.params()
            )?;
        }
        Ok(())
    }
}

/// One line of a table or status enumeration, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLine {
    pub start_sector: u64,
    pub length_sectors: u64,
    pub target_type: String,
    /// Table queries return the parameter string; status queries return the
    /// runtime status string (empty for linear targets).
    pub data: String,
}

impl TargetLine {
    /// Whether this line is a snapshot-family target.
    #[must_use]
    pub fn is_snapshot_type(&self) -> bool {
        self.target_type == "snapshot" || self.target_type == "snapshot-merge"
    }
}

/// Parsed snapshot-target status counters. The merge has drained completely
/// when `sectors_allocated == metadata_sectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStatus {
    pub sectors_allocated: u64,
    pub total_sectors: u64,
    pub metadata_sectors: u64,
}

impl SnapshotStatus {
    /// Parse `"<A>/<B> <C>"`. Total: every deviation, including trailing
    /// data, is an error.
    pub fn parse(line: &str) -> Result<Self> {
        let bad = |detail: &str| SnapError::StatusLine {
            line: line.to_owned(),
            detail: detail.to_owned(),
        };

        let (counts, metadata) = line
            .split_once(' ')
            .ok_or_else(|| bad("expected two space-separated fields"))?;
        let (allocated, total) = counts
            .split_once('/')
            .ok_or_else(|| bad("expected '/' in the first field"))?;

        let parse_u64 = |field: &str| {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad("non-numeric field"));
            }
            field.parse::<u64>().map_err(|_| bad("field out of range"))
        };

        if metadata.contains(' ') {
            return Err(bad("trailing data after metadata sectors"));
        }

        Ok(Self {
            sectors_allocated: parse_u64(allocated)?,
            total_sectors: parse_u64(total)?,
            metadata_sectors: parse_u64(metadata)?,
        })
    }

    #[must_use]
    pub const fn merge_complete(&self) -> bool {
        self.sectors_allocated == self.metadata_sectors
    }

    /// Render in the kernel's status format.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}/{} {}",
            self.sectors_allocated, self.total_sectors, self.metadata_sectors
        )
    }
}

/// Recover the `(base, cow)` device strings from a snapshot target's
/// parameter string.
pub fn parse_snapshot_params(params: &str) -> Result<(String, String)> {
    let mut fields = params.split(' ');
    match (fields.next(), fields.next()) {
        (Some(base), Some(cow)) if !base.is_empty() && !cow.is_empty() => {
            Ok((base.to_owned(), cow.to_owned()))
        }
        _ => Err(SnapError::StatusLine {
            line: params.to_owned(),
            detail: "expected base and cow device fields".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // ── Table construction ──

    #[test]
    fn snapshot_params_format() {
        let spec = TargetSpec::Snapshot {
            base: "253:1".to_owned(),
            cow: "253:2".to_owned(),
            mode: SnapshotMode::Persistent,
        };
        assert_eq!(spec.target_type(), "snapshot");
        assert_eq!(spec.params(), "253:1 253:2 P 8");

        let spec = TargetSpec::Snapshot {
            base: "253:1".to_owned(),
            cow: "253:2".to_owned(),
            mode: SnapshotMode::Merge,
        };
        assert_eq!(spec.target_type(), "snapshot-merge");
        assert_eq!(spec.params(), "253:1 253:2 merge 8");
    }

    #[test]
    fn linear_params_format() {
        let spec = TargetSpec::Linear {
            device: "259:0".to_owned(),
            start_sector: 2048,
        };
        assert_eq!(spec.target_type(), "linear");
        assert_eq!(spec.params(), "259:0 2048");
    }

    #[test]
    fn table_validates_contiguity() {
        let mut table = DmTable::new();
        table.push(
            0,
            100,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 0,
            },
        );
        table.push(
            100,
            50,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 100,
            },
        );
        assert!(table.validate().is_ok());
        assert_eq!(table.num_sectors(), 150);
    }

    #[test]
    fn table_rejects_holes_and_empty() {
        assert!(DmTable::new().validate().is_err());

        let mut table = DmTable::new();
        table.push(
            8,
            100,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 0,
            },
        );
        assert!(table.validate().is_err());

        let mut table = DmTable::new();
        table.push(
            0,
            100,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 0,
            },
        );
        table.push(
            200,
            100,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 0,
            },
        );
        assert!(table.validate().is_err());
    }

    // ── Status line parsing ──

    #[test]
    fn status_parses_and_round_trips() {
        let status = SnapshotStatus::parse("16/2048 8").unwrap();
        assert_eq!(status.sectors_allocated, 16);
        assert_eq!(status.total_sectors, 2048);
        assert_eq!(status.metadata_sectors, 8);
        assert!(!status.merge_complete());
        assert_eq!(status.encode(), "16/2048 8");

        let drained = SnapshotStatus::parse("8/2048 8").unwrap();
        assert!(drained.merge_complete());
    }

    #[test]
    fn status_rejects_deviations() {
        for line in [
            "",
            "16/2048",
            "16 2048 8",
            "16/2048 8 ",
            "16/2048 8 9",
            "16/2048 8\n",
            "a/2048 8",
            "16/2048 -8",
            "16//2048 8",
        ] {
            assert!(SnapshotStatus::parse(line).is_err(), "accepted {line:?}");
        }
    }

    #[test]
    fn snapshot_params_recover_devices() {
        let (base, cow) = parse_snapshot_params("253:1 253:2 merge 8").unwrap();
        assert_eq!(base, "253:1");
        assert_eq!(cow, "253:2");

        assert!(parse_snapshot_params("253:1").is_err());
        assert!(parse_snapshot_params("").is_err());
    }

    proptest! {
        #[test]
        fn status_parse_never_panics(line in ".{0,64}") {
            let _ = SnapshotStatus::parse(&line);
        }

        #[test]
        fn status_round_trips(a in any::<u64>(), b in any::<u64>(), c in any::<u64>()) {
            let status = SnapshotStatus {
                sectors_allocated: a,
                total_sectors: b,
                metadata_sectors: c,
            };
            prop_assert_eq!(SnapshotStatus::parse(&status.encode()).unwrap(), status);
        }
    }
}
