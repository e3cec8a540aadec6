//! The `Mapper` seam.
//!
//! Everything above this crate programs against `&dyn Mapper`, so the whole
//! snapshot lifecycle runs unchanged over the kernel backend or the
//! in-memory one.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use snapslot_error::{Result, SnapError};
use tracing::debug;

use crate::target::{DeviceState, DmTable, TargetLine};

/// Typed handle to the block-device mapper.
///
/// All operations address devices by name. Failures carry the kernel error
/// code where one exists.
pub trait Mapper: Send + Sync {
    /// Allocate an empty named device. A uuid, when given, becomes the
    /// device's stable identity for by-uuid path resolution.
    fn create(&self, name: &str, uuid: Option<&str>) -> Result<()>;

    /// Remove a device. Fails if it does not exist.
    fn delete(&self, name: &str) -> Result<()>;

    /// Remove a device, treating "absent" as success.
    fn delete_if_exists(&self, name: &str) -> Result<()> {
        if self.state(name) == DeviceState::Invalid {
            return Ok(());
        }
        self.delete(name)
    }

    /// Load a new inactive table. It becomes live on the next resume.
    fn load_table(&self, name: &str, table: &DmTable) -> Result<()>;

    /// Gate I/O on the device.
    fn suspend(&self, name: &str) -> Result<()>;

    /// Ungate I/O, swapping in any loaded inactive table.
    fn resume(&self, name: &str) -> Result<()>;

    /// Load a table and immediately activate it.
    fn load_and_activate(&self, name: &str, table: &DmTable) -> Result<()> {
        self.load_table(name, table)?;
        self.resume(name)
    }

    /// Current activation state; `Invalid` for nonexistent devices.
    fn state(&self, name: &str) -> DeviceState;

    /// Per-target runtime status lines of the active table.
    fn status(&self, name: &str) -> Result<Vec<TargetLine>>;

    /// Per-target specification lines of the active table.
    fn table(&self, name: &str) -> Result<Vec<TargetLine>>;

    /// The block-device node path (`/dev/dm-N` form).
    fn path(&self, name: &str) -> Result<String>;

    /// The device's unique by-uuid path, published once udev has processed
    /// the creation event. Safe to poll for appearance.
    fn unique_path(&self, name: &str) -> Result<String>;

    /// The `major:minor` form consumable as a target parameter.
    fn device_string(&self, name: &str) -> Result<String>;

    /// Create a device, activate `table` on it, and return its node path.
    ///
    /// When `timeout` is nonzero the call waits for the unique by-uuid path
    /// to appear, because node paths can be recycled between processes and a
    /// bare existence check on `/dev/dm-N` races with the event daemon. On
    /// any failure the half-made device is deleted. A zero `timeout` skips
    /// the wait; the caller owns the race.
    fn create_device(&self, name: &str, table: &DmTable, timeout: Duration) -> Result<String> {
        table.validate()?;
        let uuid = generate_uuid();
        self.create(name, Some(&uuid))?;

        let activated = (|| {
            self.load_and_activate(name, table)?;
            let unique = self.unique_path(name)?;
            let path = self.path(name)?;
            if !timeout.is_zero() {
                self.wait_for_path(&unique, timeout)?;
            }
            Ok(path)
        })();

        if activated.is_err() {
            if let Err(err) = self.delete(name) {
                debug!(name, %err, "could not delete half-created device");
            }
        }
        activated
    }

    /// Poll for a path to appear, failing once `timeout` elapses.
    fn wait_for_path(&self, path: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if Path::new(path).exists() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SnapError::Timeout {
                    what: format!("device path {path}"),
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Generate a random lowercase-hex uuid string.
///
/// Reads `/dev/urandom`, with a deterministic xorshift fallback for hermetic
/// environments without it.
#[must_use]
pub fn generate_uuid() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

    let mut bytes = [0_u8; 16];
    let filled = File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .is_ok();
    if !filled {
        let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut state: u64 = 0x5DEE_CE66_D1A4_F681 ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        for chunk in bytes.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            for (dst, src) in chunk.iter_mut().zip(state.to_le_bytes()) {
                *dst = src;
            }
        }
    }

    let mut out = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}
