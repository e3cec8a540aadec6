//! The crash-safe on-disk state store.
//!
//! Layout under the metadata directory:
//!
//! ```text
//! state              one global update-state token, ASCII, no newline
//! snapshot-boot      the slot suffix active when snapshots were finalized
//! snapshots/<name>   one seven-field record per snapshotted partition
//! ```
//!
//! Multiple processes share this directory, so the state file doubles as the
//! cross-process mutex: every operation first takes an advisory `flock` on it
//! (shared for reads, exclusive for mutations) and the returned [`Session`]
//! is the proof of lock. The lock is released on drop, on every exit path.
//!
//! Writes are `O_SYNC` truncate-and-rewrite; readers always see either the
//! old or the new token, never a torn one, because the tokens fit well inside
//! one sector.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use snapslot_error::{Result, SnapError};
use snapslot_types::{SnapshotRecord, UpdateState};
use tracing::{debug, warn};

/// Lock strength of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Proof that the caller holds the advisory lock on the state file.
///
/// Mutating store operations demand an exclusive session; handing them a
/// shared one is a checked error, which makes the lock discipline testable.
#[derive(Debug)]
pub struct Session {
    file: File,
    mode: LockMode,
    path: PathBuf,
}

impl Session {
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        matches!(self.mode, LockMode::Exclusive)
    }

    fn require_exclusive(&self, op: &'static str) -> Result<()> {
        if self.is_exclusive() {
            Ok(())
        } else {
            Err(SnapError::NeedsExclusiveLock { op })
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), %err, "failed to unlock state file");
        }
    }
}

/// Handle to a metadata directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join("state")
    }

    #[must_use]
    pub fn boot_indicator_path(&self) -> PathBuf {
        self.root.join("snapshot-boot")
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.snapshots_dir().join(name)
    }

    // ── Sessions ──

    /// Open the state file and acquire the advisory lock.
    ///
    /// An exclusive session creates the state file (and the snapshots
    /// directory) if missing; a shared session requires them to exist.
    /// Blocks until the lock is granted.
    pub fn open_session(&self, mode: LockMode) -> Result<Session> {
        let path = self.state_path();
        let mut options = OpenOptions::new();
        options.read(true);
        options.custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW | libc::O_SYNC);
        if mode == LockMode::Exclusive {
            std::fs::create_dir_all(self.snapshots_dir())?;
            options.write(true).create(true).mode(0o660);
        }
        let file = options.open(&path).map_err(|source| SnapError::Open {
            path: path.clone(),
            source,
        })?;

        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        flock(file.as_raw_fd(), arg).map_err(|source| SnapError::Lock {
            path: path.clone(),
            source,
        })?;

        Ok(Session { file, mode, path })
    }

    // ── Global update state ──

    /// Read the persisted global state. Empty, missing, or unrecognized
    /// content reads as `None`.
    pub fn read_global(&self, session: &Session) -> UpdateState {
        // Reset position since sessions interleave reads and writes.
        let mut file = &session.file;
        if let Err(err) = file.seek(SeekFrom::Start(0)) {
            warn!(%err, "seek on state file failed");
            return UpdateState::None;
        }
        let mut contents = String::new();
        if let Err(err) = file.read_to_string(&mut contents) {
            warn!(%err, "read of state file failed");
            return UpdateState::None;
        }
        if contents.is_empty() {
            return UpdateState::None;
        }
        UpdateState::parse_token(&contents).unwrap_or_else(|| {
            warn!(contents, "unknown token in update state file");
            UpdateState::None
        })
    }

    /// Persist a global state token. Exclusive sessions only; the transient
    /// `Cancelled` state is never written.
    pub fn write_global(&self, session: &Session, state: UpdateState) -> Result<()> {
        session.require_exclusive("write update state")?;
        if !state.is_persistable() {
            return Err(SnapError::internal(format!(
                "attempted to persist transient state {state}"
            )));
        }
        let mut file = &session.file;
        file.seek(SeekFrom::Start(0))?;
        session.file.set_len(0)?;
        file.write_all(state.as_str().as_bytes())?;
        debug!(state = %state, "wrote update state");
        Ok(())
    }

    // ── Boot indicator ──

    /// Record the given slot suffix as the one snapshots were finalized on.
    pub fn write_boot_indicator(&self, session: &Session, slot_suffix: &str) -> Result<()> {
        session.require_exclusive("write boot indicator")?;
        let path = self.boot_indicator_path();
        let mut file = sync_write_options()
            .open(&path)
            .map_err(|source| SnapError::Open {
                path: path.clone(),
                source,
            })?;
        file.set_len(0)?;
        file.write_all(slot_suffix.as_bytes())?;
        Ok(())
    }

    /// The stored slot suffix, or `None` if the indicator does not exist or
    /// cannot be read.
    #[must_use]
    pub fn read_boot_indicator(&self) -> Option<String> {
        match std::fs::read_to_string(self.boot_indicator_path()) {
            Ok(contents) => Some(contents),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%err, "cannot read boot indicator");
                }
                None
            }
        }
    }

    /// Remove the boot indicator. Missing is fine; the deeper state checks
    /// at boot tolerate a stale indicator.
    pub fn remove_boot_indicator(&self, session: &Session) -> Result<()> {
        session.require_exclusive("remove boot indicator")?;
        match std::fs::remove_file(self.boot_indicator_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ── Snapshot records ──

    /// Names of all recorded snapshots.
    pub fn list_snapshots(&self, _session: &Session) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.snapshots_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Whether a record exists for `name`.
    #[must_use]
    pub fn record_exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Read and parse the record for `name`.
    pub fn read_record(&self, _session: &Session, name: &str) -> Result<SnapshotRecord> {
        let path = self.record_path(name);
        let mut options = OpenOptions::new();
        options
            .read(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW);
        let mut file = options.open(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SnapError::NoSuchSnapshot {
                    name: name.to_owned(),
                }
            } else {
                SnapError::Open {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        SnapshotRecord::decode(name, &contents)
    }

    /// Atomically rewrite the record for `name`. Exclusive sessions only.
    pub fn write_record(
        &self,
        session: &Session,
        name: &str,
        record: &SnapshotRecord,
    ) -> Result<()> {
        session.require_exclusive("write snapshot record")?;
        record.validate(name)?;

        let path = self.record_path(name);
        let mut file = sync_write_options()
            .open(&path)
            .map_err(|source| SnapError::Open {
                path: path.clone(),
                source,
            })?;
        file.set_len(0)?;
        file.write_all(record.encode().as_bytes())?;
        debug!(name, state = %record.state, "wrote snapshot record");
        Ok(())
    }

    /// Remove the record for `name` if present. Exclusive sessions only;
    /// idempotent.
    pub fn delete_record(&self, session: &Session, name: &str) -> Result<()> {
        session.require_exclusive("delete snapshot record")?;
        match std::fs::remove_file(self.record_path(name)) {
            Ok(()) => {
                debug!(name, "deleted snapshot record");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn sync_write_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create(true)
        .mode(0o660)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW | libc::O_SYNC);
    options
}

#[cfg(test)]
mod tests {
    use snapslot_types::SnapshotState;
    use tempfile::TempDir;

    use super::*;

    fn open_store() -> (TempDir, StateDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = StateDir::new(dir.path().join("ota"));
        (dir, store)
    }

    fn sample_record() -> SnapshotRecord {
        SnapshotRecord {
            state: SnapshotState::Created,
            device_size: 1 << 20,
            snapshot_size: 512 << 10,
            cow_partition_size: 128 << 10,
            cow_file_size: 0,
            sectors_allocated: 0,
            metadata_sectors: 0,
        }
    }

    // ── Sessions & locking ──

    #[test]
    fn exclusive_session_creates_layout() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        assert!(session.is_exclusive());
        assert!(store.state_path().exists());
        assert!(store.snapshots_dir().is_dir());
    }

    #[test]
    fn shared_session_requires_existing_state() {
        let (_dir, store) = open_store();
        assert!(store.open_session(LockMode::Shared).is_err());

        drop(store.open_session(LockMode::Exclusive).unwrap());
        let session = store.open_session(LockMode::Shared).unwrap();
        assert_eq!(session.mode(), LockMode::Shared);
    }

    #[test]
    fn shared_lock_cannot_mutate() {
        let (_dir, store) = open_store();
        drop(store.open_session(LockMode::Exclusive).unwrap());

        let session = store.open_session(LockMode::Shared).unwrap();
        assert!(matches!(
            store.write_global(&session, UpdateState::Initiated),
            Err(SnapError::NeedsExclusiveLock { .. })
        ));
        assert!(matches!(
            store.write_record(&session, "p", &sample_record()),
            Err(SnapError::NeedsExclusiveLock { .. })
        ));
        assert!(matches!(
            store.delete_record(&session, "p"),
            Err(SnapError::NeedsExclusiveLock { .. })
        ));
        assert!(matches!(
            store.remove_boot_indicator(&session),
            Err(SnapError::NeedsExclusiveLock { .. })
        ));
    }

    // ── Global state ──

    #[test]
    fn global_state_round_trips() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();

        assert_eq!(store.read_global(&session), UpdateState::None);
        store
            .write_global(&session, UpdateState::Initiated)
            .unwrap();
        assert_eq!(store.read_global(&session), UpdateState::Initiated);
        store
            .write_global(&session, UpdateState::Merging)
            .unwrap();
        assert_eq!(store.read_global(&session), UpdateState::Merging);

        // Raw file holds the bare token, no newline.
        let raw = std::fs::read_to_string(store.state_path()).unwrap();
        assert_eq!(raw, "merging");
    }

    #[test]
    fn unknown_state_content_reads_as_none() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        std::fs::write(store.state_path(), "resting").unwrap();
        assert_eq!(store.read_global(&session), UpdateState::None);
    }

    #[test]
    fn cancelled_is_not_persistable() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        assert!(store
            .write_global(&session, UpdateState::Cancelled)
            .is_err());
    }

    // ── Records ──

    #[test]
    fn record_round_trips() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();

        store
            .write_record(&session, "system_b", &sample_record())
            .unwrap();
        assert!(store.record_exists("system_b"));
        assert_eq!(
            store.read_record(&session, "system_b").unwrap(),
            sample_record()
        );
        assert_eq!(
            store.list_snapshots(&session).unwrap(),
            vec!["system_b".to_owned()]
        );
    }

    #[test]
    fn write_rejects_misaligned_record() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        let mut record = sample_record();
        record.snapshot_size += 1;
        assert!(store.write_record(&session, "p", &record).is_err());
    }

    #[test]
    fn missing_record_is_distinguishable() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        assert!(matches!(
            store.read_record(&session, "ghost"),
            Err(SnapError::NoSuchSnapshot { .. })
        ));
    }

    #[test]
    fn delete_record_is_idempotent() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        store
            .write_record(&session, "system_b", &sample_record())
            .unwrap();
        store.delete_record(&session, "system_b").unwrap();
        store.delete_record(&session, "system_b").unwrap();
        assert!(!store.record_exists("system_b"));
    }

    #[test]
    fn list_ignores_subdirectories() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();
        std::fs::create_dir(store.snapshots_dir().join("not-a-record")).unwrap();
        store
            .write_record(&session, "system_b", &sample_record())
            .unwrap();
        assert_eq!(
            store.list_snapshots(&session).unwrap(),
            vec!["system_b".to_owned()]
        );
    }

    // ── Boot indicator ──

    #[test]
    fn boot_indicator_round_trips() {
        let (_dir, store) = open_store();
        let session = store.open_session(LockMode::Exclusive).unwrap();

        assert_eq!(store.read_boot_indicator(), None);
        store.write_boot_indicator(&session, "_a").unwrap();
        assert_eq!(store.read_boot_indicator().as_deref(), Some("_a"));

        store.remove_boot_indicator(&session).unwrap();
        assert_eq!(store.read_boot_indicator(), None);
        // Idempotent.
        store.remove_boot_indicator(&session).unwrap();
    }

    // ── Cross-session behavior ──

    #[test]
    fn state_survives_sessions() {
        let (_dir, store) = open_store();
        {
            let session = store.open_session(LockMode::Exclusive).unwrap();
            store
                .write_global(&session, UpdateState::Unverified)
                .unwrap();
        }
        let session = store.open_session(LockMode::Shared).unwrap();
        assert_eq!(store.read_global(&session), UpdateState::Unverified);
    }
}
