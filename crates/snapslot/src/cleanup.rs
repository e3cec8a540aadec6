//! Scoped cleanup of partially composed stacks.
//!
//! Multi-step compositions register every artifact they create; if the scope
//! unwinds without [`CleanupList::release`], the artifacts are destroyed in
//! reverse creation order (newer devices stack on older ones). Failures
//! during unwinding are logged and do not stop the remaining actions.

use snapslot_dm::Mapper;
use snapslot_error::Result;
use snapslot_state::{Session, StateDir};
use tracing::warn;

use crate::deps::ImageManager;

#[derive(Debug)]
enum CleanupAction {
    UnmapDevice(String),
    UnmapImage(String),
    DeleteRecord(String),
}

/// Move-only bag of pending cleanup actions, run LIFO on drop.
pub struct CleanupList<'a> {
    mapper: &'a dyn Mapper,
    images: &'a dyn ImageManager,
    store: &'a StateDir,
    session: &'a Session,
    actions: Vec<CleanupAction>,
}

impl<'a> CleanupList<'a> {
    pub fn new(
        mapper: &'a dyn Mapper,
        images: &'a dyn ImageManager,
        store: &'a StateDir,
        session: &'a Session,
    ) -> Self {
        Self {
            mapper,
            images,
            store,
            session,
            actions: Vec::new(),
        }
    }

    /// Delete the named mapper device on unwind.
    pub fn unmap_device_on_failure(&mut self, name: impl Into<String>) {
        self.actions.push(CleanupAction::UnmapDevice(name.into()));
    }

    /// Unmap the named backing image on unwind.
    pub fn unmap_image_on_failure(&mut self, name: impl Into<String>) {
        self.actions.push(CleanupAction::UnmapImage(name.into()));
    }

    /// Delete the named snapshot record on unwind. Requires the session to
    /// be exclusive when it fires.
    pub fn delete_record_on_failure(&mut self, name: impl Into<String>) {
        self.actions.push(CleanupAction::DeleteRecord(name.into()));
    }

    /// The composition succeeded: keep everything.
    pub fn release(&mut self) {
        self.actions.clear();
    }

    fn run(&self, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::UnmapDevice(name) => self.mapper.delete_if_exists(name),
            CleanupAction::UnmapImage(name) => self.images.unmap_image_if_exists(name),
            CleanupAction::DeleteRecord(name) => self.store.delete_record(self.session, name),
        }
    }
}

impl Drop for CleanupList<'_> {
    fn drop(&mut self) {
        for action in self.actions.iter().rev() {
            if let Err(err) = self.run(action) {
                warn!(?action, %err, "cleanup action failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use snapslot_dm::{DmTable, MemMapper, TargetSpec};
    use snapslot_state::LockMode;
    use tempfile::TempDir;

    use crate::sim::SimImages;

    use super::*;

    fn plain_table() -> DmTable {
        let mut table = DmTable::new();
        table.push(
            0,
            64,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 0,
            },
        );
        table
    }

    #[test]
    fn drop_unwinds_in_reverse_order() {
        let dir = TempDir::new().unwrap();
        let mapper = MemMapper::new();
        let images = SimImages::new(dir.path().join("img"));
        let store = StateDir::new(dir.path().join("ota"));
        let session = store.open_session(LockMode::Exclusive).unwrap();

        mapper.create("outer", None).unwrap();
        mapper.load_and_activate("outer", &plain_table()).unwrap();
        mapper.create("base", None).unwrap();
        mapper.load_and_activate("base", &plain_table()).unwrap();

        {
            let mut list = CleanupList::new(&mapper, &images, &store, &session);
            list.unmap_device_on_failure("base");
            list.unmap_device_on_failure("outer");
            // No release: everything goes.
        }
        assert!(mapper.device_names().is_empty());
    }

    #[test]
    fn release_keeps_artifacts() {
        let dir = TempDir::new().unwrap();
        let mapper = MemMapper::new();
        let images = SimImages::new(dir.path().join("img"));
        let store = StateDir::new(dir.path().join("ota"));
        let session = store.open_session(LockMode::Exclusive).unwrap();

        mapper.create("kept", None).unwrap();
        {
            let mut list = CleanupList::new(&mapper, &images, &store, &session);
            list.unmap_device_on_failure("kept");
            list.release();
        }
        assert_eq!(mapper.device_names(), vec!["kept".to_owned()]);
    }

    #[test]
    fn record_and_image_actions_fire() {
        let dir = TempDir::new().unwrap();
        let mapper = MemMapper::new();
        let images = SimImages::new(dir.path().join("img"));
        let store = StateDir::new(dir.path().join("ota"));
        let session = store.open_session(LockMode::Exclusive).unwrap();

        let record = snapslot_types::SnapshotRecord {
            state: snapslot_types::SnapshotState::Created,
            device_size: 4096,
            snapshot_size: 4096,
            cow_partition_size: 4096,
            ..Default::default()
        };
        store.write_record(&session, "system_b", &record).unwrap();
        images.create_image("system_b-cow-img", 4096).unwrap();
        images
            .map_image("system_b-cow-img", std::time::Duration::ZERO)
            .unwrap();

        {
            let mut list = CleanupList::new(&mapper, &images, &store, &session);
            list.delete_record_on_failure("system_b");
            list.unmap_image_on_failure("system_b-cow-img");
        }
        assert!(!store.record_exists("system_b"));
        // The image itself survives; only the mapping is undone.
        assert!(images.image_exists("system_b-cow-img").unwrap());
    }

    #[test]
    fn unwind_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let mapper = MemMapper::new();
        let images = SimImages::new(dir.path().join("img"));
        let store = StateDir::new(dir.path().join("ota"));
        drop(store.open_session(LockMode::Exclusive).unwrap());
        let session = store.open_session(LockMode::Shared).unwrap();

        mapper.create("dev", None).unwrap();
        {
            let mut list = CleanupList::new(&mapper, &images, &store, &session);
            // Record deletion fails under a shared lock but must not stop
            // the device unmap queued before it.
            list.unmap_device_on_failure("dev");
            list.delete_record_on_failure("ghost");
        }
        assert!(mapper.device_names().is_empty());
    }
}
