//! RamPipe State Store
//!
//! Durable record of currently-pinned items, surviving daemon restarts.
//! The whole mapping is rewritten atomically (temp sibling + rename) on
//! every mutation, so a crash mid-write can never corrupt more than the
//! most recent pin or unpin.

use parking_lot::Mutex;
use rampipe_common::{Error, PinnedItem, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The durable mapping from canonical path to [`PinnedItem`]
///
/// This is the single source of truth for what is pinned; in-memory caches
/// elsewhere (the estimator's `pinned` flag) mirror it but never override it.
pub struct StateStore {
    file: PathBuf,
    items: Mutex<BTreeMap<PathBuf, PinnedItem>>,
}

impl StateStore {
    /// Open the store, loading the last persisted mapping
    ///
    /// A missing or unparsable state file means "nothing is pinned" and is
    /// never fatal; lost state is recoverable by re-pinning.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        let items = match fs::read(&file) {
            Ok(bytes) => match serde_json::from_slice::<Vec<PinnedItem>>(&bytes) {
                Ok(list) => {
                    let map: BTreeMap<_, _> =
                        list.into_iter().map(|i| (i.path.clone(), i)).collect();
                    info!("Loaded {} pinned item(s) from {}", map.len(), file.display());
                    map
                }
                Err(e) => {
                    warn!(
                        "State file {} is corrupt ({e}); starting with an empty mapping",
                        file.display()
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}; starting empty", file.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file,
            items: Mutex::new(items),
        })
    }

    /// Record a new pinned item and persist before returning
    pub fn insert(&self, item: PinnedItem) -> Result<()> {
        let mut items = self.items.lock();
        items.insert(item.path.clone(), item);
        self.persist(&items)
    }

    /// Remove a pinned item and persist before returning
    pub fn remove(&self, path: &Path) -> Result<Option<PinnedItem>> {
        let mut items = self.items.lock();
        let removed = items.remove(path);
        if removed.is_some() {
            self.persist(&items)?;
        }
        Ok(removed)
    }

    /// Look up one item by canonical path
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<PinnedItem> {
        self.items.lock().get(path).cloned()
    }

    /// True if the path is currently pinned
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.items.lock().contains_key(path)
    }

    /// Cloned listing of all pinned items (for status and sync passes)
    #[must_use]
    pub fn snapshot(&self) -> Vec<PinnedItem> {
        self.items.lock().values().cloned().collect()
    }

    /// Number of pinned items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True if nothing is pinned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Rewrite the whole mapping: write a temp sibling, fsync, rename
    fn persist(&self, items: &BTreeMap<PathBuf, PinnedItem>) -> Result<()> {
        let list: Vec<&PinnedItem> = items.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| Error::State(format!("serialize state: {e}")))?;
        let tmp = self.file.with_extension("json.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampipe_common::BackendMeta;
    use tempfile::tempdir;

    fn item(path: &str, inode: u64) -> PinnedItem {
        PinnedItem::new(
            path.into(),
            inode,
            BackendMeta::Move {
                staging_path: format!("/mnt/rampipe/{inode}").into(),
            },
        )
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).unwrap();
        store.insert(item("/srv/db", 42)).unwrap();
        store.insert(item("/var/log/app", 7)).unwrap();
        store.remove(Path::new("/var/log/app")).unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let got = reopened.get(Path::new("/srv/db")).unwrap();
        assert_eq!(got, store.get(Path::new("/srv/db")).unwrap());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let store = StateStore::open(&path).unwrap();
        assert!(store.is_empty());

        // And the store is still writable afterwards
        store.insert(item("/srv/db", 42)).unwrap();
        assert_eq!(StateStore::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::open(&path).unwrap();
        store.insert(item("/srv/db", 42)).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.remove(Path::new("/nope")).unwrap().is_none());
    }
}
