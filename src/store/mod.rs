pub mod blob;
pub mod bucket;
pub mod policy;
pub mod tree;

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{HistoryError, Result};
use crate::path::HistoryPath;
use blob::BlobStore;
use bucket::HistoryEntry;
use policy::{apply_policy, reconcile, HistoryPolicy};
use tree::{Batch, BucketTree, Depth, Visit};

/// Size and modification time of a file about to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub length: u64,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
}

impl FileInfo {
    pub fn new(length: u64, last_modified: i64) -> Self {
        Self {
            length,
            last_modified,
        }
    }

    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let last_modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or_else(|_| Utc::now().timestamp_millis());
        Self::new(meta.len(), last_modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Folder,
    Project,
}

/// A workspace resource whose history is being copied or moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub path: HistoryPath,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn file(path: impl Into<HistoryPath>) -> Self {
        Self {
            path: path.into(),
            kind: ResourceKind::File,
        }
    }

    pub fn folder(path: impl Into<HistoryPath>) -> Self {
        Self {
            path: path.into(),
            kind: ResourceKind::Folder,
        }
    }

    pub fn project(path: impl Into<HistoryPath>) -> Self {
        Self {
            path: path.into(),
            kind: ResourceKind::Project,
        }
    }
}

/// One historical version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileState {
    path: HistoryPath,
    timestamp: i64,
    id: Uuid,
}

impl FileState {
    pub fn path(&self) -> &HistoryPath {
        &self.path
    }

    /// Milliseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

struct Inner {
    tree: BucketTree,
    /// Blobs no entry should reference any more, awaiting deletion.
    pending: HashSet<Uuid>,
    policy: HistoryPolicy,
}

/// Local history of every file in a workspace.
///
/// Every call that touches the bucket tree or the pending-removal set holds
/// one store-wide lock. Blob reads go straight to the blob store.
pub struct HistoryStore {
    blobs: BlobStore,
    inner: Mutex<Inner>,
}

impl HistoryStore {
    pub fn new(tree: BucketTree, blobs: BlobStore, policy: HistoryPolicy) -> Self {
        // A missing root surfaces on the first write.
        if let Err(e) = fs::create_dir_all(blobs.root()) {
            log::debug!("Could not create blob root {}: {}", blobs.root().display(), e);
        }
        Self {
            blobs,
            inner: Mutex::new(Inner {
                tree,
                pending: HashSet::new(),
                policy,
            }),
        }
    }

    /// Opens the store for `workspace` at the locations named in `config`.
    pub fn open(workspace: &Path, config: &Config) -> Result<Self> {
        let tree = BucketTree::open(config.store.db_path(workspace))?;
        let blobs = BlobStore::new(
            config.store.blob_path(workspace),
            config.store.compression_level,
        );
        Ok(Self::new(tree, blobs, config.policy))
    }

    pub fn startup(&self) {}

    pub fn shutdown(&self) -> Result<()> {
        self.inner.lock().tree.close()
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.inner.lock().policy
    }

    /// Replaces the limits used by later calls. A sweep already running
    /// keeps the values it started with.
    pub fn set_policy(&self, policy: HistoryPolicy) {
        self.inner.lock().policy = policy;
    }

    /// Number of blobs queued for deletion by the next cleanup.
    pub fn pending_removals(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Records the file at `local` as a new state of `path`.
    ///
    /// Returns `None` when the file is over the size limit or could not be
    /// stored and indexed. A blob that cannot be indexed is deleted again.
    pub fn add_state(
        &self,
        path: &HistoryPath,
        local: &Path,
        info: FileInfo,
        move_ownership: bool,
    ) -> Option<FileState> {
        let mut inner = self.inner.lock();
        if !inner.policy.accepts_size(info.length) {
            log::debug!(
                "Ignoring {} for history: {} bytes exceeds limit of {}",
                path,
                info.length,
                inner.policy.max_file_state_size
            );
            return None;
        }

        if path.is_root() {
            log::error!("Cannot record history for the workspace root");
            return None;
        }

        let id = match self.blobs.add_blob(local, move_ownership) {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to add history state for {}: {}", path, e);
                return None;
            }
        };
        let indexed = inner
            .tree
            .load_bucket_for(path)
            .map(|bucket| bucket.add_blob(path, id, info.last_modified));
        match indexed {
            Ok(true) => {}
            Ok(false) => {
                self.blobs.delete_blobs(&HashSet::from([id]));
                return None;
            }
            Err(e) => {
                log::error!("Failed to index history state for {}: {}", path, e);
                self.blobs.delete_blobs(&HashSet::from([id]));
                return None;
            }
        }
        // The entry is in the current bucket; a later switch retries the save.
        if let Err(e) = inner.tree.save() {
            log::error!("Failed to save history of {}: {}", path, e);
        }
        Some(FileState {
            path: path.clone(),
            timestamp: info.last_modified,
            id,
        })
    }

    /// All states of `path`, newest first.
    pub fn get_states(&self, path: &HistoryPath) -> Vec<FileState> {
        let mut inner = self.inner.lock();
        let bucket = match inner.tree.load_bucket_for(path) {
            Ok(bucket) => bucket,
            Err(e) => {
                log::error!("Failed to read history of {}: {}", path, e);
                return Vec::new();
            }
        };
        bucket
            .get_entry(path)
            .map(|entry| {
                entry
                    .occurrences()
                    .iter()
                    .map(|o| FileState {
                        path: entry.path().clone(),
                        timestamp: o.timestamp,
                        id: o.id,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_contents(&self, state: &FileState) -> Result<Box<dyn Read + Send>> {
        if !self.exists(state) {
            return Err(HistoryError::StateNotFound {
                path: state.path.clone(),
                timestamp: state.timestamp,
            });
        }
        self.blobs.get_blob(&state.id)
    }

    /// Location of the stored object backing `state`.
    pub fn get_file_for(&self, state: &FileState) -> PathBuf {
        self.blobs.file_for(&state.id)
    }

    pub fn exists(&self, state: &FileState) -> bool {
        self.blobs.exists(&state.id)
    }

    /// Paths at or below `root` that have any history.
    pub fn all_files(&self, root: &HistoryPath, depth: Depth) -> HashSet<HistoryPath> {
        let mut inner = self.inner.lock();
        let mut files = HashSet::new();
        let mut collect = |entry: &mut HistoryEntry, _: &mut Batch| {
            files.insert(entry.path().clone());
            Visit::Continue
        };
        if let Err(e) = inner.tree.accept(&mut collect, root, depth) {
            log::error!("Failed to list history under {}: {}", root, e);
        }
        files
    }

    /// Makes `destination` inherit the history of `source` and everything
    /// below it, then trims the destination to the current policy.
    ///
    /// Moving a whole project drops its history instead: the old name may be
    /// reused by an unrelated project.
    pub fn copy_history(&self, source: &Resource, destination: &Resource, moving: bool) {
        let src = &source.path;
        let dst = &destination.path;
        if src == dst {
            log::error!("Cannot copy history of {} onto itself", src);
            return;
        }
        if src.is_root() || dst.is_root() {
            log::error!("Cannot copy history between {} and {}", src, dst);
            return;
        }
        if src.segment_count() == 1 && dst.segment_count() != 1 {
            log::error!("Project history of {} can only be copied to a project, not {}", src, dst);
            return;
        }

        let mut inner = self.inner.lock();
        let Inner {
            tree,
            pending,
            policy,
        } = &mut *inner;

        if moving && source.kind == ResourceKind::Project {
            match tree.flush(src) {
                Ok(orphans) => pending.extend(orphans),
                Err(e) => log::error!("Failed to flush history of project {}: {}", src, e),
            }
            return;
        }

        let prefix_len = src.segment_count();
        let mut copy = |entry: &mut HistoryEntry, batch: &mut Batch| {
            let target = dst.append(&entry.path().remove_first_segments(prefix_len));
            batch.push(HistoryEntry::rebased(target, entry));
            Visit::Continue
        };
        let cutoff = policy.cutoff();
        let mut trim = |entry: &mut HistoryEntry, _: &mut Batch| {
            apply_policy(entry, cutoff, pending);
            Visit::Continue
        };

        let result = tree
            .accept(&mut copy, src, Depth::Infinite)
            .and_then(|()| tree.accept(&mut trim, dst, Depth::Infinite));
        if let Err(e) = result {
            log::error!("Failed to copy history from {} to {}: {}", src, dst, e);
        }
    }

    /// Forgets all history at or below `root`. Blobs are deleted by the
    /// next cleanup.
    pub fn remove(&self, root: &HistoryPath) {
        let mut inner = self.inner.lock();
        let Inner { tree, pending, .. } = &mut *inner;
        let mut drop_entry = |entry: &mut HistoryEntry, _: &mut Batch| {
            pending.extend(entry.ids());
            entry.delete();
            Visit::Continue
        };
        if let Err(e) = tree.accept(&mut drop_entry, root, Depth::Infinite) {
            log::error!("Failed to remove history under {}: {}", root, e);
        }
    }

    /// Applies the retention policy to the whole tree and deletes blobs no
    /// longer referenced. Failures are logged; the next run picks up where
    /// this one stopped.
    pub fn clean(&self) {
        let start = Instant::now();
        let mut inner = self.inner.lock();
        let Inner {
            tree,
            pending,
            policy,
        } = &mut *inner;

        let cutoff = policy.cutoff();
        let mut visited = 0usize;
        let mut live = Vec::new();
        let mut sweep = |entry: &mut HistoryEntry, _: &mut Batch| {
            visited += entry.len();
            apply_policy(entry, cutoff, pending);
            live.extend(entry.ids());
            Visit::Continue
        };
        if let Err(e) = tree.accept(&mut sweep, &HistoryPath::root(), Depth::Infinite) {
            log::error!("Problems cleaning up history store: {}", e);
            return;
        }
        log::debug!(
            "Applied history policy to {} states in {}ms",
            visited,
            start.elapsed().as_millis()
        );

        let start = Instant::now();
        let doomed = reconcile(live, mem::take(pending));
        let removed = self.blobs.delete_blobs(&doomed);
        log::debug!(
            "Removed {} of {} unreferenced blobs in {}ms",
            removed,
            doomed.len(),
            start.elapsed().as_millis()
        );
    }

    /// Drops from the pending set every blob still referenced anywhere, then
    /// deletes the rest.
    pub fn remove_garbage(&self) {
        let mut inner = self.inner.lock();
        let Inner { tree, pending, .. } = &mut *inner;

        let mut live = Vec::new();
        let mut gather = |entry: &mut HistoryEntry, _: &mut Batch| {
            live.extend(entry.ids());
            Visit::Continue
        };
        if let Err(e) = tree.accept(&mut gather, &HistoryPath::root(), Depth::Infinite) {
            log::error!("Problems cleaning up history store: {}", e);
            return;
        }
        let doomed = reconcile(live, mem::take(pending));
        let removed = self.blobs.delete_blobs(&doomed);
        log::debug!("Garbage collection removed {} blobs", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> HistoryStore {
        let tree = BucketTree::open(dir.path().join("buckets")).unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs"), Some(3));
        HistoryStore::new(tree, blobs, HistoryPolicy::default())
    }

    fn record(store: &HistoryStore, dir: &TempDir, path: &str, content: &str, ts: i64) -> FileState {
        let local = dir.path().join("scratch");
        fs::write(&local, content).unwrap();
        store
            .add_state(
                &HistoryPath::new(path),
                &local,
                FileInfo::new(content.len() as u64, ts),
                false,
            )
            .unwrap()
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_states_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let t = now();
        record(&store, &dir, "/p/a.txt", "one", t - 2);
        record(&store, &dir, "/p/a.txt", "two", t - 1);

        let states = store.get_states(&HistoryPath::new("/p/a.txt"));
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].timestamp(), t - 1);
        assert!(store.get_states(&HistoryPath::new("/p/b.txt")).is_empty());
    }

    #[test]
    fn test_oversized_file_is_declined() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set_policy(HistoryPolicy {
            max_file_state_size: 3,
            ..HistoryPolicy::default()
        });
        let local = dir.path().join("big");
        fs::write(&local, "four").unwrap();

        let path = HistoryPath::new("/p/big");
        assert!(store
            .add_state(&path, &local, FileInfo::new(4, now()), false)
            .is_none());
        assert!(store.get_states(&path).is_empty());
    }

    #[test]
    fn test_copy_onto_self_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        record(&store, &dir, "/p/a.txt", "x", now());

        let a = Resource::file("/p/a.txt");
        store.copy_history(&a, &a, false);
        assert_eq!(store.get_states(&a.path).len(), 1);
    }

    #[test]
    fn test_copy_project_into_folder_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        record(&store, &dir, "/p/a.txt", "x", now());

        store.copy_history(&Resource::project("/p"), &Resource::folder("/q/sub"), false);
        assert!(store.get_states(&HistoryPath::new("/q/sub/a.txt")).is_empty());
    }

    #[test]
    fn test_remove_queues_blobs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        record(&store, &dir, "/p/a.txt", "x", now());
        record(&store, &dir, "/p/b.txt", "y", now());

        store.remove(&HistoryPath::new("/p"));
        assert_eq!(store.pending_removals(), 2);
        assert!(store.all_files(&HistoryPath::root(), Depth::Infinite).is_empty());
    }

    #[test]
    fn test_remove_garbage_spares_referenced_blobs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let state = record(&store, &dir, "/p/a.txt", "x", now());

        // The copy shares blobs with the source; dropping the source must
        // not take the copy's content with it.
        store.copy_history(&Resource::file("/p/a.txt"), &Resource::file("/p/b.txt"), false);
        store.remove(&HistoryPath::new("/p/a.txt"));
        assert_eq!(store.pending_removals(), 1);

        store.remove_garbage();
        assert_eq!(store.pending_removals(), 0);
        assert!(store.exists(&state));
        assert_eq!(store.get_states(&HistoryPath::new("/p/b.txt")).len(), 1);
    }

    #[test]
    fn test_shutdown_persists() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir);
            record(&store, &dir, "/p/a.txt", "x", now());
            store.shutdown().unwrap();
        }
        let store = store(&dir);
        assert_eq!(store.get_states(&HistoryPath::new("/p/a.txt")).len(), 1);
    }

    fn blob_files(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join("blobs"))
            .unwrap()
            .map(|shard| fs::read_dir(shard.unwrap().path()).unwrap().count())
            .sum()
    }

    fn store_with_corrupt_bucket(dir: &TempDir, folder: &str) -> HistoryStore {
        let db = sled::open(dir.path().join("buckets")).unwrap();
        db.open_tree(tree::BUCKETS_TREE)
            .unwrap()
            .insert(folder, "not json")
            .unwrap();
        let tree = BucketTree::new(&db).unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs"), Some(3));
        HistoryStore::new(tree, blobs, HistoryPolicy::default())
    }

    #[test]
    fn test_root_state_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let local = dir.path().join("scratch");
        fs::write(&local, "x").unwrap();

        let state = store.add_state(&HistoryPath::root(), &local, FileInfo::new(1, now()), true);
        assert!(state.is_none());
        assert!(local.exists());
        assert_eq!(store.pending_removals(), 0);
        assert!(store.all_files(&HistoryPath::root(), Depth::Infinite).is_empty());
    }

    #[test]
    fn test_unindexed_state_leaves_no_blob() {
        let dir = TempDir::new().unwrap();
        let store = store_with_corrupt_bucket(&dir, "/a");
        let local = dir.path().join("scratch");
        fs::write(&local, "x").unwrap();

        let path = HistoryPath::new("/a/x.txt");
        assert!(store
            .add_state(&path, &local, FileInfo::new(1, now()), false)
            .is_none());
        assert_eq!(blob_files(&dir), 0);
    }

    #[test]
    fn test_unreadable_bucket_has_no_states() {
        let dir = TempDir::new().unwrap();
        let store = store_with_corrupt_bucket(&dir, "/a");
        assert!(store.get_states(&HistoryPath::new("/a/x.txt")).is_empty());
    }

    #[test]
    fn test_clean_survives_unreadable_bucket() {
        let dir = TempDir::new().unwrap();
        let store = store_with_corrupt_bucket(&dir, "/a");
        let state = record(&store, &dir, "/z/f.txt", "x", now());

        store.remove(&HistoryPath::new("/z"));
        assert_eq!(store.pending_removals(), 1);

        store.clean();
        assert_eq!(store.pending_removals(), 0);
        assert!(!store.exists(&state));
    }
}
