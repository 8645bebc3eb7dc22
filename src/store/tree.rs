use std::path::Path;

use uuid::Uuid;

use super::bucket::{HistoryBucket, HistoryEntry};
use crate::error::{HistoryError, Result};
use crate::path::HistoryPath;

pub(crate) const BUCKETS_TREE: &str = "history_buckets";

/// How far below the root a traversal reaches. `Zero` visits only the root
/// path itself, `One` adds its direct children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinite,
}

impl Depth {
    fn allows(self, levels: usize) -> bool {
        match self {
            Depth::Zero => levels == 0,
            Depth::One => levels <= 1,
            Depth::Infinite => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// Entries a visitor wants merged into the tree.
///
/// The bucket being iterated cannot change shape mid-iteration, so these are
/// applied only after it has been saved. Each entry is merged into the bucket
/// owning its own path.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<HistoryEntry>,
}

impl Batch {
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait Visitor {
    /// Called once per non-empty entry. The entry's occurrences may be edited
    /// in place (including clearing them); new entries go through `batch`.
    fn visit(&mut self, entry: &mut HistoryEntry, batch: &mut Batch) -> Visit;
}

impl<F> Visitor for F
where
    F: FnMut(&mut HistoryEntry, &mut Batch) -> Visit,
{
    fn visit(&mut self, entry: &mut HistoryEntry, batch: &mut Batch) -> Visit {
        self(entry, batch)
    }
}

/// Persistent forest of per-folder buckets.
///
/// Each bucket is one key in a sled tree, keyed by its folder path. Only one
/// bucket is held in memory at a time; switching buckets saves the previous
/// one first.
pub struct BucketTree {
    buckets: sled::Tree,
    current: Option<HistoryBucket>,
}

impl BucketTree {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| HistoryError::database(path.display(), e))?;
        Self::new(&db)
    }

    pub fn new(db: &sled::Db) -> Result<Self> {
        let buckets = db
            .open_tree(BUCKETS_TREE)
            .map_err(|e| HistoryError::database(BUCKETS_TREE, e))?;
        Ok(Self {
            buckets,
            current: None,
        })
    }

    /// Makes the bucket for `path`'s folder current and returns it.
    ///
    /// If saving the old bucket or reading the new one fails, the previous
    /// bucket stays current.
    pub fn load_bucket_for(&mut self, path: &HistoryPath) -> Result<&mut HistoryBucket> {
        self.load_folder(&path.parent())
    }

    pub fn current(&self) -> Option<&HistoryBucket> {
        self.current.as_ref()
    }

    /// Persists the current bucket if it changed.
    pub fn save(&mut self) -> Result<()> {
        let Some(bucket) = self.current.as_mut() else {
            return Ok(());
        };
        if !bucket.is_dirty() {
            return Ok(());
        }
        bucket.prune();
        write(&self.buckets, bucket)?;
        bucket.mark_clean();
        Ok(())
    }

    /// Walks every entry at or below `root`, limited by `depth`.
    ///
    /// Per bucket: visit its entries, save it, then apply the visitor's
    /// batch. Buckets created by a batch during the walk are not visited.
    /// A bucket that cannot be decoded is logged and skipped so one bad
    /// record does not stall every sweep.
    pub fn accept<V: Visitor + ?Sized>(
        &mut self,
        visitor: &mut V,
        root: &HistoryPath,
        depth: Depth,
    ) -> Result<()> {
        self.save()?;
        let folders = self.folders_under(root, depth)?;

        for folder in folders {
            let mut batch = Batch::default();
            let mut verdict = Visit::Continue;

            let bucket = match self.load_folder(&folder) {
                Ok(bucket) => bucket,
                Err(e @ HistoryError::Codec { .. }) => {
                    log::error!("Skipping unreadable history bucket: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut changed = false;
            for entry in bucket.entries_mut() {
                if entry.is_empty() || !root.is_prefix_of(entry.path()) {
                    continue;
                }
                if !depth.allows(entry.path().segment_count() - root.segment_count()) {
                    continue;
                }
                let before = entry.len();
                verdict = visitor.visit(entry, &mut batch);
                changed |= entry.len() != before;
                if verdict == Visit::Stop {
                    break;
                }
            }
            if changed {
                bucket.mark_dirty();
            }

            self.save()?;
            self.apply(batch)?;

            if verdict == Visit::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Drops every persisted entry at or below `root` without visiting it,
    /// returning the content ids those entries referenced.
    pub fn flush(&mut self, root: &HistoryPath) -> Result<Vec<Uuid>> {
        self.save()?;
        self.current = None;

        let mut orphans = Vec::new();
        for folder in self.folders_under(root, Depth::Infinite)? {
            let mut bucket = match self.read(&folder) {
                Ok(bucket) => bucket,
                Err(e @ HistoryError::Codec { .. }) => {
                    log::error!("Skipping unreadable history bucket: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut touched = false;
            for entry in bucket.entries_mut() {
                if root.is_prefix_of(entry.path()) && !entry.is_empty() {
                    orphans.extend(entry.ids());
                    entry.delete();
                    touched = true;
                }
            }
            if touched {
                bucket.prune();
                write(&self.buckets, &bucket)?;
            }
        }
        Ok(orphans)
    }

    /// Saves and releases the current bucket, then syncs the database.
    pub fn close(&mut self) -> Result<()> {
        self.save()?;
        self.current = None;
        self.buckets
            .flush()
            .map_err(|e| HistoryError::database(BUCKETS_TREE, e))?;
        Ok(())
    }

    fn load_folder(&mut self, folder: &HistoryPath) -> Result<&mut HistoryBucket> {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|b| b.folder() == folder);
        if !is_current {
            self.save()?;
            let bucket = self.read(folder)?;
            self.current = Some(bucket);
        }
        Ok(self
            .current
            .get_or_insert_with(|| HistoryBucket::new(folder.clone())))
    }

    fn read(&self, folder: &HistoryPath) -> Result<HistoryBucket> {
        let key = folder.to_string();
        let raw = self
            .buckets
            .get(key.as_bytes())
            .map_err(|e| HistoryError::database(&key, e))?;
        match raw {
            Some(bytes) => {
                let bucket: HistoryBucket =
                    serde_json::from_slice(&bytes).map_err(|e| HistoryError::Codec {
                        path: folder.clone(),
                        source: e,
                    })?;
                Ok(bucket.with_folder(folder.clone()))
            }
            None => Ok(HistoryBucket::new(folder.clone())),
        }
    }

    /// Folders whose buckets may hold entries in scope of a walk from `root`.
    /// The root's own folder comes first since `root` may itself be a file.
    fn folders_under(&self, root: &HistoryPath, depth: Depth) -> Result<Vec<HistoryPath>> {
        let mut folders = Vec::new();
        if !root.is_root() {
            let parent = root.parent();
            if self.contains(&parent)? {
                folders.push(parent);
            }
        }

        let prefix = if root.is_root() {
            String::from("/")
        } else {
            root.to_string()
        };
        for item in self.buckets.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(|e| HistoryError::database(&prefix, e))?;
            let folder = HistoryPath::new(&String::from_utf8_lossy(&key));
            if !root.is_prefix_of(&folder) {
                continue;
            }
            // Entries in `folder` sit one level below it.
            if depth.allows(folder.segment_count() + 1 - root.segment_count()) {
                folders.push(folder);
            }
        }
        Ok(folders)
    }

    fn contains(&self, folder: &HistoryPath) -> Result<bool> {
        let key = folder.to_string();
        self.buckets
            .contains_key(key.as_bytes())
            .map_err(|e| HistoryError::database(&key, e))
    }

    fn apply(&mut self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for entry in &batch.entries {
            if !self.load_bucket_for(entry.path())?.add_blobs(entry) {
                log::error!("Dropped history for {}: no bucket can hold it", entry.path());
            }
        }
        self.save()
    }
}

/// Stores `bucket` under its folder key; an empty bucket is removed instead.
fn write(buckets: &sled::Tree, bucket: &HistoryBucket) -> Result<()> {
    let key = bucket.folder().to_string();
    let result = if bucket.entry_count() == 0 {
        buckets.remove(key.as_bytes()).map(|_| ())
    } else {
        let value = serde_json::to_vec(bucket).map_err(|e| HistoryError::Codec {
            path: bucket.folder().clone(),
            source: e,
        })?;
        buckets.insert(key.as_bytes(), value).map(|_| ())
    };
    result.map_err(|e| HistoryError::database(&key, e))
}
