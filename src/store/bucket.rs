use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::HistoryPath;

/// One recorded version of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub timestamp: i64,
    pub id: Uuid,
}

/// The history of a single path.
///
/// Occurrences are kept newest first: index 0 has the greatest timestamp and,
/// among equal timestamps, the most recent insertion wins the lower index.
/// Retention relies on this ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    path: HistoryPath,
    occurrences: Vec<Occurrence>,
}

impl HistoryEntry {
    pub fn new(path: HistoryPath) -> Self {
        Self {
            path,
            occurrences: Vec::new(),
        }
    }

    /// Copy of `other`'s occurrences addressed to a different path.
    pub fn rebased(path: HistoryPath, other: &HistoryEntry) -> Self {
        Self {
            path,
            occurrences: other.occurrences.clone(),
        }
    }

    pub fn path(&self) -> &HistoryPath {
        &self.path
    }

    pub fn occurrences(&self) -> &[Occurrence] {
        &self.occurrences
    }

    pub fn len(&self) -> usize {
        self.occurrences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }

    pub fn timestamp(&self, i: usize) -> i64 {
        self.occurrences[i].timestamp
    }

    pub fn id(&self, i: usize) -> Uuid {
        self.occurrences[i].id
    }

    pub fn ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.occurrences.iter().map(|o| o.id)
    }

    /// Inserts at the ordered position. A content id already present is
    /// ignored. Returns whether anything changed.
    pub fn add(&mut self, id: Uuid, timestamp: i64) -> bool {
        if self.occurrences.iter().any(|o| o.id == id) {
            return false;
        }
        let at = self
            .occurrences
            .iter()
            .position(|o| o.timestamp <= timestamp)
            .unwrap_or(self.occurrences.len());
        self.occurrences.insert(at, Occurrence { timestamp, id });
        true
    }

    /// Merges every occurrence of `other`, accumulating rather than replacing.
    pub fn merge(&mut self, other: &HistoryEntry) -> bool {
        let mut changed = false;
        for o in &other.occurrences {
            changed |= self.add(o.id, o.timestamp);
        }
        changed
    }

    /// Removes the `i`-th occurrence; later indices shift down by one.
    pub fn delete_occurrence(&mut self, i: usize) -> Occurrence {
        self.occurrences.remove(i)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize, &Occurrence) -> bool,
    {
        let mut i = 0;
        self.occurrences.retain(|o| {
            let k = keep(i, o);
            i += 1;
            k
        });
    }

    /// Drops every occurrence. An empty entry vanishes when its bucket is saved.
    pub fn delete(&mut self) {
        self.occurrences.clear();
    }
}

/// All history entries for files directly inside one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBucket {
    #[serde(skip)]
    folder: HistoryPath,
    entries: BTreeMap<String, HistoryEntry>,
    #[serde(skip)]
    dirty: bool,
}

impl HistoryBucket {
    pub fn new(folder: HistoryPath) -> Self {
        Self {
            folder,
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    pub(crate) fn with_folder(mut self, folder: HistoryPath) -> Self {
        self.folder = folder;
        self
    }

    pub fn folder(&self) -> &HistoryPath {
        &self.folder
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Number of entries with at least one occurrence.
    pub fn entry_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_empty()).count()
    }

    pub fn get_entry(&self, path: &HistoryPath) -> Option<&HistoryEntry> {
        if path.parent() != self.folder {
            return None;
        }
        path.last_segment().and_then(|name| self.entries.get(name))
    }

    /// Records one occurrence for `path`, creating its entry if needed.
    /// Returns `false` when `path` cannot live in this bucket.
    pub fn add_blob(&mut self, path: &HistoryPath, id: Uuid, timestamp: i64) -> bool {
        let Some(entry) = self.entry_mut(path) else {
            return false;
        };
        if entry.add(id, timestamp) {
            self.dirty = true;
        }
        true
    }

    /// Merges a foreign entry into the entry at the same path. Returns
    /// `false` when that path cannot live in this bucket.
    pub fn add_blobs(&mut self, other: &HistoryEntry) -> bool {
        let Some(entry) = self.entry_mut(other.path()) else {
            return false;
        };
        if entry.merge(other) {
            self.dirty = true;
        }
        true
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut HistoryEntry> {
        self.entries.values_mut()
    }

    pub(crate) fn prune(&mut self) {
        self.entries.retain(|_, e| !e.is_empty());
    }

    fn entry_mut(&mut self, path: &HistoryPath) -> Option<&mut HistoryEntry> {
        if path.parent() != self.folder {
            log::error!(
                "Entry {} does not belong to bucket {}",
                path,
                self.folder
            );
            return None;
        }
        let name = path.last_segment()?.to_string();
        Some(
            self.entries
                .entry(name)
                .or_insert_with(|| HistoryEntry::new(path.clone())),
        )
    }
}
