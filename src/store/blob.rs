use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use uuid::Uuid;

use crate::error::{HistoryError, Result};

const COMPRESSED_SUFFIX: &str = "zst";

/// File-per-blob content store.
///
/// Every blob gets a fresh id on insertion; identical contents are stored
/// twice. Blobs live in 256 shard directories keyed by the first id byte.
pub struct BlobStore {
    root: PathBuf,
    compression_level: Option<i32>,
}

impl BlobStore {
    pub fn new<P: Into<PathBuf>>(root: P, compression_level: Option<i32>) -> Self {
        Self {
            root: root.into(),
            compression_level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ingests the file at `source`. With `move_ownership` the source is
    /// consumed: renamed into place when stored raw, removed after writing
    /// when compressed.
    pub fn add_blob(&self, source: &Path, move_ownership: bool) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let dir = self.shard_dir(&id);
        fs::create_dir_all(&dir).map_err(|e| HistoryError::storage("create", &dir, e))?;

        let target = self.location(&id, self.compression_level.is_some());
        let temp = target.with_extension("tmp");

        let written = match self.compression_level {
            Some(level) => File::open(source)
                .map_err(|e| HistoryError::storage("read", source, e))
                .and_then(|input| {
                    let output = File::create(&temp)
                        .map_err(|e| HistoryError::storage("write", &temp, e))?;
                    zstd::stream::copy_encode(BufReader::new(input), output, level)
                        .map_err(|e| HistoryError::storage("compress", source, e))
                }),
            // Different filesystem; fall back to copying.
            None if move_ownership && fs::rename(source, &temp).is_ok() => Ok(()),
            None => fs::copy(source, &temp)
                .map(|_| ())
                .map_err(|e| HistoryError::storage("copy", source, e)),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        fs::rename(&temp, &target).map_err(|e| {
            let _ = fs::remove_file(&temp);
            HistoryError::storage("rename", &target, e)
        })?;

        if move_ownership && source.exists() {
            if let Err(e) = fs::remove_file(source) {
                log::warn!("Could not remove moved source {}: {}", source.display(), e);
            }
        }
        Ok(id)
    }

    /// Opens the blob for streaming, decompressing if it was stored compressed.
    pub fn get_blob(&self, id: &Uuid) -> Result<Box<dyn Read + Send>> {
        let path = self.file_for(id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HistoryError::BlobNotFound(*id))
            }
            Err(e) => return Err(HistoryError::storage("read", &path, e)),
        };
        if is_compressed(&path) {
            let decoder = zstd::stream::read::Decoder::new(file)
                .map_err(|e| HistoryError::storage("decompress", &path, e))?;
            Ok(Box::new(decoder))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Location of the stored object for `id`. When no object exists yet,
    /// returns where one would be written under the current settings.
    pub fn file_for(&self, id: &Uuid) -> PathBuf {
        let compressed = self.location(id, true);
        let raw = self.location(id, false);
        if compressed.exists() {
            compressed
        } else if raw.exists() {
            raw
        } else {
            self.location(id, self.compression_level.is_some())
        }
    }

    pub fn exists(&self, id: &Uuid) -> bool {
        self.file_for(id).exists()
    }

    /// Best-effort removal. Each blob is attempted on its own; failures are
    /// logged. Returns how many blobs were actually removed.
    pub fn delete_blobs(&self, ids: &HashSet<Uuid>) -> usize {
        ids.par_iter()
            .filter(|id| {
                let path = self.file_for(id);
                match fs::remove_file(&path) {
                    Ok(()) => true,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                    Err(e) => {
                        log::warn!("Failed to delete blob {}: {}", path.display(), e);
                        false
                    }
                }
            })
            .count()
    }

    fn shard_dir(&self, id: &Uuid) -> PathBuf {
        self.root.join(format!("{:02x}", id.as_bytes()[0]))
    }

    fn location(&self, id: &Uuid, compressed: bool) -> PathBuf {
        let name = id.simple().to_string();
        let path = self.shard_dir(id).join(name);
        if compressed {
            path.with_extension(COMPRESSED_SUFFIX)
        } else {
            path
        }
    }
}

fn is_compressed(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(COMPRESSED_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(store: &BlobStore, id: &Uuid) -> Vec<u8> {
        let mut buf = Vec::new();
        store.get_blob(id).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_copy_in_keeps_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"hello").unwrap();

        let store = BlobStore::new(dir.path().join("blobs"), None);
        let id = store.add_blob(&src, false).unwrap();

        assert!(src.exists());
        assert!(store.exists(&id));
        assert_eq!(read_all(&store, &id), b"hello");
    }

    #[test]
    fn test_move_in_compressed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"some text that compresses, some text that compresses").unwrap();

        let store = BlobStore::new(dir.path().join("blobs"), Some(3));
        let id = store.add_blob(&src, true).unwrap();

        assert!(!src.exists());
        assert!(is_compressed(&store.file_for(&id)));
        assert_eq!(
            read_all(&store, &id),
            b"some text that compresses, some text that compresses"
        );
    }

    #[test]
    fn test_same_content_gets_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"same").unwrap();

        let store = BlobStore::new(dir.path().join("blobs"), None);
        let a = store.add_blob(&src, false).unwrap();
        let b = store.add_blob(&src, false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path(), None);
        let err = store.get_blob(&Uuid::new_v4()).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"x").unwrap();

        let store = BlobStore::new(dir.path().join("blobs"), Some(1));
        let kept = store.add_blob(&src, false).unwrap();
        let gone = store.add_blob(&src, false).unwrap();

        let mut ids = HashSet::new();
        ids.insert(gone);
        ids.insert(Uuid::new_v4()); // never existed
        assert_eq!(store.delete_blobs(&ids), 1);
        assert!(!store.exists(&gone));
        assert!(store.exists(&kept));
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("not-a-file");
        fs::create_dir(&src).unwrap();

        let store = BlobStore::new(dir.path().join("blobs"), Some(3));
        assert!(store.add_blob(&src, false).is_err());

        let leftovers: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .flat_map(|shard| fs::read_dir(shard.unwrap().path()).unwrap())
            .map(|f| f.unwrap().path())
            .collect();
        assert!(leftovers.is_empty(), "left behind {:?}", leftovers);
    }
}
