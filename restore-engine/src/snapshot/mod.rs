//! Directory metadata snapshots.
//!
//! A `Snapshot` maps absolute logical paths to the metadata recorded for them
//! (a "dirindex"). Iteration is always in path order so encoding is
//! deterministic.

pub mod codec;

pub use codec::{decode, decode_as, encode, encode_as, read_file, write_file, SnapshotFormat};

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::fs::metadata::{is_dir_mode, is_symlink_mode, read_record, S_IFMT};
use crate::fs::{is_gone, rooted};
use crate::fs::walker::walk_logical;
use crate::limits::PathFilter;

/// Metadata recorded for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    /// Seconds since the epoch
    pub mtime: u64,
    pub symlink: Option<String>,
}

impl Record {
    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }

    pub fn is_symlink(&self) -> bool {
        is_symlink_mode(self.mode)
    }

    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    /// Same file type, size, mtime and link target. Directory size and mtime
    /// change whenever their entries do, so directories only compare by type.
    pub fn same_content(&self, other: &Record) -> bool {
        if self.file_type() != other.file_type() {
            return false;
        }
        if self.is_dir() {
            return true;
        }
        self.size == other.size && self.mtime == other.mtime && self.symlink == other.symlink
    }

    /// Same mode, uid and gid
    pub fn same_stat(&self, other: &Record) -> bool {
        self.mode == other.mode && self.uid == other.uid && self.gid == other.gid
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: BTreeMap<String, Record>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaced
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.path.clone(), record)
    }

    pub fn get(&self, path: &str) -> Option<&Record> {
        self.records.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in path order
    pub fn iter(&self) -> btree_map::Values<'_, String, Record> {
        self.records.values()
    }

    pub fn paths(&self) -> btree_map::Keys<'_, String, Record> {
        self.records.keys()
    }

    /// Snapshot the live tree below each of `roots` (logical paths under
    /// `root`), keeping entries the filter admits.
    pub fn from_walk<S: AsRef<str>>(
        root: &Path,
        roots: &[S],
        filter: &PathFilter,
    ) -> io::Result<Self> {
        let mut snapshot = Snapshot::new();
        for start in roots {
            walk_logical(root, start.as_ref(), filter, |entry| {
                snapshot.insert(read_record(&entry.path, &entry.logical)?);
                Ok(())
            })?;
        }

        debug!("Snapshot of {} paths under {}", snapshot.len(), root.display());
        Ok(snapshot)
    }

    /// Snapshot exactly the given logical paths, skipping those that do not
    /// exist under `root`. A path that cannot be read is left out with a
    /// warning.
    pub fn from_paths<I, S>(root: &Path, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = Snapshot::new();
        for path in paths {
            let path = path.as_ref();
            match read_record(&rooted(root, path), path) {
                Ok(record) => {
                    snapshot.insert(record);
                }
                Err(e) if is_gone(&e) => {}
                Err(e) => warn!("Leaving {} out of the snapshot: {}", path, e),
            }
        }
        snapshot
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = btree_map::Values<'a, String, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.values()
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}
