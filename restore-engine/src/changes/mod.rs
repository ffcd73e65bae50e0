//! Change sets ("fsdelta"): typed differences between two snapshots.
//!
//! Stream format, one change per line, paths escaped:
//!
//! ```text
//! o\t<path>
//! d\t<path>
//! s\t<path>\t<uid>\t<gid>\t<mode octal>
//! ```

mod actions;

pub use actions::Action;

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use crate::limits::PathFilter;
use crate::snapshot::Snapshot;
use crate::utils::errors::FormatError;
use crate::utils::escape::{escape_field, unescape_field};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Content is new or replaced: take the staged copy
    Overlay(String),
    /// Path no longer exists in the backup
    Delete(String),
    /// Same content, different mode or ownership
    StatFix {
        path: String,
        mode: u32,
        uid: u32,
        gid: u32,
    },
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Overlay(path) | Change::Delete(path) => path,
            Change::StatFix { path, .. } => path,
        }
    }

    fn to_line(&self) -> String {
        match self {
            Change::Overlay(path) => format!("o\t{}", escape_field(path)),
            Change::Delete(path) => format!("d\t{}", escape_field(path)),
            Change::StatFix {
                path,
                mode,
                uid,
                gid,
            } => format!("s\t{}\t{}\t{}\t{:o}", escape_field(path), uid, gid, mode),
        }
    }

    fn parse_line(line: &str, number: usize) -> Result<Self, FormatError> {
        let bad = |reason: &str| FormatError::BadLine {
            line: number,
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.split('\t').collect();
        let expected = match fields[0] {
            "o" | "d" => 2,
            "s" => 5,
            tag => return Err(bad(&format!("unknown change tag {:?}", tag))),
        };
        if fields.len() != expected {
            return Err(bad(&format!(
                "expected {} fields, found {}",
                expected,
                fields.len()
            )));
        }

        let path = unescape_field(fields[1]).ok_or_else(|| bad("bad escape in path"))?;
        Ok(match fields[0] {
            "o" => Change::Overlay(path),
            "d" => Change::Delete(path),
            _ => Change::StatFix {
                path,
                uid: fields[2].parse().map_err(|_| bad("bad uid"))?,
                gid: fields[3].parse().map_err(|_| bad("bad gid"))?,
                mode: u32::from_str_radix(fields[4], 8).map_err(|_| bad("bad mode"))?,
            },
        })
    }
}

/// Ordered sequence of changes, sorted by path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(mut changes: Vec<Change>) -> Self {
        changes.sort_by(|a, b| a.path().cmp(b.path()));
        Self { changes }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(Change::path)
    }

    pub fn overlays(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| match c {
            Change::Overlay(path) => Some(path.as_str()),
            _ => None,
        })
    }

    /// The subset of changes whose path the filter admits
    pub fn filter(&self, filter: &PathFilter) -> ChangeSet {
        ChangeSet {
            changes: self
                .changes
                .iter()
                .filter(|c| filter.matches(c.path()))
                .cloned()
                .collect(),
        }
    }

    pub fn to_stream<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for change in &self.changes {
            writeln!(writer, "{}", change.to_line())?;
        }
        writer.flush()
    }

    /// Parse a change stream, keeping only what `filter` admits
    pub fn from_stream<R: BufRead>(
        reader: R,
        filter: Option<&PathFilter>,
    ) -> Result<ChangeSet, FormatError> {
        let mut changes = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let change = Change::parse_line(&line, index + 1)?;
            if filter.map_or(true, |f| f.matches(change.path())) {
                changes.push(change);
            }
        }
        Ok(ChangeSet::new(changes))
    }

    pub fn read_file(path: &Path, filter: Option<&PathFilter>) -> Result<ChangeSet, FormatError> {
        let file = fs::File::open(path)?;
        Self::from_stream(BufReader::new(file), filter)
    }

    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        self.to_stream(io::BufWriter::new(file))
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Changes that turn `old` into `new`
pub fn diff(old: &Snapshot, new: &Snapshot) -> ChangeSet {
    let mut changes = Vec::new();

    for record in new {
        match old.get(&record.path) {
            None => changes.push(Change::Overlay(record.path.clone())),
            Some(prev) if !prev.same_content(record) => {
                changes.push(Change::Overlay(record.path.clone()))
            }
            Some(prev) if !prev.same_stat(record) => changes.push(Change::StatFix {
                path: record.path.clone(),
                mode: record.mode,
                uid: record.uid,
                gid: record.gid,
            }),
            Some(_) => {}
        }
    }

    for record in old {
        if !new.contains(&record.path) {
            changes.push(Change::Delete(record.path.clone()));
        }
    }

    ChangeSet::new(changes)
}

/// Diff `old` against the live tree below `roots`, both restricted to `filter`
pub fn diff_tree<S: AsRef<str>>(
    old: &Snapshot,
    root: &Path,
    roots: &[S],
    filter: &PathFilter,
) -> io::Result<ChangeSet> {
    let new = Snapshot::from_walk(root, roots, filter)?;

    let in_scope = |path: &str| {
        filter.matches(path) && roots.iter().any(|r| is_under(path, r.as_ref()))
    };
    let old: Snapshot = old
        .iter()
        .filter(|r| in_scope(&r.path))
        .cloned()
        .collect();

    Ok(diff(&old, &new))
}

fn is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return true;
    }
    path.strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::{S_IFDIR, S_IFLNK, S_IFREG};
    use crate::snapshot::{decode, encode, Record};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn record(path: &str, mode: u32) -> Record {
        Record {
            path: path.to_string(),
            mode,
            uid: 0,
            gid: 0,
            size: 10,
            mtime: 100,
            symlink: None,
        }
    }

    #[test]
    fn test_deleted_file_scenario() -> Result<(), FormatError> {
        let old: Snapshot = [record("/etc", S_IFDIR | 0o755), record("/etc/foo", S_IFREG | 0o644)]
            .into_iter()
            .collect();
        let mut etc = record("/etc", S_IFDIR | 0o755);
        etc.mtime = 200;
        etc.size = 4096;
        let new: Snapshot = [etc].into_iter().collect();

        let old = decode(&encode(&old))?;
        let new = decode(&encode(&new))?;

        let changes = diff(&old, &new);
        assert_eq!(
            changes.iter().cloned().collect::<Vec<_>>(),
            vec![Change::Delete("/etc/foo".to_string())]
        );
        Ok(())
    }

    #[test]
    fn test_diff_classifies_changes() {
        let mut changed = record("/b", S_IFREG | 0o644);
        changed.size = 11;
        let mut chmodded = record("/c", S_IFREG | 0o600);
        chmodded.uid = 33;
        let mut relinked = record("/d", S_IFLNK | 0o777);
        relinked.symlink = Some("new".to_string());

        let mut old_link = record("/d", S_IFLNK | 0o777);
        old_link.symlink = Some("old".to_string());

        let old: Snapshot = [
            record("/b", S_IFREG | 0o644),
            record("/c", S_IFREG | 0o644),
            old_link,
            record("/gone", S_IFREG | 0o644),
        ]
        .into_iter()
        .collect();
        let new: Snapshot = [record("/a", S_IFREG | 0o644), changed, chmodded, relinked]
            .into_iter()
            .collect();

        let changes: Vec<_> = diff(&old, &new).iter().cloned().collect();
        assert_eq!(
            changes,
            vec![
                Change::Overlay("/a".to_string()),
                Change::Overlay("/b".to_string()),
                Change::StatFix {
                    path: "/c".to_string(),
                    mode: S_IFREG | 0o600,
                    uid: 33,
                    gid: 0
                },
                Change::Overlay("/d".to_string()),
                Change::Delete("/gone".to_string()),
            ]
        );
    }

    #[test]
    fn test_stream_roundtrip_and_filter() -> Result<(), FormatError> {
        let changes = ChangeSet::new(vec![
            Change::Delete("/var/log/old".to_string()),
            Change::Overlay("/etc/odd\tname".to_string()),
            Change::StatFix {
                path: "/srv".to_string(),
                mode: S_IFDIR | 0o750,
                uid: 1000,
                gid: 1000,
            },
        ]);

        let mut buf = Vec::new();
        changes.to_stream(&mut buf)?;

        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("s\t/srv\t1000\t1000\t40750\n"));

        let parsed = ChangeSet::from_stream(Cursor::new(&buf), None)?;
        assert_eq!(parsed, changes);

        let filter = PathFilter::new(["-/var/log"]);
        let filtered = ChangeSet::from_stream(Cursor::new(&buf), Some(&filter))?;
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered, changes.filter(&filter));
        Ok(())
    }

    #[test]
    fn test_stream_keeps_trailing_carriage_return() -> Result<(), FormatError> {
        let changes = ChangeSet::new(vec![Change::Delete("/tmp/name\r".to_string())]);

        let mut buf = Vec::new();
        changes.to_stream(&mut buf)?;
        assert_eq!(buf, b"d\t/tmp/name\\r\n");

        let parsed = ChangeSet::from_stream(Cursor::new(&buf), None)?;
        assert_eq!(parsed, changes);
        Ok(())
    }

    #[test]
    fn test_stream_rejects_bad_lines() {
        for input in ["x\t/path\n", "o\t/a\textra\n", "s\t/a\t1\t2\n", "s\t/a\tx\t2\t644\n"] {
            let result = ChangeSet::from_stream(Cursor::new(input), None);
            assert!(
                matches!(result, Err(FormatError::BadLine { line: 1, .. })),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_diff_tree() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("srv"))?;
        fs::write(temp_dir.path().join("srv/new"), b"n")?;

        let old: Snapshot = [
            record("/srv/removed", S_IFREG | 0o644),
            record("/opt/outside", S_IFREG | 0o644),
        ]
        .into_iter()
        .collect();

        let changes = diff_tree(&old, temp_dir.path(), &["/srv"], &PathFilter::default())?;
        let paths: Vec<_> = changes.paths().collect();

        assert!(paths.contains(&"/srv/new"));
        assert!(paths.contains(&"/srv/removed"));
        assert!(!paths.contains(&"/opt/outside"));
        Ok(())
    }
}
