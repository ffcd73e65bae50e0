//! Concrete filesystem actions derived from a change set against the live tree.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::warn;

use super::{Change, ChangeSet};
use crate::fs::metadata::{set_mode, set_owner, PERM_MASK};
use crate::fs::ops::remove_any;
use crate::fs::{depth, lstat, rooted};
use crate::userdb::IdMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Chown { path: String, uid: u32, gid: u32 },
    Chmod { path: String, mode: u32 },
    Remove { path: String },
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Action::Chown { path, .. } | Action::Chmod { path, .. } | Action::Remove { path } => {
                path
            }
        }
    }

    /// Perform the action on the tree mounted at `root`
    pub fn apply(&self, root: &Path) -> io::Result<()> {
        let physical = rooted(root, self.path());
        match self {
            Action::Chown { uid, gid, .. } => set_owner(&physical, *uid, *gid),
            Action::Chmod { mode, .. } => set_mode(&physical, *mode),
            Action::Remove { .. } => remove_any(&physical).map(|_| ()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Chown { path, uid, gid } => write!(f, "chown -h {}:{} {}", uid, gid, path),
            Action::Chmod { path, mode } => write!(f, "chmod {:o} {}", mode & PERM_MASK, path),
            Action::Remove { path } => write!(f, "rm -rf {}", path),
        }
    }
}

/// Live metadata of `path`; `None` when it is gone or cannot be read
fn live_metadata(root: &Path, path: &str) -> Option<Metadata> {
    match lstat(root, path) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("Skipping {}: {}", path, e);
            None
        }
    }
}

impl ChangeSet {
    /// Ownership and permission fixes needed on the live tree.
    ///
    /// `StatFix` changes are brought to their recorded (remapped) ids and
    /// permissions; overlaid files only get their ids remapped. Paths that do
    /// not exist or cannot be examined are skipped.
    pub fn statfixes(&self, root: &Path, uidmap: &IdMap, gidmap: &IdMap) -> Vec<Action> {
        let mut actions = Vec::new();

        for change in self {
            let Some(live) = live_metadata(root, change.path()) else {
                continue;
            };

            match change {
                Change::StatFix {
                    path,
                    mode,
                    uid,
                    gid,
                } => {
                    let uid = uidmap.get(uid).copied().unwrap_or(*uid);
                    let gid = gidmap.get(gid).copied().unwrap_or(*gid);
                    if live.uid() != uid || live.gid() != gid {
                        actions.push(Action::Chown {
                            path: path.clone(),
                            uid,
                            gid,
                        });
                    }
                    if !live.file_type().is_symlink() && live.mode() & PERM_MASK != mode & PERM_MASK
                    {
                        actions.push(Action::Chmod {
                            path: path.clone(),
                            mode: mode & PERM_MASK,
                        });
                    }
                }
                Change::Overlay(path) => {
                    if uidmap.contains_key(&live.uid()) || gidmap.contains_key(&live.gid()) {
                        actions.push(Action::Chown {
                            path: path.clone(),
                            uid: uidmap.get(&live.uid()).copied().unwrap_or(live.uid()),
                            gid: gidmap.get(&live.gid()).copied().unwrap_or(live.gid()),
                        });
                    }
                }
                Change::Delete(_) => {}
            }
        }

        actions
    }

    /// Removals for deleted paths that still exist, deepest first
    pub fn deleted(&self, root: &Path) -> Vec<Action> {
        let mut paths = Vec::new();
        for change in self {
            if let Change::Delete(path) = change {
                if live_metadata(root, path).is_some() {
                    paths.push(path.clone());
                }
            }
        }

        paths.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
        paths.into_iter().map(|path| Action::Remove { path }).collect()
    }
}
