//! Merging of `passwd` and `group` databases.
//!
//! The backed-up databases are merged into the live ones. Accounts present
//! on both sides keep the live id, backup-only accounts are added (and
//! renumbered if their id is taken), live-only accounts are kept. Every
//! renumbering is recorded in an id map so file ownership can be fixed up.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::utils::errors::IdentityMergeError;

/// Old (backup) id -> new (merged) id
pub type IdMap = HashMap<u32, u32>;

type Result<T> = std::result::Result<T, IdentityMergeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Passwd,
    Group,
}

impl DbKind {
    fn field_count(self) -> usize {
        match self {
            DbKind::Passwd => 7,
            DbKind::Group => 4,
        }
    }

    fn file(self) -> &'static str {
        match self {
            DbKind::Passwd => "passwd",
            DbKind::Group => "group",
        }
    }
}

/// One `:`-separated line; field 2 is the id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    fields: Vec<String>,
    id: u32,
}

impl Entry {
    fn parse(kind: DbKind, line: &str) -> Result<Self> {
        let fields: Vec<String> = line.split(':').map(str::to_string).collect();
        if fields.len() != kind.field_count() {
            return Err(IdentityMergeError::FieldCount {
                file: kind.file(),
                line: line.to_string(),
                expected: kind.field_count(),
                found: fields.len(),
            });
        }

        let bad_id = || IdentityMergeError::BadId {
            file: kind.file(),
            line: line.to_string(),
        };
        let id = fields[2].parse().map_err(|_| bad_id())?;
        if kind == DbKind::Passwd {
            fields[3].parse::<u32>().map_err(|_| bad_id())?;
        }

        Ok(Self { fields, id })
    }

    pub fn name(&self) -> &str {
        &self.fields[0]
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
        self.fields[2] = id.to_string();
    }

    fn rename(&mut self, name: String) {
        self.fields[0] = name;
    }

    /// Primary group of a passwd entry
    fn gid(&self) -> Option<u32> {
        self.fields.get(3)?.parse().ok()
    }

    fn set_gid(&mut self, gid: u32) {
        self.fields[3] = gid.to_string();
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(":"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDb {
    kind: DbKind,
    entries: BTreeMap<String, Entry>,
}

impl IdentityDb {
    pub fn new(kind: DbKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn parse(kind: DbKind, text: &str) -> Result<Self> {
        let mut db = Self::new(kind);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            db.insert(Entry::parse(kind, line)?);
        }
        Ok(db)
    }

    pub fn read(kind: DbKind, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| IdentityMergeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(kind, &text)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|source| IdentityMergeError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.name().to_string(), entry);
    }

    fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.values().map(Entry::id)
    }

    /// Other names sharing `name`'s id
    fn aliases(&self, name: &str) -> Vec<&str> {
        let Some(entry) = self.entries.get(name) else {
            return Vec::new();
        };
        self.entries
            .values()
            .filter(|other| other.name() != name && other.id == entry.id)
            .map(Entry::name)
            .collect()
    }

    /// First id outside `used` and our own ids, in the same range as `old_id`
    /// (system below 100, dynamic below 1000, regular otherwise).
    fn new_id(&self, used: &HashSet<u32>, old_id: u32) -> Result<u32> {
        let taken: HashSet<u32> = self.ids().chain(used.iter().copied()).collect();

        let preferred = match old_id {
            0..=99 => Some(1..100),
            100..=999 => Some(100..1000),
            _ => None,
        };

        preferred
            .into_iter()
            .flatten()
            .chain(1000..65534)
            .find(|id| !taken.contains(id))
            .ok_or(IdentityMergeError::NoFreeId {
                file: self.kind.file(),
            })
    }

    /// Rewrite primary gids of passwd entries through `gidmap`
    pub fn fix_gids(&mut self, gidmap: &IdMap) {
        for entry in self.entries.values_mut() {
            if let Some(new_gid) = entry.gid().and_then(|gid| gidmap.get(&gid)) {
                entry.set_gid(*new_gid);
            }
        }
    }

    /// Merge a backed-up database into the live one
    pub fn merge(backup: &IdentityDb, live: &IdentityDb) -> Result<(IdentityDb, IdMap)> {
        let mut merged = IdentityDb::new(backup.kind);
        let mut idmap = IdMap::new();

        let names: BTreeSet<&str> = backup
            .entries
            .keys()
            .chain(live.entries.keys())
            .map(String::as_str)
            .collect();

        let mut aliased = Vec::new();
        for name in names {
            if backup.aliases(name).is_empty() {
                merged.merge_entry(name, backup, live, &mut idmap)?;
            } else {
                aliased.push(name);
            }
        }

        // Entries whose live counterpart has the same id go first, then other
        // entries on both sides, then backup-only entries
        aliased.sort_by_key(|name| {
            let backup_id = backup.get(name).map(Entry::id);
            match live.get(name) {
                Some(l) if Some(l.id) == backup_id => 0,
                Some(_) => 1,
                None => 2,
            }
        });

        for name in aliased {
            let alias_id = backup
                .aliases(name)
                .into_iter()
                .find_map(|alias| merged.get(alias).map(Entry::id));

            let (Some(id), Some(backup_entry)) = (alias_id, backup.get(name)) else {
                merged.merge_entry(name, backup, live, &mut idmap)?;
                continue;
            };

            let mut entry = backup_entry.clone();
            entry.set_id(id);
            merged.insert(entry);

            if let Some(live_entry) = live.get(name).filter(|l| l.id != id) {
                let mut orig = live_entry.clone();
                orig.rename(format!("{}_orig", name));
                merged.insert(orig);
            }
        }

        Ok((merged, idmap))
    }

    fn merge_entry(
        &mut self,
        name: &str,
        backup: &IdentityDb,
        live: &IdentityDb,
        idmap: &mut IdMap,
    ) -> Result<()> {
        let entry = match (backup.get(name), live.get(name)) {
            (None, None) => return Ok(()),
            (None, Some(live_entry)) => live_entry.clone(),
            (Some(backup_entry), Some(live_entry)) => {
                let mut entry = backup_entry.clone();
                entry.set_id(live_entry.id);
                entry
            }
            (Some(backup_entry), None) => {
                let mut entry = backup_entry.clone();
                let used: HashSet<u32> = live.ids().chain(self.ids()).collect();
                if used.contains(&entry.id) {
                    entry.set_id(backup.new_id(&used, entry.id)?);
                }
                entry
            }
        };

        if let Some(backup_entry) = backup.get(name) {
            if backup_entry.id != entry.id {
                idmap.insert(backup_entry.id, entry.id);
            }
        }

        self.insert(entry);
        Ok(())
    }
}

/// Entries ordered by id, then name
impl fmt::Display for IdentityDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name().cmp(b.name())));
        for entry in entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Result of merging both account databases
#[derive(Debug, Clone)]
pub struct MergedIdentities {
    pub passwd: IdentityDb,
    pub group: IdentityDb,
    pub uidmap: IdMap,
    pub gidmap: IdMap,
}

/// Merge groups first, remap the backup's primary gids, then merge users
pub fn merge(
    backup_passwd: &str,
    backup_group: &str,
    live_passwd: &str,
    live_group: &str,
) -> Result<MergedIdentities> {
    let (group, gidmap) = IdentityDb::merge(
        &IdentityDb::parse(DbKind::Group, backup_group)?,
        &IdentityDb::parse(DbKind::Group, live_group)?,
    )?;

    let mut backup_users = IdentityDb::parse(DbKind::Passwd, backup_passwd)?;
    backup_users.fix_gids(&gidmap);

    let (passwd, uidmap) =
        IdentityDb::merge(&backup_users, &IdentityDb::parse(DbKind::Passwd, live_passwd)?)?;

    Ok(MergedIdentities {
        passwd,
        group,
        uidmap,
        gidmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passwd(lines: &[String]) -> IdentityDb {
        IdentityDb::parse(DbKind::Passwd, &lines.join("\n")).unwrap()
    }

    fn user(name: &str, uid: u32, gid: u32) -> String {
        format!("{name}:x:{uid}:{gid}::/home/{name}:/bin/sh")
    }

    #[test]
    fn test_common_entry_takes_live_id() {
        let backup = passwd(&[user("alice", 1001, 1001)]);
        let live = passwd(&[user("alice", 1002, 1001)]);

        let (merged, idmap) = IdentityDb::merge(&backup, &live).unwrap();
        assert_eq!(merged.get("alice").map(Entry::id), Some(1002));
        assert_eq!(idmap, IdMap::from([(1001, 1002)]));
    }

    #[test]
    fn test_backup_only_collision_renumbers() {
        let backup = passwd(&[user("bob", 1000, 1000), user("svc", 105, 105)]);
        let live = passwd(&[user("carol", 1000, 1000), user("other", 105, 105)]);

        let (merged, idmap) = IdentityDb::merge(&backup, &live).unwrap();
        assert_eq!(merged.get("bob").map(Entry::id), Some(1001));
        assert_eq!(merged.get("svc").map(Entry::id), Some(100));
        assert_eq!(merged.get("carol").map(Entry::id), Some(1000));
        assert_eq!(idmap, IdMap::from([(1000, 1001), (105, 100)]));
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_backup_only_without_collision_kept() {
        let backup = passwd(&[user("dave", 2000, 2000)]);
        let live = passwd(&[user("root", 0, 0)]);

        let (merged, idmap) = IdentityDb::merge(&backup, &live).unwrap();
        assert_eq!(merged.get("dave").map(Entry::id), Some(2000));
        assert!(idmap.is_empty());
    }

    #[test]
    fn test_aliases_share_merged_id() {
        let backup = passwd(&[user("root", 0, 0), user("toor", 0, 0)]);
        let live = passwd(&[user("root", 0, 0), user("toor", 1005, 1005)]);

        let (merged, _) = IdentityDb::merge(&backup, &live).unwrap();
        assert_eq!(merged.get("root").map(Entry::id), Some(0));
        assert_eq!(merged.get("toor").map(Entry::id), Some(0));
        assert_eq!(merged.get("toor_orig").map(Entry::id), Some(1005));
    }

    #[test]
    fn test_group_merge_fixes_passwd_gids() {
        let merged = merge(
            &user("dan", 1500, 1500),
            "devs:x:1500:",
            &user("root", 0, 0),
            "root:x:0:\ndevs:x:1600:",
        )
        .unwrap();

        assert_eq!(merged.gidmap, IdMap::from([(1500, 1600)]));
        assert!(merged.uidmap.is_empty());

        let dan = merged.passwd.get("dan").map(ToString::to_string);
        assert_eq!(dan.as_deref(), Some("dan:x:1500:1600::/home/dan:/bin/sh"));
    }

    #[test]
    fn test_output_ordered_by_id() {
        let backup = passwd(&[user("zed", 5, 5), user("amy", 1000, 1000)]);
        let live = passwd(&[user("root", 0, 0)]);

        let (merged, _) = IdentityDb::merge(&backup, &live).unwrap();
        let names: Vec<String> = merged
            .to_string()
            .lines()
            .map(|l| l.split(':').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["root", "zed", "amy"]);
    }

    #[test]
    fn test_malformed_lines() {
        let short = IdentityDb::parse(DbKind::Group, "wheel:x:10");
        assert!(matches!(
            short,
            Err(IdentityMergeError::FieldCount {
                expected: 4,
                found: 3,
                ..
            })
        ));

        let bad_id = IdentityDb::parse(DbKind::Passwd, "eve:x:abc:1::/:/bin/sh");
        assert!(matches!(bad_id, Err(IdentityMergeError::BadId { file: "passwd", .. })));

        let bad_gid = IdentityDb::parse(DbKind::Passwd, "eve:x:1:abc::/:/bin/sh");
        assert!(matches!(bad_gid, Err(IdentityMergeError::BadId { .. })));
    }

    #[test]
    fn test_no_free_id() {
        let db = IdentityDb::new(DbKind::Group);
        let used: HashSet<u32> = (1..65534).collect();
        assert!(matches!(
            db.new_id(&used, 5),
            Err(IdentityMergeError::NoFreeId { file: "group" })
        ));
    }
}
