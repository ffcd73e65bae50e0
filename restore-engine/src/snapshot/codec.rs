//! Snapshot (dirindex) serialization.
//!
//! The current format is a binary file introduced by a magic line:
//!
//! ```text
//! DIRINDEXv2.0\n
//! +-------------------------------+
//! | entry_count        (u64 LE)   |
//! | path_table_offset  (u64 LE)   |
//! | path_table_size    (u64 LE)   |
//! | meta_table_offset  (u64 LE)   |
//! +-------------------------------+
//! | path table: per entry         |
//! |   path_len, symlink_len (u64) |
//! |   path bytes, symlink bytes   |
//! +-------------------------------+
//! | meta table: per entry (36 B)  |
//! |   path_offset u64, mode u32,  |
//! |   uid u32, gid u32, size i64, |
//! |   mtime u64                   |
//! +-------------------------------+
//! ```
//!
//! Table offsets count from the first byte after the header. The meta table
//! runs to the end of the stream.
//!
//! The legacy format is tab-separated text, one record per line, with no
//! magic. It is never guessed at: callers ask for it by name.

use std::fs;
use std::io;
use std::path::Path;
use std::str;

use super::{Record, Snapshot};
use crate::fs::metadata::is_symlink_mode;
use crate::utils::errors::FormatError;
use crate::utils::escape::{escape_field, unescape_field};

pub const V2_MAGIC: &[u8] = b"DIRINDEXv2.0\n";

const HEADER_SIZE: usize = 32;
const PATH_HEAD_SIZE: usize = 16;
const META_ENTRY_SIZE: usize = 36;
const LEGACY_FIELDS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    V2,
    Legacy,
}

type Decoder = fn(&[u8]) -> Result<Snapshot, FormatError>;
type Encoder = fn(&Snapshot) -> Vec<u8>;

/// Formats recognized by their leading magic
const MAGIC_TABLE: &[(&[u8], SnapshotFormat)] = &[(V2_MAGIC, SnapshotFormat::V2)];

impl SnapshotFormat {
    fn decoder(self) -> Decoder {
        match self {
            SnapshotFormat::V2 => decode_v2,
            SnapshotFormat::Legacy => decode_legacy,
        }
    }

    fn encoder(self) -> Encoder {
        match self {
            SnapshotFormat::V2 => encode_v2,
            SnapshotFormat::Legacy => encode_legacy,
        }
    }
}

/// Encode in the current binary format
pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    encode_as(snapshot, SnapshotFormat::V2)
}

pub fn encode_as(snapshot: &Snapshot, format: SnapshotFormat) -> Vec<u8> {
    (format.encoder())(snapshot)
}

/// Decode a snapshot, selecting the format by its magic
pub fn decode(bytes: &[u8]) -> Result<Snapshot, FormatError> {
    MAGIC_TABLE
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
        .map(|(_, format)| decode_as(bytes, *format))
        .unwrap_or_else(|| Err(unknown_magic(bytes)))
}

pub fn decode_as(bytes: &[u8], format: SnapshotFormat) -> Result<Snapshot, FormatError> {
    (format.decoder())(bytes)
}

pub fn read_file(path: &Path) -> Result<Snapshot, FormatError> {
    decode(&fs::read(path)?)
}

pub fn write_file(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
    fs::write(path, encode(snapshot))
}

fn unknown_magic(bytes: &[u8]) -> FormatError {
    let line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = &line[..line.len().min(32)];
    FormatError::UnknownMagic(String::from_utf8_lossy(line).into_owned())
}

fn encode_v2(snapshot: &Snapshot) -> Vec<u8> {
    let mut path_table = Vec::new();
    let mut meta_table = Vec::with_capacity(snapshot.len() * META_ENTRY_SIZE);

    for record in snapshot {
        let path_offset = path_table.len() as u64;
        let symlink = record.symlink.as_deref().unwrap_or("");

        path_table.extend_from_slice(&(record.path.len() as u64).to_le_bytes());
        path_table.extend_from_slice(&(symlink.len() as u64).to_le_bytes());
        path_table.extend_from_slice(record.path.as_bytes());
        path_table.extend_from_slice(symlink.as_bytes());

        meta_table.extend_from_slice(&path_offset.to_le_bytes());
        meta_table.extend_from_slice(&record.mode.to_le_bytes());
        meta_table.extend_from_slice(&record.uid.to_le_bytes());
        meta_table.extend_from_slice(&record.gid.to_le_bytes());
        meta_table.extend_from_slice(&record.size.to_le_bytes());
        meta_table.extend_from_slice(&record.mtime.to_le_bytes());
    }

    let path_table_size = path_table.len() as u64;
    let mut out =
        Vec::with_capacity(V2_MAGIC.len() + HEADER_SIZE + path_table.len() + meta_table.len());
    out.extend_from_slice(V2_MAGIC);
    out.extend_from_slice(&(snapshot.len() as u64).to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&path_table_size.to_le_bytes());
    out.extend_from_slice(&path_table_size.to_le_bytes());
    out.extend_from_slice(&path_table);
    out.extend_from_slice(&meta_table);
    out
}

/// Little-endian field reader over a buffer whose length was checked up front
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        raw
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

fn decode_v2(bytes: &[u8]) -> Result<Snapshot, FormatError> {
    let body = bytes
        .strip_prefix(V2_MAGIC)
        .ok_or_else(|| unknown_magic(bytes))?;

    if body.len() < HEADER_SIZE {
        return Err(FormatError::Truncated {
            what: "header",
            needed: HEADER_SIZE as u64,
            available: body.len() as u64,
        });
    }

    let mut header = Fields::new(body);
    let entry_count = header.u64();
    let path_table_offset = header.u64();
    let path_table_size = header.u64();
    let meta_table_offset = header.u64();

    let tables = &body[HEADER_SIZE..];
    let path_table = table_slice(tables, "path table", path_table_offset, Some(path_table_size))?;
    let meta_table = table_slice(tables, "meta table", meta_table_offset, None)?;

    if meta_table.len() % META_ENTRY_SIZE != 0 {
        return Err(FormatError::MetaTableMisaligned(meta_table.len() as u64));
    }
    let found = (meta_table.len() / META_ENTRY_SIZE) as u64;
    if found != entry_count {
        return Err(FormatError::CountMismatch {
            declared: entry_count,
            found,
        });
    }

    let mut snapshot = Snapshot::new();
    for entry in meta_table.chunks_exact(META_ENTRY_SIZE) {
        let mut fields = Fields::new(entry);
        let path_offset = fields.u64();
        let mode = fields.u32();
        let uid = fields.u32();
        let gid = fields.u32();
        let size = fields.i64();
        let mtime = fields.u64();

        let (path, symlink) = path_entry(path_table, path_offset)?;
        let record = Record {
            path,
            mode,
            uid,
            gid,
            size,
            mtime,
            symlink,
        };
        insert_checked(&mut snapshot, record)?;
    }

    Ok(snapshot)
}

/// `tables[offset..offset + size]`, or to the end when `size` is `None`
fn table_slice<'a>(
    tables: &'a [u8],
    what: &'static str,
    offset: u64,
    size: Option<u64>,
) -> Result<&'a [u8], FormatError> {
    let available = tables.len() as u64;
    let end = match size {
        Some(size) => offset.saturating_add(size),
        None => offset,
    };
    if end > available {
        return Err(FormatError::Truncated {
            what,
            needed: end,
            available,
        });
    }

    let start = offset as usize;
    Ok(match size {
        Some(_) => &tables[start..end as usize],
        None => &tables[start..],
    })
}

fn path_entry(table: &[u8], offset: u64) -> Result<(String, Option<String>), FormatError> {
    let out_of_bounds = || FormatError::PathOffset {
        offset,
        size: table.len() as u64,
    };
    let span = |start: usize, len: u64| -> Result<usize, FormatError> {
        usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end <= table.len())
            .ok_or_else(out_of_bounds)
    };

    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let head_end = span(start, PATH_HEAD_SIZE as u64)?;

    let mut head = Fields::new(&table[start..head_end]);
    let path_len = head.u64();
    let symlink_len = head.u64();

    let path_end = span(head_end, path_len)?;
    let symlink_end = span(path_end, symlink_len)?;

    let path = str::from_utf8(&table[head_end..path_end])
        .map_err(|_| FormatError::InvalidUtf8("path"))?
        .to_string();

    let symlink = if symlink_len == 0 {
        None
    } else {
        Some(
            str::from_utf8(&table[path_end..symlink_end])
                .map_err(|_| FormatError::InvalidUtf8("symlink target"))?
                .to_string(),
        )
    };

    Ok((path, symlink))
}

fn insert_checked(snapshot: &mut Snapshot, record: Record) -> Result<(), FormatError> {
    if record.symlink.is_some() && !is_symlink_mode(record.mode) {
        return Err(FormatError::SymlinkMode {
            path: record.path,
            mode: record.mode,
        });
    }
    if snapshot.contains(&record.path) {
        return Err(FormatError::DuplicatePath(record.path));
    }
    snapshot.insert(record);
    Ok(())
}

fn encode_legacy(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = String::new();
    for record in snapshot {
        out.push_str(&format!(
            "{}\t{:o}\t{}\t{}\t{}\t{}\t{}\n",
            escape_field(&record.path),
            record.mode,
            record.uid,
            record.gid,
            record.size,
            record.mtime,
            escape_field(record.symlink.as_deref().unwrap_or("")),
        ));
    }
    out.into_bytes()
}

fn decode_legacy(bytes: &[u8]) -> Result<Snapshot, FormatError> {
    let text = str::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8("legacy snapshot"))?;

    let mut snapshot = Snapshot::new();
    for (index, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let bad = |reason: &str| FormatError::BadLine {
            line: index + 1,
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != LEGACY_FIELDS {
            return Err(bad(&format!(
                "expected {} fields, found {}",
                LEGACY_FIELDS,
                fields.len()
            )));
        }

        let path = unescape_field(fields[0]).ok_or_else(|| bad("bad escape in path"))?;
        let symlink = unescape_field(fields[6]).ok_or_else(|| bad("bad escape in symlink"))?;

        let record = Record {
            path,
            mode: u32::from_str_radix(fields[1], 8).map_err(|_| bad("bad mode"))?,
            uid: fields[2].parse().map_err(|_| bad("bad uid"))?,
            gid: fields[3].parse().map_err(|_| bad("bad gid"))?,
            size: fields[4].parse().map_err(|_| bad("bad size"))?,
            mtime: fields[5].parse().map_err(|_| bad("bad mtime"))?,
            symlink: (!symlink.is_empty()).then_some(symlink),
        };
        insert_checked(&mut snapshot, record)?;
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::metadata::{S_IFDIR, S_IFLNK, S_IFREG};
    use tempfile::TempDir;

    fn record(path: &str, mode: u32, symlink: Option<&str>) -> Record {
        Record {
            path: path.to_string(),
            mode,
            uid: 1000,
            gid: 100,
            size: 42,
            mtime: 1_700_000_000,
            symlink: symlink.map(str::to_string),
        }
    }

    fn sample() -> Snapshot {
        [
            record("/etc", S_IFDIR | 0o755, None),
            record("/etc/foo", S_IFREG | 0o644, None),
            record("/etc/link", S_IFLNK | 0o777, Some("foo")),
        ]
        .into_iter()
        .collect()
    }

    /// Replace the meta table with `meta` and fix nothing else
    fn with_meta(encoded: &[u8], meta: &[u8]) -> Vec<u8> {
        let body = &encoded[V2_MAGIC.len()..];
        let mut header = Fields::new(body);
        let _count = header.u64();
        let _path_offset = header.u64();
        let _path_size = header.u64();
        let meta_offset = header.u64() as usize;

        let cut = V2_MAGIC.len() + HEADER_SIZE + meta_offset;
        let mut out = encoded[..cut].to_vec();
        out.extend_from_slice(meta);
        out
    }

    #[test]
    fn test_roundtrip_with_symlink() -> Result<(), FormatError> {
        let snapshot = sample();
        let decoded = decode(&encode(&snapshot))?;
        assert_eq!(decoded, snapshot);
        assert_eq!(
            decoded.get("/etc/link").and_then(|r| r.symlink.as_deref()),
            Some("foo")
        );
        Ok(())
    }

    #[test]
    fn test_empty_snapshot() -> Result<(), FormatError> {
        let encoded = encode(&Snapshot::new());
        assert_eq!(encoded.len(), V2_MAGIC.len() + HEADER_SIZE);
        assert!(decode(&encoded)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_negative_size_and_distinct_ids() -> Result<(), FormatError> {
        let mut r = record("/dev/odd", S_IFREG | 0o600, None);
        r.size = -1;
        r.uid = 7;
        r.gid = 9;
        let snapshot: Snapshot = [r].into_iter().collect();

        let decoded = decode(&encode(&snapshot))?;
        let got = decoded.get("/dev/odd");
        assert_eq!(got.map(|r| r.size), Some(-1));
        assert_eq!(got.map(|r| (r.uid, r.gid)), Some((7, 9)));
        Ok(())
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a: Snapshot = [record("/b", S_IFREG, None), record("/a", S_IFREG, None)]
            .into_iter()
            .collect();
        let b: Snapshot = [record("/a", S_IFREG, None), record("/b", S_IFREG, None)]
            .into_iter()
            .collect();
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_unknown_magic() {
        let result = decode(b"DIRINDEXv9.9\nwhatever");
        assert!(matches!(result, Err(FormatError::UnknownMagic(m)) if m == "DIRINDEXv9.9"));

        // Legacy text is not guessed at
        let legacy = encode_as(&sample(), SnapshotFormat::Legacy);
        assert!(matches!(decode(&legacy), Err(FormatError::UnknownMagic(_))));
    }

    #[test]
    fn test_truncated_header() {
        let mut bytes = V2_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::Truncated { what: "header", .. })
        ));
    }

    #[test]
    fn test_truncated_path_table() {
        let encoded = encode(&sample());
        let cut = V2_MAGIC.len() + HEADER_SIZE + 8;
        assert!(matches!(
            decode(&encoded[..cut]),
            Err(FormatError::Truncated { what: "path table", .. })
        ));
    }

    #[test]
    fn test_meta_table_misaligned() {
        let encoded = encode(&sample());
        let mut bytes = encoded.clone();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::MetaTableMisaligned(len)) if len == 3 * 36 + 1
        ));
    }

    #[test]
    fn test_count_mismatch() {
        let encoded = encode(&sample());
        let meta_start = encoded.len() - 3 * META_ENTRY_SIZE;
        let two_entries = &encoded[meta_start..meta_start + 2 * META_ENTRY_SIZE];
        let bytes = with_meta(&encoded, two_entries);
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::CountMismatch {
                declared: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn test_path_offset_out_of_range() {
        let encoded = encode(&sample());
        let meta_start = encoded.len() - 3 * META_ENTRY_SIZE;
        let mut meta = encoded[meta_start..].to_vec();
        meta[..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let bytes = with_meta(&encoded, &meta);
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::PathOffset { offset: u64::MAX, .. })
        ));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let encoded = encode(&sample());
        let meta_start = encoded.len() - 3 * META_ENTRY_SIZE;
        let mut meta = encoded[meta_start..].to_vec();
        // Point the second entry at the first entry's path
        meta[META_ENTRY_SIZE..META_ENTRY_SIZE + 8].copy_from_slice(&0u64.to_le_bytes());
        let bytes = with_meta(&encoded, &meta);
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::DuplicatePath(p)) if p == "/etc"
        ));
    }

    #[test]
    fn test_symlink_on_regular_mode_rejected() {
        let bad: Snapshot = [record("/x", S_IFREG | 0o644, Some("target"))]
            .into_iter()
            .collect();
        assert!(matches!(
            decode(&encode(&bad)),
            Err(FormatError::SymlinkMode { .. })
        ));
    }

    #[test]
    fn test_legacy_roundtrip_with_odd_names() -> Result<(), FormatError> {
        let mut snapshot = sample();
        snapshot.insert(record("/tmp/tab\there", S_IFREG | 0o600, None));
        snapshot.insert(record("/tmp/link\r", S_IFLNK | 0o777, Some("dest\r")));

        let encoded = encode_as(&snapshot, SnapshotFormat::Legacy);
        let decoded = decode_as(&encoded, SnapshotFormat::Legacy)?;
        assert_eq!(decoded, snapshot);
        Ok(())
    }

    #[test]
    fn test_legacy_bad_line() {
        let result = decode_as(b"/etc\t755\t0\t0\n", SnapshotFormat::Legacy);
        assert!(matches!(result, Err(FormatError::BadLine { line: 1, .. })));

        let result = decode_as(b"/etc\tzzz\t0\t0\t0\t0\t\n", SnapshotFormat::Legacy);
        assert!(matches!(result, Err(FormatError::BadLine { line: 1, .. })));
    }

    #[test]
    fn test_file_roundtrip() -> Result<(), FormatError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("dirindex");
        let snapshot = sample();

        write_file(&path, &snapshot)?;
        assert_eq!(read_file(&path)?, snapshot);
        Ok(())
    }
}
