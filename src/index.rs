//! The staging index (`<gitdir>/index`, dircache format v2/v3).
//!
//! In memory the index is a sorted map of `(path, stage)` → entry. On disk
//! it is the `DIRC` binary: a header, packed entries padded to 8-byte
//! boundaries, opaque extension blocks, and a trailing digest over
//! everything before it. Unknown extensions are preserved bit-exact across
//! a load/save cycle.
//!
//! Stage discipline: a path holds either one stage-0 entry or a subset of
//! stages 1/2/3 (conflict base/ours/theirs) — never both. [`Index::insert`]
//! and [`Index::set_conflict`] maintain this invariant.

use std::collections::BTreeMap;
use std::path::Path;

use keel_fs::{Backend, FileStat, WriteMode};
use keel_odb::oid::Hasher;
use keel_odb::{EntryMode, HashKind, ObjectId};

use crate::error::Error;

/// Stage 0: merged.
pub const STAGE_MERGED: u8 = 0;
/// Stage 1: common ancestor in a conflict.
pub const STAGE_BASE: u8 = 1;
/// Stage 2: our side of a conflict.
pub const STAGE_OURS: u8 = 2;
/// Stage 3: their side of a conflict.
pub const STAGE_THEIRS: u8 = 3;

const SIGNATURE: &[u8; 4] = b"DIRC";

/// One index entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Repository-relative path, `/`-separated.
    pub path: String,
    /// File mode.
    pub mode: EntryMode,
    /// Blob (or gitlink commit) id.
    pub oid: ObjectId,
    /// Cached stat, zeroed when unknown.
    pub stat: FileStat,
    /// Merge stage (0 = merged, 1/2/3 = conflict).
    pub stage: u8,
    /// Assume-valid bit.
    pub assume_valid: bool,
    /// Raw v3 extended flag word (`0` in v2 files).
    pub extended_flags: u16,
}

impl IndexEntry {
    /// A minimal stage-0 entry with no stat cache.
    #[must_use]
    pub fn new(path: impl Into<String>, mode: EntryMode, oid: ObjectId) -> Self {
        Self {
            path: path.into(),
            mode,
            oid,
            stat: FileStat::default(),
            stage: STAGE_MERGED,
            assume_valid: false,
            extended_flags: 0,
        }
    }
}

/// The staging area of one repository.
#[derive(Clone, Debug)]
pub struct Index {
    version: u32,
    entries: BTreeMap<(String, u8), IndexEntry>,
    extensions: Vec<([u8; 4], Vec<u8>)>,
    hash: HashKind,
}

impl Index {
    /// An empty index.
    #[must_use]
    pub fn new(hash: HashKind) -> Self {
        Self { version: 2, entries: BTreeMap::new(), extensions: Vec::new(), hash }
    }

    /// Load from `<gitdir>/index`; a missing file is an empty index.
    ///
    /// # Errors
    /// [`Error::Corrupt`] for structural damage, [`Error::Unsupported`] for
    /// versions other than 2 and 3.
    pub fn load(backend: &dyn Backend, gitdir: &Path, hash: HashKind) -> Result<Self, Error> {
        match backend.read(&gitdir.join("index"))? {
            Some(bytes) => Self::parse(&bytes, hash),
            None => Ok(Self::new(hash)),
        }
    }

    /// Persist atomically to `<gitdir>/index`.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn save(&self, backend: &dyn Backend, gitdir: &Path) -> Result<(), Error> {
        backend.write_atomic(&gitdir.join("index"), &self.serialize(), WriteMode::Regular)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entry operations
    // -----------------------------------------------------------------------

    /// Insert (or replace) the stage-0 entry for a path, clearing any
    /// conflict stages.
    pub fn insert(&mut self, entry: IndexEntry) {
        let path = entry.path.clone();
        self.remove(&path);
        self.entries.insert((path, STAGE_MERGED), IndexEntry { stage: STAGE_MERGED, ..entry });
    }

    /// Record a conflict: stages 1/2/3 replace any stage-0 entry.
    pub fn set_conflict(
        &mut self,
        path: &str,
        base: Option<(EntryMode, ObjectId)>,
        ours: Option<(EntryMode, ObjectId)>,
        theirs: Option<(EntryMode, ObjectId)>,
    ) {
        self.remove(path);
        for (stage, slot) in [(STAGE_BASE, base), (STAGE_OURS, ours), (STAGE_THEIRS, theirs)] {
            if let Some((mode, oid)) = slot {
                let mut entry = IndexEntry::new(path, mode, oid);
                entry.stage = stage;
                self.entries.insert((path.to_owned(), stage), entry);
            }
        }
    }

    /// Remove every stage of a path. Returns `true` if anything was there.
    pub fn remove(&mut self, path: &str) -> bool {
        let mut removed = false;
        for stage in 0..=3 {
            removed |= self.entries.remove(&(path.to_owned(), stage)).is_some();
        }
        removed
    }

    /// The stage-0 entry of a path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(&(path.to_owned(), STAGE_MERGED))
    }

    /// All present stages of a path, keyed by stage number.
    #[must_use]
    pub fn stages(&self, path: &str) -> BTreeMap<u8, &IndexEntry> {
        (0..=3)
            .filter_map(|stage| {
                self.entries.get(&(path.to_owned(), stage)).map(|e| (stage, e))
            })
            .collect()
    }

    /// Iterate entries whose path starts with `prefix`, in sorted order.
    pub fn iter_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a IndexEntry> {
        self.entries
            .range((prefix.to_owned(), 0)..)
            .take_while(move |((path, _), _)| path.starts_with(prefix))
            .map(|(_, entry)| entry)
    }

    /// Iterate all entries in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Number of entries (all stages).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no entries are staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths that currently hold conflict stages.
    #[must_use]
    pub fn conflicted_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .keys()
            .filter(|(_, stage)| *stage != STAGE_MERGED)
            .map(|(path, _)| path.clone())
            .collect();
        paths.dedup();
        paths
    }

    /// `true` while any path is conflicted.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        self.entries.keys().any(|(_, stage)| *stage != STAGE_MERGED)
    }

    /// The opaque extension blocks carried through load/save.
    #[must_use]
    pub fn extensions(&self) -> &[([u8; 4], Vec<u8>)] {
        &self.extensions
    }

    // -----------------------------------------------------------------------
    // Binary format
    // -----------------------------------------------------------------------

    /// Parse the dircache binary.
    ///
    /// # Errors
    /// [`Error::Corrupt`] / [`Error::Unsupported`] as documented on
    /// [`load`](Self::load).
    #[allow(clippy::similar_names)]
    pub fn parse(data: &[u8], hash: HashKind) -> Result<Self, Error> {
        let corrupt = |detail: String| Error::Corrupt { at: "index".to_owned(), detail };
        let oid_len = hash.oid_len();
        if data.len() < 12 + oid_len {
            return Err(corrupt("truncated header".to_owned()));
        }
        if &data[..4] != SIGNATURE {
            return Err(corrupt("bad magic".to_owned()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 && version != 3 {
            return Err(Error::Unsupported { what: format!("index version {version}") });
        }
        let count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;

        let body_len = data.len() - oid_len;
        let mut hasher = Hasher::new(hash);
        hasher.update(&data[..body_len]);
        if hasher.finalize().as_bytes() != &data[body_len..] {
            return Err(corrupt("trailing checksum mismatch".to_owned()));
        }

        let mut entries = BTreeMap::new();
        let mut pos = 12usize;
        for _ in 0..count {
            let (entry, next) = parse_entry(data, pos, body_len, version, hash)?;
            entries.insert((entry.path.clone(), entry.stage), entry);
            pos = next;
        }

        // Extension blocks run from the last entry to the trailing digest.
        let mut extensions = Vec::new();
        while pos < body_len {
            if pos + 8 > body_len {
                return Err(corrupt("truncated extension header".to_owned()));
            }
            let mut sig = [0u8; 4];
            sig.copy_from_slice(&data[pos..pos + 4]);
            let size =
                u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                    as usize;
            pos += 8;
            let payload = data
                .get(pos..pos + size)
                .ok_or_else(|| corrupt("extension payload overruns file".to_owned()))?;
            extensions.push((sig, payload.to_vec()));
            pos += size;
        }

        Ok(Self { version, entries, extensions, hash })
    }

    /// Serialize to the dircache binary.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize(&self) -> Vec<u8> {
        let version: u32 = if self.version == 3 || self.entries.values().any(|e| e.extended_flags != 0)
        {
            3
        } else {
            2
        };

        let mut out = Vec::new();
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        for entry in self.entries.values() {
            write_entry(&mut out, entry, version);
        }
        for (sig, payload) in &self.extensions {
            out.extend_from_slice(sig);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload);
        }

        let mut hasher = Hasher::new(self.hash);
        hasher.update(&out);
        let digest = hasher.finalize();
        out.extend_from_slice(digest.as_bytes());
        out
    }
}

fn mode_bits(mode: EntryMode) -> u32 {
    match mode {
        EntryMode::Blob => 0o100_644,
        EntryMode::BlobExecutable => 0o100_755,
        EntryMode::Link => 0o120_000,
        EntryMode::Commit => 0o160_000,
        // Directories never appear as index entries; encode as gitlink-ish
        // tree bits so a bug is at least visible in hexdumps.
        EntryMode::Tree => 0o040_000,
    }
}

fn mode_of_bits(bits: u32) -> Option<EntryMode> {
    match bits {
        0o100_644 | 0o100_664 => Some(EntryMode::Blob),
        0o100_755 => Some(EntryMode::BlobExecutable),
        0o120_000 => Some(EntryMode::Link),
        0o160_000 => Some(EntryMode::Commit),
        _ => None,
    }
}

fn parse_entry(
    data: &[u8],
    start: usize,
    body_len: usize,
    version: u32,
    hash: HashKind,
) -> Result<(IndexEntry, usize), Error> {
    let corrupt = |detail: &str| Error::Corrupt {
        at: format!("index entry @{start}"),
        detail: detail.to_owned(),
    };
    let fixed = 40 + hash.oid_len() + 2;
    if start + fixed > body_len {
        return Err(corrupt("truncated entry"));
    }
    let u32_at = |off: usize| {
        u32::from_be_bytes([
            data[start + off],
            data[start + off + 1],
            data[start + off + 2],
            data[start + off + 3],
        ])
    };

    let stat = FileStat {
        kind: keel_fs::FileKind::File,
        ctime_sec: u32_at(0),
        ctime_nsec: u32_at(4),
        mtime_sec: u32_at(8),
        mtime_nsec: u32_at(12),
        dev: u32_at(16),
        ino: u32_at(20),
        uid: u32_at(28),
        gid: u32_at(32),
        size: u64::from(u32_at(36)),
    };
    let mode = mode_of_bits(u32_at(24))
        .ok_or_else(|| corrupt(&format!("unknown mode {:o}", u32_at(24))))?;

    let oid_off = start + 40;
    let oid = ObjectId::from_bytes(hash, &data[oid_off..oid_off + hash.oid_len()])
        .ok_or_else(|| corrupt("bad oid width"))?;

    let flags_off = oid_off + hash.oid_len();
    let flags = u16::from_be_bytes([data[flags_off], data[flags_off + 1]]);
    let assume_valid = flags & 0x8000 != 0;
    let extended = flags & 0x4000 != 0;
    let stage = ((flags >> 12) & 0x3) as u8;
    let name_len_field = (flags & 0x0fff) as usize;

    let mut name_off = flags_off + 2;
    let mut extended_flags = 0u16;
    if extended {
        if version < 3 {
            return Err(corrupt("extended flag in a version 2 index"));
        }
        extended_flags = u16::from_be_bytes([data[name_off], data[name_off + 1]]);
        name_off += 2;
    }

    // Names at or past 0xFFF store the real length implicitly (NUL scan).
    let name_end = if name_len_field < 0x0fff {
        name_off + name_len_field
    } else {
        data[name_off..body_len]
            .iter()
            .position(|&b| b == 0)
            .map(|i| name_off + i)
            .ok_or_else(|| corrupt("unterminated long name"))?
    };
    if name_end > body_len {
        return Err(corrupt("name overruns file"));
    }
    let path = String::from_utf8(data[name_off..name_end].to_vec())
        .map_err(|_| corrupt("non-UTF-8 path"))?;

    // Entries are NUL-padded so the total length is a multiple of 8.
    let entry_len = name_end - start;
    let padded = (entry_len / 8 + 1) * 8;
    let next = start + padded;
    if next > body_len {
        return Err(corrupt("padding overruns file"));
    }

    Ok((
        IndexEntry { path, mode, oid, stat, stage, assume_valid, extended_flags },
        next,
    ))
}

#[allow(clippy::cast_possible_truncation)]
fn write_entry(out: &mut Vec<u8>, entry: &IndexEntry, version: u32) {
    let start = out.len();
    out.extend_from_slice(&entry.stat.ctime_sec.to_be_bytes());
    out.extend_from_slice(&entry.stat.ctime_nsec.to_be_bytes());
    out.extend_from_slice(&entry.stat.mtime_sec.to_be_bytes());
    out.extend_from_slice(&entry.stat.mtime_nsec.to_be_bytes());
    out.extend_from_slice(&entry.stat.dev.to_be_bytes());
    out.extend_from_slice(&entry.stat.ino.to_be_bytes());
    out.extend_from_slice(&mode_bits(entry.mode).to_be_bytes());
    out.extend_from_slice(&entry.stat.uid.to_be_bytes());
    out.extend_from_slice(&entry.stat.gid.to_be_bytes());
    out.extend_from_slice(&(entry.stat.size as u32).to_be_bytes());
    out.extend_from_slice(entry.oid.as_bytes());

    let name_len = entry.path.len().min(0x0fff) as u16;
    let extended = version >= 3 && entry.extended_flags != 0;
    let mut flags = name_len | (u16::from(entry.stage) << 12);
    if entry.assume_valid {
        flags |= 0x8000;
    }
    if extended {
        flags |= 0x4000;
    }
    out.extend_from_slice(&flags.to_be_bytes());
    if extended {
        out.extend_from_slice(&entry.extended_flags.to_be_bytes());
    }
    out.extend_from_slice(entry.path.as_bytes());

    let entry_len = out.len() - start;
    let padded = (entry_len / 8 + 1) * 8;
    out.resize(start + padded, 0);
}
