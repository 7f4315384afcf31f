//! Tree object parsing and serialization.
//!
//! Payload form: repeated `<octal mode> <name>\0<raw oid>`. Entry names are
//! arbitrary bytes. Sort order is bytewise with directory names compared as
//! if suffixed `/` — the detail that makes `a`, `a-b`, `a/b` order the way
//! git expects.

use std::cmp::Ordering;

use crate::error::OdbError;
use crate::oid::{HashKind, ObjectId};

/// The file mode of a tree entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Regular file (`100644`).
    Blob,
    /// Executable file (`100755`).
    BlobExecutable,
    /// Subdirectory (`40000`).
    Tree,
    /// Symbolic link (`120000`).
    Link,
    /// Gitlink / submodule commit (`160000`).
    Commit,
}

impl EntryMode {
    /// Canonical octal spelling used inside tree payloads.
    #[must_use]
    pub const fn as_octal(self) -> &'static str {
        match self {
            Self::Blob => "100644",
            Self::BlobExecutable => "100755",
            Self::Tree => "40000",
            Self::Link => "120000",
            Self::Commit => "160000",
        }
    }

    /// Parse an octal mode string. A leading-zero directory spelling
    /// (`040000`) is accepted since older writers produced it.
    #[must_use]
    pub fn from_octal(s: &[u8]) -> Option<Self> {
        match s {
            b"100644" => Some(Self::Blob),
            b"100755" => Some(Self::BlobExecutable),
            b"40000" | b"040000" => Some(Self::Tree),
            b"120000" => Some(Self::Link),
            b"160000" => Some(Self::Commit),
            _ => None,
        }
    }

    /// `true` for subdirectories.
    #[must_use]
    pub const fn is_tree(self) -> bool {
        matches!(self, Self::Tree)
    }
}

/// One row of a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry mode.
    pub mode: EntryMode,
    /// Name bytes (no path separators).
    pub name: Vec<u8>,
    /// Target object.
    pub oid: ObjectId,
}

impl TreeEntry {
    /// The name as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Compare entry names the way tree order requires: directories sort as if
/// their name ended in `/`.
#[must_use]
pub fn entry_order(a_name: &[u8], a_is_tree: bool, b_name: &[u8], b_is_tree: bool) -> Ordering {
    let a_suffix: &[u8] = if a_is_tree { b"/" } else { b"" };
    let b_suffix: &[u8] = if b_is_tree { b"/" } else { b"" };
    let a_iter = a_name.iter().chain(a_suffix).copied();
    let b_iter = b_name.iter().chain(b_suffix).copied();
    a_iter.cmp(b_iter)
}

/// Sort entries into canonical tree order.
pub fn sort_entries(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| {
        entry_order(&a.name, a.mode.is_tree(), &b.name, b.mode.is_tree())
    });
}

/// Parse a tree payload.
///
/// # Errors
/// [`OdbError::Corrupt`] on truncation, [`OdbError::Unsupported`] on an
/// unknown mode.
pub fn parse(payload: &[u8], hash: HashKind) -> Result<Vec<TreeEntry>, OdbError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let space = payload[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| OdbError::corrupt("tree entry", "missing mode terminator"))?;
        let mode = EntryMode::from_octal(&payload[pos..pos + space]).ok_or_else(|| {
            OdbError::Unsupported {
                what: format!(
                    "tree entry mode {:?}",
                    String::from_utf8_lossy(&payload[pos..pos + space])
                ),
            }
        })?;
        pos += space + 1;

        let nul = payload[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| OdbError::corrupt("tree entry", "missing name terminator"))?;
        let name = payload[pos..pos + nul].to_vec();
        if name.is_empty() {
            return Err(OdbError::corrupt("tree entry", "empty name"));
        }
        pos += nul + 1;

        let oid_len = hash.oid_len();
        let raw = payload
            .get(pos..pos + oid_len)
            .ok_or_else(|| OdbError::corrupt("tree entry", "truncated oid"))?;
        let oid = ObjectId::from_bytes(hash, raw)
            .ok_or_else(|| OdbError::corrupt("tree entry", "bad oid width"))?;
        pos += oid_len;

        entries.push(TreeEntry { mode, name, oid });
    }
    Ok(entries)
}

/// Serialize entries in the order given (callers sort first when building
/// new trees; parsing then serializing preserves the original bytes).
#[must_use]
pub fn serialize(entries: &[TreeEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(entry.mode.as_octal().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&entry.name);
        out.push(0);
        out.extend_from_slice(entry.oid.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_oid(n: u8) -> ObjectId {
        ObjectId::Sha1([n; 20])
    }

    fn entry(name: &str, mode: EntryMode) -> TreeEntry {
        TreeEntry { mode, name: name.as_bytes().to_vec(), oid: blob_oid(7) }
    }

    #[test]
    fn roundtrip_is_byte_exact() {
        let mut entries = vec![
            entry("README.md", EntryMode::Blob),
            entry("src", EntryMode::Tree),
            entry("run.sh", EntryMode::BlobExecutable),
        ];
        sort_entries(&mut entries);
        let bytes = serialize(&entries);
        let parsed = parse(&bytes, HashKind::Sha1).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(serialize(&parsed), bytes);
    }

    #[test]
    fn directory_suffix_ordering() {
        // Directory "a" compares as "a/"; both '-' and '.' sort before '/'.
        let mut entries = vec![
            entry("a", EntryMode::Tree),
            entry("a-b", EntryMode::Blob),
            entry("a.txt", EntryMode::Blob),
        ];
        sort_entries(&mut entries);
        let names: Vec<String> = entries.iter().map(TreeEntry::name_lossy).collect();
        assert_eq!(names, ["a-b", "a.txt", "a"]);
    }

    #[test]
    fn file_before_same_prefix_dir_entry() {
        let mut entries = vec![entry("ab", EntryMode::Tree), entry("ab", EntryMode::Blob)];
        sort_entries(&mut entries);
        assert_eq!(entries[0].mode, EntryMode::Blob);
    }

    #[test]
    fn parse_rejects_truncated_oid() {
        let mut bytes = serialize(&[entry("f", EntryMode::Blob)]);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(parse(&bytes, HashKind::Sha1), Err(OdbError::Corrupt { .. })));
    }

    #[test]
    fn parse_rejects_unknown_mode() {
        let mut bytes = b"123456 f\0".to_vec();
        bytes.extend_from_slice(&[0u8; 20]);
        assert!(matches!(parse(&bytes, HashKind::Sha1), Err(OdbError::Unsupported { .. })));
    }

    #[test]
    fn legacy_zero_padded_dir_mode_parses() {
        let mut bytes = b"040000 d\0".to_vec();
        bytes.extend_from_slice(&[1u8; 20]);
        let entries = parse(&bytes, HashKind::Sha1).unwrap();
        assert_eq!(entries[0].mode, EntryMode::Tree);
    }

    #[test]
    fn empty_tree_parses_to_no_entries() {
        assert!(parse(b"", HashKind::Sha1).unwrap().is_empty());
    }
}
