//! Pack index (`.idx` version 2) reading and writing.
//!
//! The index is a fanout table (256 cumulative counts keyed by the first
//! OID byte), a sorted OID table, a CRC32 column over the raw entry bytes,
//! a 31-bit offset column, and a 64-bit overflow table for offsets past
//! 2 GiB. Two digests close the file: the paired pack's trailer and a
//! checksum of the index itself.

use crate::error::OdbError;
use crate::oid::{HashKind, Hasher, ObjectId};

const MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// One object row: id, CRC32 of the raw pack entry, offset in the pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxEntry {
    /// The object id.
    pub oid: ObjectId,
    /// CRC32 over the entry's raw (still-compressed) pack bytes.
    pub crc32: u32,
    /// Byte offset of the entry in the pack.
    pub offset: u64,
}

/// A parsed `.idx` file.
#[derive(Debug)]
pub struct PackIndex {
    entries: Vec<IdxEntry>,
    fanout: [u32; 256],
    pack_oid: ObjectId,
}

impl PackIndex {
    /// Parse and checksum-verify an index.
    ///
    /// # Errors
    /// - [`OdbError::Unsupported`] for index versions other than 2.
    /// - [`OdbError::Corrupt`] for bad magic, truncation, or a checksum
    ///   mismatch.
    #[allow(clippy::similar_names)]
    pub fn parse(data: &[u8], hash: HashKind) -> Result<Self, OdbError> {
        let at = "pack index";
        let oid_len = hash.oid_len();
        if data.len() < 8 + 256 * 4 + 2 * oid_len {
            return Err(OdbError::corrupt(at, "truncated"));
        }
        if data[..4] != MAGIC {
            return Err(OdbError::corrupt(at, "bad magic"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 {
            return Err(OdbError::Unsupported { what: format!("pack index version {version}") });
        }

        // Self-checksum covers everything before the final digest.
        let body_len = data.len() - oid_len;
        let mut hasher = Hasher::new(hash);
        hasher.update(&data[..body_len]);
        if hasher.finalize().as_bytes() != &data[body_len..] {
            return Err(OdbError::corrupt(at, "index checksum mismatch"));
        }

        let mut fanout = [0u32; 256];
        let mut pos = 8;
        for slot in &mut fanout {
            *slot = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
        }
        let count = fanout[255] as usize;

        let oids_end = pos + count * oid_len;
        let crcs_end = oids_end + count * 4;
        let offs_end = crcs_end + count * 4;
        if offs_end + 2 * oid_len > data.len() {
            return Err(OdbError::corrupt(at, "tables overrun file"));
        }

        let mut entries = Vec::with_capacity(count);
        let mut large = Vec::new();
        for i in 0..count {
            let raw_off = u32::from_be_bytes([
                data[crcs_end + i * 4],
                data[crcs_end + i * 4 + 1],
                data[crcs_end + i * 4 + 2],
                data[crcs_end + i * 4 + 3],
            ]);
            if raw_off & LARGE_OFFSET_FLAG != 0 {
                large.push((i, (raw_off & !LARGE_OFFSET_FLAG) as usize));
            }
            let oid_raw = &data[pos + i * oid_len..pos + (i + 1) * oid_len];
            let oid = ObjectId::from_bytes(hash, oid_raw)
                .ok_or_else(|| OdbError::corrupt(at, "bad oid width"))?;
            let crc32 = u32::from_be_bytes([
                data[oids_end + i * 4],
                data[oids_end + i * 4 + 1],
                data[oids_end + i * 4 + 2],
                data[oids_end + i * 4 + 3],
            ]);
            entries.push(IdxEntry { oid, crc32, offset: u64::from(raw_off) });
        }

        // Patch in 64-bit offsets.
        let large_table = &data[offs_end..body_len - oid_len];
        for (i, slot) in large {
            let base = slot * 8;
            let bytes: [u8; 8] = large_table
                .get(base..base + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| OdbError::corrupt(at, "large offset slot overruns table"))?;
            entries[i].offset = u64::from_be_bytes(bytes);
        }

        let pack_oid = ObjectId::from_bytes(hash, &data[body_len - oid_len..body_len])
            .ok_or_else(|| OdbError::corrupt(at, "bad pack digest width"))?;

        Ok(Self { entries, fanout, pack_oid })
    }

    /// Offset of `oid` in the paired pack, if present.
    #[must_use]
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let first = oid.as_bytes()[0] as usize;
        let lo = if first == 0 { 0 } else { self.fanout[first - 1] as usize };
        let hi = self.fanout[first] as usize;
        let bucket = &self.entries[lo..hi];
        bucket
            .binary_search_by(|e| e.oid.as_bytes().cmp(oid.as_bytes()))
            .ok()
            .map(|i| bucket[i].offset)
    }

    /// All rows, sorted by oid.
    #[must_use]
    pub fn entries(&self) -> &[IdxEntry] {
        &self.entries
    }

    /// Number of objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the paired pack holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trailer digest of the paired pack.
    #[must_use]
    pub const fn pack_oid(&self) -> ObjectId {
        self.pack_oid
    }

    /// Oids in the bucket sharing `prefix`'s leading byte whose hex form
    /// starts with `prefix`. Used for short-id resolution.
    #[must_use]
    pub fn prefix_matches(&self, prefix: &str) -> Vec<ObjectId> {
        self.entries
            .iter()
            .map(|e| e.oid)
            .filter(|oid| oid.to_hex().starts_with(prefix))
            .collect()
    }
}

/// Serialize a version-2 index for the given rows.
///
/// `rows` need not be sorted; `pack_oid` is the paired pack's trailer.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn write(hash: HashKind, rows: &[IdxEntry], pack_oid: &ObjectId) -> Vec<u8> {
    let mut rows: Vec<IdxEntry> = rows.to_vec();
    rows.sort_unstable_by(|a, b| a.oid.as_bytes().cmp(b.oid.as_bytes()));

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&2u32.to_be_bytes());

    let mut fanout = [0u32; 256];
    for row in &rows {
        fanout[row.oid.as_bytes()[0] as usize] += 1;
    }
    let mut running = 0u32;
    for slot in &mut fanout {
        running += *slot;
        *slot = running;
        out.extend_from_slice(&slot.to_be_bytes());
    }

    for row in &rows {
        out.extend_from_slice(row.oid.as_bytes());
    }
    for row in &rows {
        out.extend_from_slice(&row.crc32.to_be_bytes());
    }

    let mut large = Vec::new();
    for row in &rows {
        if row.offset < u64::from(LARGE_OFFSET_FLAG) {
            out.extend_from_slice(&(row.offset as u32).to_be_bytes());
        } else {
            out.extend_from_slice(&(LARGE_OFFSET_FLAG | large.len() as u32).to_be_bytes());
            large.push(row.offset);
        }
    }
    for offset in large {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_oid.as_bytes());
    let mut hasher = Hasher::new(hash);
    hasher.update(&out);
    let checksum = hasher.finalize();
    out.extend_from_slice(checksum.as_bytes());
    out
}
