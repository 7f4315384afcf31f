//! Multi-pack index (`objects/info/multi-pack-index`).
//!
//! One table over every pack in the repository: OID → (pack, offset).
//! Chunked file format — header, chunk directory, then the chunks this
//! implementation cares about (`PNAM`, `OIDF`, `OIDL`, `OOFF`, `LOFF`).
//! Unknown chunks are skipped on read and never written.

use std::collections::HashMap;

use crate::error::OdbError;
use crate::oid::{HashKind, Hasher, ObjectId};

const SIGNATURE: &[u8; 4] = b"MIDX";
const VERSION: u8 = 1;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

const CHUNK_PACK_NAMES: u32 = u32::from_be_bytes(*b"PNAM");
const CHUNK_OID_FANOUT: u32 = u32::from_be_bytes(*b"OIDF");
const CHUNK_OID_LOOKUP: u32 = u32::from_be_bytes(*b"OIDL");
const CHUNK_OFFSETS: u32 = u32::from_be_bytes(*b"OOFF");
const CHUNK_LARGE_OFFSETS: u32 = u32::from_be_bytes(*b"LOFF");

/// Where the multi-pack index says an object lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidxHit {
    /// Pack file name (e.g. `pack-<hex>.pack`).
    pub pack_name: String,
    /// Entry offset inside that pack.
    pub offset: u64,
}

/// A parsed multi-pack index.
#[derive(Debug)]
pub struct MultiPackIndex {
    pack_names: Vec<String>,
    // (oid, pack id, offset), sorted by oid.
    rows: Vec<(ObjectId, u32, u64)>,
}

impl MultiPackIndex {
    /// Parse and checksum-verify a multi-pack index.
    ///
    /// # Errors
    /// - [`OdbError::Unsupported`] for unknown versions or a hash function
    ///   other than the repository's.
    /// - [`OdbError::Corrupt`] for structural damage or checksum mismatch.
    #[allow(clippy::too_many_lines)]
    pub fn parse(data: &[u8], hash: HashKind) -> Result<Self, OdbError> {
        let at = "multi-pack-index";
        if data.len() < 12 + hash.oid_len() {
            return Err(OdbError::corrupt(at, "truncated"));
        }
        if &data[..4] != SIGNATURE {
            return Err(OdbError::corrupt(at, "bad signature"));
        }
        if data[4] != VERSION {
            return Err(OdbError::Unsupported {
                what: format!("multi-pack-index version {}", data[4]),
            });
        }
        let oid_version = data[5];
        let expected_oid_version = match hash {
            HashKind::Sha1 => 1,
            HashKind::Sha256 => 2,
        };
        if oid_version != expected_oid_version {
            return Err(OdbError::Unsupported {
                what: format!("multi-pack-index oid version {oid_version}"),
            });
        }
        let chunk_count = data[6] as usize;
        let pack_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;

        let body_len = data.len() - hash.oid_len();
        let mut hasher = Hasher::new(hash);
        hasher.update(&data[..body_len]);
        if hasher.finalize().as_bytes() != &data[body_len..] {
            return Err(OdbError::corrupt(at, "checksum mismatch"));
        }

        // Chunk directory: ids + offsets, closed by a zero-id sentinel.
        let mut chunks: HashMap<u32, (usize, usize)> = HashMap::new();
        let dir_start = 12;
        let mut prev: Option<(u32, usize)> = None;
        for i in 0..=chunk_count {
            let base = dir_start + i * 12;
            let entry = data
                .get(base..base + 12)
                .ok_or_else(|| OdbError::corrupt(at, "chunk directory overruns file"))?;
            let id = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let offset = usize::try_from(u64::from_be_bytes([
                entry[4], entry[5], entry[6], entry[7], entry[8], entry[9], entry[10], entry[11],
            ]))
            .map_err(|_| OdbError::corrupt(at, "chunk offset overflows usize"))?;
            if let Some((prev_id, prev_off)) = prev {
                if offset < prev_off || offset > body_len {
                    return Err(OdbError::corrupt(at, "chunk offsets not monotonic"));
                }
                chunks.insert(prev_id, (prev_off, offset));
            }
            prev = Some((id, offset));
        }

        let chunk = |id: u32| -> Result<&[u8], OdbError> {
            let &(start, end) = chunks
                .get(&id)
                .ok_or_else(|| OdbError::corrupt(at, format!("missing chunk {id:#x}")))?;
            Ok(&data[start..end])
        };

        let mut pack_names = Vec::with_capacity(pack_count);
        for name in chunk(CHUNK_PACK_NAMES)?.split(|&b| b == 0) {
            if !name.is_empty() {
                pack_names.push(String::from_utf8_lossy(name).into_owned());
            }
        }
        if pack_names.len() != pack_count {
            return Err(OdbError::corrupt(at, "pack name count mismatch"));
        }

        let fanout = chunk(CHUNK_OID_FANOUT)?;
        if fanout.len() != 256 * 4 {
            return Err(OdbError::corrupt(at, "bad fanout size"));
        }
        let count = u32::from_be_bytes([
            fanout[255 * 4],
            fanout[255 * 4 + 1],
            fanout[255 * 4 + 2],
            fanout[255 * 4 + 3],
        ]) as usize;

        let oid_len = hash.oid_len();
        let lookup = chunk(CHUNK_OID_LOOKUP)?;
        if lookup.len() != count * oid_len {
            return Err(OdbError::corrupt(at, "oid table size mismatch"));
        }
        let offsets = chunk(CHUNK_OFFSETS)?;
        if offsets.len() != count * 8 {
            return Err(OdbError::corrupt(at, "offset table size mismatch"));
        }
        let large = chunks
            .get(&CHUNK_LARGE_OFFSETS)
            .map(|&(s, e)| &data[s..e])
            .unwrap_or_default();

        let mut rows = Vec::with_capacity(count);
        for i in 0..count {
            let oid = ObjectId::from_bytes(hash, &lookup[i * oid_len..(i + 1) * oid_len])
                .ok_or_else(|| OdbError::corrupt(at, "bad oid width"))?;
            let pack_id = u32::from_be_bytes([
                offsets[i * 8],
                offsets[i * 8 + 1],
                offsets[i * 8 + 2],
                offsets[i * 8 + 3],
            ]);
            let raw_off = u32::from_be_bytes([
                offsets[i * 8 + 4],
                offsets[i * 8 + 5],
                offsets[i * 8 + 6],
                offsets[i * 8 + 7],
            ]);
            let offset = if raw_off & LARGE_OFFSET_FLAG == 0 {
                u64::from(raw_off)
            } else {
                let slot = ((raw_off & !LARGE_OFFSET_FLAG) as usize) * 8;
                let bytes: [u8; 8] = large
                    .get(slot..slot + 8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| OdbError::corrupt(at, "large offset overruns table"))?;
                u64::from_be_bytes(bytes)
            };
            if pack_id as usize >= pack_names.len() {
                return Err(OdbError::corrupt(at, format!("pack id {pack_id} out of range")));
            }
            rows.push((oid, pack_id, offset));
        }

        Ok(Self { pack_names, rows })
    }

    /// Locate an object.
    #[must_use]
    pub fn lookup(&self, oid: &ObjectId) -> Option<MidxHit> {
        self.rows
            .binary_search_by(|(row_oid, _, _)| row_oid.as_bytes().cmp(oid.as_bytes()))
            .ok()
            .map(|i| {
                let (_, pack_id, offset) = self.rows[i];
                MidxHit { pack_name: self.pack_names[pack_id as usize].clone(), offset }
            })
    }

    /// Number of objects indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// `true` when no objects are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The pack names this index covers, in directory order.
    #[must_use]
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }
}

/// Serialize a multi-pack index.
///
/// `packs` pairs each pack name with its sorted `(oid, offset)` rows; names
/// are sorted internally as the format requires.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn write(hash: HashKind, packs: &[(String, Vec<(ObjectId, u64)>)]) -> Vec<u8> {
    let mut packs: Vec<&(String, Vec<(ObjectId, u64)>)> = packs.iter().collect();
    packs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rows: Vec<(ObjectId, u32, u64)> = Vec::new();
    for (pack_id, (_, entries)) in packs.iter().enumerate() {
        for &(oid, offset) in entries {
            rows.push((oid, pack_id as u32, offset));
        }
    }
    rows.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    // Content-addressing: the same oid in two packs is the same object, so
    // keep the first copy only.
    rows.dedup_by(|a, b| a.0 == b.0);

    let mut pnam = Vec::new();
    for (name, _) in &packs {
        pnam.extend_from_slice(name.as_bytes());
        pnam.push(0);
    }
    while pnam.len() % 4 != 0 {
        pnam.push(0);
    }

    let mut fanout_chunk = Vec::with_capacity(256 * 4);
    let mut fanout = [0u32; 256];
    for (oid, _, _) in &rows {
        fanout[oid.as_bytes()[0] as usize] += 1;
    }
    let mut running = 0u32;
    for slot in &mut fanout {
        running += *slot;
        fanout_chunk.extend_from_slice(&running.to_be_bytes());
    }

    let mut oidl = Vec::new();
    for (oid, _, _) in &rows {
        oidl.extend_from_slice(oid.as_bytes());
    }

    let mut ooff = Vec::new();
    let mut loff = Vec::new();
    for &(_, pack_id, offset) in &rows {
        ooff.extend_from_slice(&pack_id.to_be_bytes());
        if offset < u64::from(LARGE_OFFSET_FLAG) {
            ooff.extend_from_slice(&(offset as u32).to_be_bytes());
        } else {
            ooff.extend_from_slice(&(LARGE_OFFSET_FLAG | (loff.len() / 8) as u32).to_be_bytes());
            loff.extend_from_slice(&offset.to_be_bytes());
        }
    }

    let mut chunk_list: Vec<(u32, Vec<u8>)> = vec![
        (CHUNK_PACK_NAMES, pnam),
        (CHUNK_OID_FANOUT, fanout_chunk),
        (CHUNK_OID_LOOKUP, oidl),
        (CHUNK_OFFSETS, ooff),
    ];
    if !loff.is_empty() {
        chunk_list.push((CHUNK_LARGE_OFFSETS, loff));
    }

    let mut out = Vec::new();
    out.extend_from_slice(SIGNATURE);
    out.push(VERSION);
    out.push(match hash {
        HashKind::Sha1 => 1,
        HashKind::Sha256 => 2,
    });
    out.push(chunk_list.len() as u8);
    out.push(0); // no base multi-pack-index chain
    out.extend_from_slice(&(packs.len() as u32).to_be_bytes());

    let dir_len = (chunk_list.len() + 1) * 12;
    let mut offset = out.len() + dir_len;
    for (id, body) in &chunk_list {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&(offset as u64).to_be_bytes());
        offset += body.len();
    }
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&(offset as u64).to_be_bytes());

    for (_, body) in &chunk_list {
        out.extend_from_slice(body);
    }

    let mut hasher = Hasher::new(hash);
    hasher.update(&out);
    let checksum = hasher.finalize();
    out.extend_from_slice(checksum.as_bytes());
    out
}
