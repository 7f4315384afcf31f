//! Packfile reading.
//!
//! A pack is `"PACK"` + version (2) + object count, followed by back-to-back
//! entries, followed by a digest of everything before it. Entries are either
//! full objects (zlib payload) or deltas against a base found by backward
//! offset (`ofs-delta`) or by id (`ref-delta`, possibly external to the
//! pack).

use std::path::PathBuf;

use crate::delta;
use crate::error::OdbError;
use crate::object::ObjectKind;
use crate::oid::{HashKind, Hasher, ObjectId};
use crate::varint::{parse_entry_header, parse_ofs_distance};
use crate::zlib;

/// Pack entry type codes.
pub const TYPE_COMMIT: u8 = 1;
/// Tree type code.
pub const TYPE_TREE: u8 = 2;
/// Blob type code.
pub const TYPE_BLOB: u8 = 3;
/// Tag type code.
pub const TYPE_TAG: u8 = 4;
/// Delta against an earlier entry in the same pack, addressed by backward
/// offset.
pub const TYPE_OFS_DELTA: u8 = 6;
/// Delta against a base addressed by OID.
pub const TYPE_REF_DELTA: u8 = 7;

/// Map a full-object type code to its [`ObjectKind`].
#[must_use]
pub const fn kind_of_code(code: u8) -> Option<ObjectKind> {
    match code {
        TYPE_COMMIT => Some(ObjectKind::Commit),
        TYPE_TREE => Some(ObjectKind::Tree),
        TYPE_BLOB => Some(ObjectKind::Blob),
        TYPE_TAG => Some(ObjectKind::Tag),
        _ => None,
    }
}

/// Resolver for ref-delta bases not present in the pack itself.
pub type ExternalBase<'a> =
    &'a dyn Fn(&ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, OdbError>;

/// A parsed, trailer-verified packfile held in memory.
#[derive(Debug)]
pub struct PackFile {
    path: PathBuf,
    data: Vec<u8>,
    object_count: u32,
    hash: HashKind,
}

impl PackFile {
    /// Parse and verify a packfile.
    ///
    /// # Errors
    /// - [`OdbError::Unsupported`] for any version other than 2.
    /// - [`OdbError::Corrupt`] for a bad magic, a short file, or a trailer
    ///   that does not match the digest of the preceding bytes.
    pub fn parse(path: PathBuf, data: Vec<u8>, hash: HashKind) -> Result<Self, OdbError> {
        let at = || path.display().to_string();
        if data.len() < 12 + hash.oid_len() {
            return Err(OdbError::corrupt(at(), "shorter than header + trailer"));
        }
        if &data[..4] != b"PACK" {
            return Err(OdbError::corrupt(at(), "bad magic"));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 {
            return Err(OdbError::Unsupported { what: format!("pack version {version}") });
        }
        let object_count = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let body_len = data.len() - hash.oid_len();
        let mut hasher = Hasher::new(hash);
        hasher.update(&data[..body_len]);
        let expected = hasher.finalize();
        if expected.as_bytes() != &data[body_len..] {
            return Err(OdbError::corrupt(at(), "trailer digest mismatch"));
        }

        Ok(Self { path, data, object_count, hash })
    }

    /// Number of objects the header declares.
    #[must_use]
    pub const fn object_count(&self) -> u32 {
        self.object_count
    }

    /// The pack's identity: its trailer digest.
    #[must_use]
    pub fn trailer_oid(&self) -> ObjectId {
        let body_len = self.data.len() - self.hash.oid_len();
        ObjectId::from_bytes(self.hash, &self.data[body_len..])
            .unwrap_or_else(|| self.hash.zero())
    }

    /// Backend-relative path this pack was loaded from.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Raw pack bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Materialize the object stored at `offset`, resolving delta chains.
    ///
    /// `external` is consulted for ref-delta bases that are not in this
    /// pack.
    ///
    /// # Errors
    /// - [`OdbError::Corrupt`] for malformed entries or offsets.
    /// - [`OdbError::BaseMissing`] when a ref-delta base is nowhere to be
    ///   found.
    pub fn entry_at(
        &self,
        offset: u64,
        external: ExternalBase<'_>,
    ) -> Result<(ObjectKind, Vec<u8>), OdbError> {
        let at = |detail: String| OdbError::Corrupt {
            at: format!("{}@{offset}", self.path.display()),
            detail,
        };
        let start = usize::try_from(offset).map_err(|_| at("offset overflows usize".into()))?;
        let body_len = self.data.len() - self.hash.oid_len();
        if start < 12 || start >= body_len {
            return Err(at("offset outside pack body".into()));
        }

        let header = parse_entry_header(&self.data[start..body_len])?;
        let mut pos = start + header.header_len;

        let (kind, payload) = match header.type_code {
            code if kind_of_code(code).is_some() => {
                let (payload, _) = zlib::inflate_prefix(&self.data[pos..body_len])?;
                // kind_of_code checked above
                (kind_of_code(code).unwrap_or(ObjectKind::Blob), payload)
            }
            TYPE_OFS_DELTA => {
                let (distance, used) = parse_ofs_distance(&self.data[pos..body_len])?;
                pos += used;
                let base_offset = offset
                    .checked_sub(distance)
                    .ok_or_else(|| at(format!("ofs-delta distance {distance} before pack start")))?;
                let (base_kind, base) = self.entry_at(base_offset, external)?;
                let (raw_delta, _) = zlib::inflate_prefix(&self.data[pos..body_len])?;
                (base_kind, delta::apply(&base, &raw_delta)?)
            }
            TYPE_REF_DELTA => {
                let oid_len = self.hash.oid_len();
                let raw = self
                    .data
                    .get(pos..pos + oid_len)
                    .ok_or_else(|| at("truncated ref-delta base id".into()))?;
                let base_oid = ObjectId::from_bytes(self.hash, raw)
                    .ok_or_else(|| at("bad ref-delta base id".into()))?;
                pos += oid_len;
                let (base_kind, base) = external(&base_oid)?
                    .ok_or(OdbError::BaseMissing { oid: base_oid })?;
                let (raw_delta, _) = zlib::inflate_prefix(&self.data[pos..body_len])?;
                (base_kind, delta::apply(&base, &raw_delta)?)
            }
            code => {
                return Err(OdbError::Unsupported {
                    what: format!("pack entry type {code}"),
                });
            }
        };

        if payload.len() as u64 != header.size {
            return Err(at(format!(
                "inflated size {} disagrees with declared size {}",
                payload.len(),
                header.size
            )));
        }
        Ok((kind, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack_writer;

    fn no_external(_: &ObjectId) -> Result<Option<(ObjectKind, Vec<u8>)>, OdbError> {
        Ok(None)
    }

    fn sample_pack() -> (Vec<u8>, ObjectId) {
        let objects = vec![
            (ObjectKind::Blob, b"Hello world!\n".to_vec()),
            (ObjectKind::Blob, b"second".to_vec()),
        ];
        pack_writer::write_pack(HashKind::Sha1, &objects)
    }

    #[test]
    fn parse_and_read_first_entry() {
        let (bytes, trailer) = sample_pack();
        let pack = PackFile::parse(PathBuf::from("test.pack"), bytes, HashKind::Sha1).unwrap();
        assert_eq!(pack.object_count(), 2);
        assert_eq!(pack.trailer_oid(), trailer);

        let (kind, payload) = pack.entry_at(12, &no_external).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"Hello world!\n");
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let (mut bytes, _) = sample_pack();
        bytes[0] = b'J';
        assert!(matches!(
            PackFile::parse(PathBuf::from("x.pack"), bytes, HashKind::Sha1),
            Err(OdbError::Corrupt { .. })
        ));
    }

    #[test]
    fn version_three_is_unsupported() {
        let (mut bytes, _) = sample_pack();
        bytes[7] = 3;
        assert!(matches!(
            PackFile::parse(PathBuf::from("x.pack"), bytes, HashKind::Sha1),
            Err(OdbError::Unsupported { .. })
        ));
    }

    #[test]
    fn flipped_byte_breaks_the_trailer() {
        let (mut bytes, _) = sample_pack();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(
            PackFile::parse(PathBuf::from("x.pack"), bytes, HashKind::Sha1),
            Err(OdbError::Corrupt { .. })
        ));
    }
}
