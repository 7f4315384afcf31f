//! Pack emission.
//!
//! Writes every object in full (no delta compression). Deterministic: the
//! same object sequence always produces byte-identical packs, which keeps
//! push payloads and test fixtures reproducible.

use crate::object::ObjectKind;
use crate::oid::{HashKind, Hasher, ObjectId};
use crate::pack::{TYPE_BLOB, TYPE_COMMIT, TYPE_TAG, TYPE_TREE};
use crate::varint::encode_entry_header;
use crate::zlib;

const fn code_of(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::Commit => TYPE_COMMIT,
        ObjectKind::Tree => TYPE_TREE,
        ObjectKind::Blob => TYPE_BLOB,
        ObjectKind::Tag => TYPE_TAG,
    }
}

/// Serialize objects into a pack. Returns the pack bytes and the trailer
/// digest (the pack's identity).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn write_pack(hash: HashKind, objects: &[(ObjectKind, Vec<u8>)]) -> (Vec<u8>, ObjectId) {
    let mut out = Vec::new();
    out.extend_from_slice(b"PACK");
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&(objects.len() as u32).to_be_bytes());

    for (kind, payload) in objects {
        out.extend_from_slice(&encode_entry_header(code_of(*kind), payload.len() as u64));
        out.extend_from_slice(&zlib::deflate(payload));
    }

    let mut hasher = Hasher::new(hash);
    hasher.update(&out);
    let trailer = hasher.finalize();
    out.extend_from_slice(trailer.as_bytes());
    (out, trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_counts_objects() {
        let (bytes, _) = write_pack(HashKind::Sha1, &[(ObjectKind::Blob, b"a".to_vec())]);
        assert_eq!(&bytes[..4], b"PACK");
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 2);
        assert_eq!(u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 1);
    }

    #[test]
    fn deterministic_output() {
        let objs = vec![(ObjectKind::Blob, b"same".to_vec())];
        assert_eq!(write_pack(HashKind::Sha1, &objs), write_pack(HashKind::Sha1, &objs));
    }

    #[test]
    fn empty_pack_is_valid() {
        let (bytes, trailer) = write_pack(HashKind::Sha1, &[]);
        assert_eq!(bytes.len(), 12 + 20);
        assert_eq!(&bytes[bytes.len() - 20..], trailer.as_bytes());
    }
}
