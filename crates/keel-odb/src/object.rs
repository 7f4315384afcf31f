//! Canonical object form: `"<type> <size>\0<payload>"`.
//!
//! The wrapped form is what gets digested for the OID and what loose objects
//! store (zlib-deflated). Packfiles store the payload only, with the type
//! carried in the entry header.

use crate::error::OdbError;
use crate::oid::{HashKind, Hasher, ObjectId};

/// The four object types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Opaque file content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectKind {
    /// The canonical type name used in wrapped headers and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parse a type name.
    #[must_use]
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"blob" => Some(Self::Blob),
            b"tree" => Some(Self::Tree),
            b"commit" => Some(Self::Commit),
            b"tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the wrapped form of an object.
#[must_use]
pub fn wrap(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let header = format!("{} {}\0", kind.as_str(), payload.len());
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a wrapped object into its type and payload.
///
/// # Errors
/// Fails with [`OdbError::Corrupt`] on a malformed header or when the
/// declared size disagrees with the payload length, and with
/// [`OdbError::Unsupported`] on an unknown type name.
pub fn unwrap(bytes: &[u8]) -> Result<(ObjectKind, &[u8]), OdbError> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| OdbError::corrupt("object header", "missing NUL terminator"))?;
    let header = &bytes[..nul];
    let payload = &bytes[nul + 1..];

    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| OdbError::corrupt("object header", "missing space separator"))?;
    let kind = ObjectKind::from_name(&header[..space]).ok_or_else(|| OdbError::Unsupported {
        what: format!(
            "object type {:?}",
            String::from_utf8_lossy(&header[..space])
        ),
    })?;

    let size: usize = std::str::from_utf8(&header[space + 1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| OdbError::corrupt("object header", "unparsable size"))?;
    if size != payload.len() {
        return Err(OdbError::corrupt(
            "object header",
            format!("declared size {size} but payload is {} bytes", payload.len()),
        ));
    }
    Ok((kind, payload))
}

/// Compute the OID of an object without materializing the wrapped buffer.
#[must_use]
pub fn oid_of(hash: HashKind, kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = Hasher::new(hash);
    hasher.update(format!("{} {}\0", kind.as_str(), payload.len()).as_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let wrapped = wrap(ObjectKind::Blob, b"Hello world!\n");
        assert_eq!(&wrapped[..8], b"blob 13\0");
        let (kind, payload) = unwrap(&wrapped).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"Hello world!\n");
    }

    #[test]
    fn known_blob_oid() {
        let oid = oid_of(HashKind::Sha1, ObjectKind::Blob, b"Hello world!\n");
        assert_eq!(oid.to_string(), "af5626b4a114abcb82d63db7c8082c3c4756e51b");
    }

    #[test]
    fn empty_tree_oid_matches_constant() {
        let oid = oid_of(HashKind::Sha1, ObjectKind::Tree, b"");
        assert_eq!(oid, HashKind::Sha1.empty_tree());
    }

    #[test]
    fn unwrap_rejects_size_mismatch() {
        let err = unwrap(b"blob 5\0abc").unwrap_err();
        assert!(matches!(err, OdbError::Corrupt { .. }));
    }

    #[test]
    fn unwrap_rejects_unknown_type() {
        let err = unwrap(b"sprocket 3\0abc").unwrap_err();
        assert!(matches!(err, OdbError::Unsupported { .. }));
    }
}
