//! Object identifiers and the repository hash function.
//!
//! A repository's hash function is fixed at init (`extensions.objectformat`
//! in the config) and every [`ObjectId`] carries which function produced it,
//! so a SHA-1 id can never be confused with a SHA-256 id of the same prefix.

use std::fmt;
use std::str::FromStr;

use sha1::Digest as _;

use crate::hex;

// ---------------------------------------------------------------------------
// HashKind
// ---------------------------------------------------------------------------

/// The hash function a repository uses for object ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum HashKind {
    /// 20-byte SHA-1 (the default object format).
    #[default]
    Sha1,
    /// 32-byte SHA-256 (`extensions.objectformat = sha256`).
    Sha256,
}

impl HashKind {
    /// Raw digest length in bytes.
    #[must_use]
    pub const fn oid_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hex digest length (40 or 64).
    #[must_use]
    pub const fn hex_len(self) -> usize {
        self.oid_len() * 2
    }

    /// The config value (`sha1` / `sha256`).
    #[must_use]
    pub const fn config_name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Parse the config value. Absent configuration means SHA-1.
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// The id of the empty tree for this hash function.
    ///
    /// Recognized without requiring the object to exist on disk.
    #[must_use]
    pub fn empty_tree(self) -> ObjectId {
        let hex = match self {
            Self::Sha1 => "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            Self::Sha256 => "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321",
        };
        hex.parse().expect("well-known empty-tree constant")
    }

    /// The all-zero sentinel id ("ref does not exist" on the wire).
    #[must_use]
    pub const fn zero(self) -> ObjectId {
        match self {
            Self::Sha1 => ObjectId::Sha1([0; 20]),
            Self::Sha256 => ObjectId::Sha256([0; 32]),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// A content-addressed object identifier.
///
/// Stored as raw digest bytes for cheap comparison and `Copy` semantics.
/// Displays as lowercase hex (40 or 64 characters).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// SHA-1 digest.
    Sha1([u8; 20]),
    /// SHA-256 digest.
    Sha256([u8; 32]),
}

impl ObjectId {
    /// Which hash function produced this id.
    #[must_use]
    pub const fn kind(&self) -> HashKind {
        match self {
            Self::Sha1(_) => HashKind::Sha1,
            Self::Sha256(_) => HashKind::Sha256,
        }
    }

    /// The raw digest bytes (20 or 32 of them).
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    /// Reconstruct an id from raw digest bytes of the given hash function.
    ///
    /// Returns `None` when the byte count does not match the hash.
    #[must_use]
    pub fn from_bytes(kind: HashKind, bytes: &[u8]) -> Option<Self> {
        match kind {
            HashKind::Sha1 => bytes.try_into().ok().map(Self::Sha1),
            HashKind::Sha256 => bytes.try_into().ok().map(Self::Sha256),
        }
    }

    /// `true` for the all-zero sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Error from parsing a hex string into an [`ObjectId`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParseError {
    /// The raw value that failed validation.
    pub value: String,
    /// Why validation failed.
    pub reason: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid OID {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for OidParseError {}

impl FromStr for ObjectId {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.len() {
            40 => HashKind::Sha1,
            64 => HashKind::Sha256,
            n => {
                return Err(OidParseError {
                    value: s.to_owned(),
                    reason: format!("expected 40 or 64 hex characters, got {n}"),
                });
            }
        };
        let bytes = hex::decode(s).map_err(|e| OidParseError {
            value: s.to_owned(),
            reason: e.reason,
        })?;
        Self::from_bytes(kind, &bytes).ok_or_else(|| OidParseError {
            value: s.to_owned(),
            reason: "length mismatch".to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Hasher
// ---------------------------------------------------------------------------

/// Incremental digest producing an [`ObjectId`].
pub enum Hasher {
    /// SHA-1 state.
    Sha1(sha1::Sha1),
    /// SHA-256 state.
    Sha256(sha2::Sha256),
}

impl Hasher {
    /// Start a digest for the given hash function.
    #[must_use]
    pub fn new(kind: HashKind) -> Self {
        match kind {
            HashKind::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HashKind::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finish and return the id.
    #[must_use]
    pub fn finalize(self) -> ObjectId {
        match self {
            Self::Sha1(h) => ObjectId::Sha1(h.finalize().into()),
            Self::Sha256(h) => ObjectId::Sha256(h.finalize().into()),
        }
    }
}

/// One-shot digest of a byte slice.
#[must_use]
pub fn digest(kind: HashKind, data: &[u8]) -> ObjectId {
    let mut hasher = Hasher::new(kind);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_roundtrip_hex() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let oid: ObjectId = hex.parse().unwrap();
        assert_eq!(oid.to_string(), hex);
        assert_eq!(oid.kind(), HashKind::Sha1);
    }

    #[test]
    fn sha256_width_is_recognized() {
        let hex = "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321";
        let oid: ObjectId = hex.parse().unwrap();
        assert_eq!(oid.kind(), HashKind::Sha256);
        assert_eq!(oid, HashKind::Sha256.empty_tree());
    }

    #[test]
    fn uppercase_hex_is_accepted() {
        let oid: ObjectId = "4B825DC642CB6EB9A060E54BF8D69288FBEE4904".parse().unwrap();
        assert_eq!(oid, HashKind::Sha1.empty_tree());
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert!("abc".parse::<ObjectId>().is_err());
        assert!("a".repeat(41).parse::<ObjectId>().is_err());
    }

    #[test]
    fn zero_sentinel() {
        assert!(HashKind::Sha1.zero().is_zero());
        assert!(!HashKind::Sha1.empty_tree().is_zero());
    }

    #[test]
    fn digest_known_sha1() {
        // `echo -n '' | sha1sum`
        let oid = digest(HashKind::Sha1, b"");
        assert_eq!(oid.to_string(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }
}
