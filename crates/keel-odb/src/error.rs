//! Error types for object database operations.

use thiserror::Error;

use crate::oid::ObjectId;

/// Errors returned by object database operations.
///
/// The taxonomy is deliberately small: a missing object, corrupt bytes (with
/// a location), an unsupported format feature, a delta whose base cannot be
/// located, and storage failures lifted from the backend.
#[derive(Debug, Error)]
pub enum OdbError {
    /// The object is not present loose, in any pack, or in the multi-pack
    /// index.
    #[error("object not found: {oid}")]
    NotFound {
        /// The OID that could not be located.
        oid: ObjectId,
    },

    /// Stored bytes failed validation.
    #[error("corrupt object data at {at}: {detail}")]
    Corrupt {
        /// Where the corruption was detected (file, or file + offset).
        at: String,
        /// What was wrong.
        detail: String,
    },

    /// A format feature this implementation does not handle.
    #[error("unsupported: {what}")]
    Unsupported {
        /// The unsupported feature (e.g. `"pack version 3"`).
        what: String,
    },

    /// A ref-delta's base object is not resolvable in the pack or through
    /// the external-base lookup.
    #[error("delta base missing: {oid}")]
    BaseMissing {
        /// OID of the unresolvable base.
        oid: ObjectId,
    },

    /// A short id matched more than one object.
    #[error("ambiguous object prefix: {prefix}")]
    AmbiguousPrefix {
        /// The prefix that matched multiple objects.
        prefix: String,
    },

    /// Storage backend failure.
    #[error(transparent)]
    Fs(#[from] keel_fs::FsError),
}

impl OdbError {
    /// Shorthand for [`OdbError::Corrupt`].
    pub fn corrupt(at: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt { at: at.into(), detail: detail.into() }
    }
}
