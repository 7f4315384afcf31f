//! The unified error type for repository operations.
//!
//! [`Error`] is the single taxonomy every `keel` operation fails with. The
//! member crates keep their own narrower enums ([`keel_odb::OdbError`],
//! [`keel_wire::WireError`], [`keel_fs::FsError`]); lifting into this type
//! happens at the repository boundary, where the originating operation is
//! also recorded so a caller three layers up still knows which high-level
//! verb failed.

use thiserror::Error;

/// What kind of conflict an operation hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// A checkout would clobber local modifications.
    Checkout,
    /// A merge produced conflicting paths.
    Merge,
    /// A compare-and-swap ref update lost the race.
    Lock,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Checkout => write!(f, "checkout"),
            Self::Merge => write!(f, "merge"),
            Self::Lock => write!(f, "lock"),
        }
    }
}

/// Unified error type for repository operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A ref, object, or file was not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was missing.
        what: String,
    },

    /// Something that must not exist already does (e.g. a tag).
    #[error("already exists: {what}")]
    AlreadyExists {
        /// What collided.
        what: String,
    },

    /// Stored data failed validation.
    #[error("corrupt data at {at}: {detail}")]
    Corrupt {
        /// Where (file, object, offset).
        at: String,
        /// What was wrong.
        detail: String,
    },

    /// A checkout, merge, or lock conflict.
    #[error("{kind} conflict: {}", paths.join(", "))]
    Conflict {
        /// Which kind of conflict.
        kind: ConflictKind,
        /// The paths (or ref names) involved.
        paths: Vec<String>,
    },

    /// A required parameter was not supplied.
    #[error("missing parameter: {name}")]
    MissingParameter {
        /// Parameter name.
        name: &'static str,
    },

    /// A parameter was supplied but unusable.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The remote side violated the wire protocol (or reported a fatal
    /// error over side-band channel 3).
    #[error("protocol error during {stage}: {detail}")]
    Protocol {
        /// Exchange stage.
        stage: String,
        /// Details.
        detail: String,
    },

    /// The operation's abort signal fired; temp state has been discarded.
    #[error("operation cancelled")]
    Cancelled,

    /// A transport deadline elapsed. Retryable by the caller.
    #[error("timed out waiting for {what}")]
    TimedOut {
        /// What we were waiting on.
        what: String,
    },

    /// A format or protocol feature this implementation does not handle.
    #[error("unsupported: {what}")]
    Unsupported {
        /// The feature.
        what: String,
    },

    /// An I/O failure that is not better classified.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An inner failure annotated with the operation that originated it.
    #[error("{op}: {source}")]
    InOperation {
        /// The high-level operation (`"fetch"`, `"checkout"`, …).
        op: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Annotate this error with its originating operation.
    #[must_use]
    pub fn in_operation(self, op: &'static str) -> Self {
        match self {
            // Keep the outermost annotation only.
            already @ Self::InOperation { .. } => already,
            other => Self::InOperation { op, source: Box::new(other) },
        }
    }

    /// The error with any operation annotation stripped.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::InOperation { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<keel_fs::FsError> for Error {
    fn from(err: keel_fs::FsError) -> Self {
        match err {
            keel_fs::FsError::NotFound { path } => {
                Self::NotFound { what: path.display().to_string() }
            }
            keel_fs::FsError::AlreadyExists { path } => {
                Self::AlreadyExists { what: path.display().to_string() }
            }
            keel_fs::FsError::NotADirectory { path } => Self::InvalidParameter {
                name: "path",
                reason: format!("not a directory: {}", path.display()),
            },
            keel_fs::FsError::Io(io) => Self::Io(io),
        }
    }
}

impl From<keel_odb::OdbError> for Error {
    fn from(err: keel_odb::OdbError) -> Self {
        match err {
            keel_odb::OdbError::NotFound { oid } => {
                Self::NotFound { what: format!("object {oid}") }
            }
            keel_odb::OdbError::Corrupt { at, detail } => Self::Corrupt { at, detail },
            keel_odb::OdbError::Unsupported { what } => Self::Unsupported { what },
            keel_odb::OdbError::BaseMissing { oid } => {
                Self::NotFound { what: format!("delta base {oid}") }
            }
            keel_odb::OdbError::AmbiguousPrefix { prefix } => Self::InvalidParameter {
                name: "revision",
                reason: format!("ambiguous object prefix {prefix}"),
            },
            keel_odb::OdbError::Fs(fs) => fs.into(),
        }
    }
}

impl From<keel_wire::WireError> for Error {
    fn from(err: keel_wire::WireError) -> Self {
        match err {
            keel_wire::WireError::Protocol { stage, detail } => {
                Self::Protocol { stage: stage.to_owned(), detail }
            }
            keel_wire::WireError::Cancelled => Self::Cancelled,
            keel_wire::WireError::TimedOut { what } => Self::TimedOut { what: what.to_owned() },
            keel_wire::WireError::Unsupported { what } => Self::Unsupported { what },
            keel_wire::WireError::Io(io) => Self::Io(io),
        }
    }
}

/// Extension for annotating `Result`s with the originating operation.
pub trait ResultExt<T> {
    /// Map the error through [`Error::in_operation`].
    ///
    /// # Errors
    /// Returns the annotated error.
    fn in_operation(self, op: &'static str) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn in_operation(self, op: &'static str) -> Result<T, Error> {
        self.map_err(|e| e.into().in_operation(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_wraps_once() {
        let err = Error::Cancelled.in_operation("fetch").in_operation("pull");
        assert_eq!(err.to_string(), "fetch: operation cancelled");
        assert!(matches!(err.root(), Error::Cancelled));
    }

    #[test]
    fn odb_not_found_names_the_object() {
        let oid: keel_odb::ObjectId =
            "af5626b4a114abcb82d63db7c8082c3c4756e51b".parse().unwrap();
        let err: Error = keel_odb::OdbError::NotFound { oid }.into();
        assert!(err.to_string().contains("af5626b4"));
    }

    #[test]
    fn wire_protocol_error_keeps_stage() {
        let err: Error = keel_wire::WireError::protocol("negotiate", "bad line").into();
        match err {
            Error::Protocol { stage, .. } => assert_eq!(stage, "negotiate"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
