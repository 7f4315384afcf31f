//! Pluggable storage backend for keel.
//!
//! This crate defines the [`Backend`] trait — the single interface through
//! which every other keel crate touches storage. No keel crate should call
//! `std::fs` directly; instead, they hold a `dyn Backend` handle and program
//! against the trait, so a repository can live on a native filesystem, in
//! memory, or on anything else that can satisfy the capability set.
//!
//! # Crate layout
//!
//! - [`Backend`] — the capability trait (read, write, list, stat, symlink,
//!   atomic rename, remove).
//! - [`native`] — the [`NativeBackend`](native::NativeBackend) driver over
//!   `std::fs`, rooted at a directory.
//! - [`memory`] — the [`MemoryBackend`](memory::MemoryBackend) driver over an
//!   in-memory tree, for tests and ephemeral repositories.
//!
//! All paths handed to a backend are `/`-separated and relative to the
//! backend root. Platform quirks (Windows short/long path normalization,
//! permission bit emulation) are a driver concern and never leak above this
//! trait.

pub mod memory;
pub mod native;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use memory::MemoryBackend;
pub use native::NativeBackend;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`Backend`] operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist.
    #[error("no such path: {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The path already exists and the operation required it not to
    /// (e.g. [`Backend::create_new`] used for lock sentinels).
    #[error("path already exists: {}", path.display())]
    AlreadyExists {
        /// The colliding path.
        path: PathBuf,
    },

    /// A directory operation was attempted on a non-directory (or the
    /// reverse).
    #[error("not a directory: {}", path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Any other I/O failure from the underlying driver.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Stat model
// ---------------------------------------------------------------------------

/// What kind of entry a path names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Regular file.
    #[default]
    File,
    /// Regular file with the executable bit set.
    Executable,
    /// Symbolic link.
    Symlink,
    /// Directory.
    Directory,
}

/// Mode for newly written files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// `0o644`-style regular file.
    Regular,
    /// `0o755`-style executable file.
    Executable,
}

/// A stat snapshot in the shape the dircache stores it.
///
/// Fields are truncated to 32 bits exactly as the index binary format does;
/// drivers that cannot supply a field (in-memory, non-unix) report zero, and
/// consumers must treat zero as "unknown" rather than "epoch".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    /// Entry kind.
    pub kind: FileKind,
    /// Size in bytes (truncated to 32 bits by index consumers).
    pub size: u64,
    /// Last-modification time, seconds part.
    pub mtime_sec: u32,
    /// Last-modification time, nanoseconds part.
    pub mtime_nsec: u32,
    /// Inode-change time, seconds part.
    pub ctime_sec: u32,
    /// Inode-change time, nanoseconds part.
    pub ctime_nsec: u32,
    /// Device number.
    pub dev: u32,
    /// Inode number.
    pub ino: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// The storage capability set keel requires.
///
/// Implementations must be usable from multiple threads: `&self` methods may
/// be called concurrently. Atomicity guarantees:
///
/// - [`rename`](Backend::rename) is atomic with respect to readers — a
///   concurrent [`read`](Backend::read) of the destination sees either the
///   old content or the new, never a torn write.
/// - [`create_new`](Backend::create_new) fails with
///   [`FsError::AlreadyExists`] if the path exists; this is the primitive
///   ref locks are built on.
///
/// Paths are `/`-separated and relative to the backend root. Parent
/// directories are created implicitly by [`write`](Backend::write) and
/// friends.
pub trait Backend: Send + Sync {
    /// Read the full contents of a file. Returns `Ok(None)` if the path does
    /// not exist; symlinks are followed.
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError>;

    /// Write a file, replacing any previous content. Parent directories are
    /// created as needed.
    fn write(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<(), FsError>;

    /// Append to a file, creating it (and parents) if absent.
    fn append(&self, path: &Path, data: &[u8]) -> Result<(), FsError>;

    /// Create a file that must not already exist.
    ///
    /// Fails with [`FsError::AlreadyExists`] if the path is present. The
    /// existence check and the creation are a single atomic step.
    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), FsError>;

    /// List the entry names directly under a directory, sorted bytewise.
    /// Returns an empty list if the directory does not exist.
    fn list(&self, path: &Path) -> Result<Vec<String>, FsError>;

    /// Stat a path without following symlinks (lstat semantics).
    /// Returns `Ok(None)` if the path does not exist.
    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError>;

    /// Create a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError>;

    /// Read the target of a symbolic link.
    fn read_link(&self, path: &Path) -> Result<PathBuf, FsError>;

    /// Atomically rename `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Remove a file or symlink. Removing a missing path is an error.
    fn remove(&self, path: &Path) -> Result<(), FsError>;

    /// Remove an empty directory. Ignores missing paths.
    fn remove_dir(&self, path: &Path) -> Result<(), FsError>;

    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError>;

    /// Write via a temp sibling plus atomic rename.
    ///
    /// This is the commit primitive for every multi-byte file the core
    /// mutates (refs, index, packed-refs): a reader never observes a
    /// partially written file.
    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<(), FsError> {
        let tmp = temp_sibling(path);
        self.write(&tmp, data, mode)?;
        self.rename(&tmp, path)
    }
}

/// Build a temp-file sibling name next to `path`.
///
/// The name only needs to be unique per-process per-path: concurrent writers
/// of the same path are already serialized by the repository's logical locks.
fn temp_sibling(path: &Path) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map_or_else(|| "tmp".to_owned(), |f| f.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.keel-{}-{n}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_stays_in_same_directory() {
        let t = temp_sibling(Path::new("refs/heads/main"));
        assert_eq!(t.parent(), Some(Path::new("refs/heads")));
        assert!(t.file_name().is_some_and(|f| f.to_string_lossy().starts_with(".main.keel-")));
    }

    #[test]
    fn temp_siblings_are_unique() {
        let a = temp_sibling(Path::new("index"));
        let b = temp_sibling(Path::new("index"));
        assert_ne!(a, b);
    }
}
