//! Native filesystem driver.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::{Backend, FileKind, FileStat, FsError, WriteMode};

/// [`Backend`] driver over `std::fs`, rooted at a directory.
///
/// All trait paths are resolved relative to the root given at construction.
/// Escaping the root via `..` components is rejected.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    root: PathBuf,
}

impl NativeBackend {
    /// Create a backend rooted at `root`. The directory does not need to
    /// exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The backend root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, FsError> {
        use std::path::Component;
        let mut out = self.root.clone();
        for comp in path.components() {
            match comp {
                Component::Normal(c) => out.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(FsError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path escapes backend root: {}", path.display()),
                    )));
                }
            }
        }
        Ok(out)
    }

    fn ensure_parent(full: &Path) -> Result<(), FsError> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Map `NotFound` I/O errors to `Ok(None)`, everything else to `FsError`.
fn absent_ok<T>(res: io::Result<T>) -> Result<Option<T>, FsError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::Io(e)),
    }
}

#[cfg(unix)]
fn set_mode(full: &Path, mode: WriteMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let bits = match mode {
        WriteMode::Regular => 0o644,
        WriteMode::Executable => 0o755,
    };
    fs::set_permissions(full, fs::Permissions::from_mode(bits))
}

#[cfg(not(unix))]
fn set_mode(_full: &Path, _mode: WriteMode) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn stat_of(meta: &fs::Metadata) -> FileStat {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Directory
    } else if meta.permissions().mode() & 0o111 != 0 {
        FileKind::Executable
    } else {
        FileKind::File
    };
    FileStat {
        kind,
        size: meta.len(),
        mtime_sec: meta.mtime() as u32,
        mtime_nsec: meta.mtime_nsec() as u32,
        ctime_sec: meta.ctime() as u32,
        ctime_nsec: meta.ctime_nsec() as u32,
        dev: meta.dev() as u32,
        ino: meta.ino() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
    }
}

#[cfg(not(unix))]
fn stat_of(meta: &fs::Metadata) -> FileStat {
    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    };
    FileStat {
        kind,
        size: meta.len(),
        ..FileStat::default()
    }
}

impl Backend for NativeBackend {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError> {
        absent_ok(fs::read(self.resolve(path)?))
    }

    fn write(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        fs::write(&full, data)?;
        set_mode(&full, mode)?;
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&full)?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists { path: path.to_path_buf() });
            }
            Err(e) => return Err(FsError::Io(e)),
        };
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let full = self.resolve(path)?;
        let Some(entries) = absent_ok(fs::read_dir(&full))? else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort_unstable();
        Ok(names)
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError> {
        Ok(absent_ok(fs::symlink_metadata(self.resolve(path)?))?
            .map(|meta| stat_of(&meta)))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError> {
        let full = self.resolve(link)?;
        Self::ensure_parent(&full)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &full)?;
        #[cfg(not(unix))]
        return Err(FsError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("symlinks not supported on this platform: {}", target.display()),
        )));
        #[cfg(unix)]
        Ok(())
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf, FsError> {
        let full = self.resolve(path)?;
        match fs::read_link(&full) {
            Ok(target) => Ok(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound { path: path.to_path_buf() })
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::ensure_parent(&dst)?;
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound { path: from.to_path_buf() })
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FsError::NotFound { path: path.to_path_buf() })
            }
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        match fs::remove_dir(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }

    fn write_atomic(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let dir = full.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;
        let (_file, tmp_path) = tmp.keep().map_err(|e| FsError::Io(e.error))?;
        set_mode(&tmp_path, mode)?;
        fs::rename(&tmp_path, &full)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, NativeBackend) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let be = NativeBackend::new(dir.path());
        (dir, be)
    }

    #[test]
    fn read_missing_is_none() {
        let (_dir, be) = backend();
        assert_eq!(be.read(Path::new("nope")).unwrap(), None);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, be) = backend();
        be.write(Path::new("a/b/c.txt"), b"hi", WriteMode::Regular).unwrap();
        assert_eq!(be.read(Path::new("a/b/c.txt")).unwrap().as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn create_new_rejects_existing() {
        let (_dir, be) = backend();
        be.create_new(Path::new("lock"), b"1").unwrap();
        let err = be.create_new(Path::new("lock"), b"2").unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists { .. }));
    }

    #[test]
    fn list_missing_dir_is_empty() {
        let (_dir, be) = backend();
        assert!(be.list(Path::new("no/dir")).unwrap().is_empty());
    }

    #[test]
    fn list_is_sorted() {
        let (_dir, be) = backend();
        be.write(Path::new("d/b"), b"", WriteMode::Regular).unwrap();
        be.write(Path::new("d/a"), b"", WriteMode::Regular).unwrap();
        be.write(Path::new("d/c"), b"", WriteMode::Regular).unwrap();
        assert_eq!(be.list(Path::new("d")).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn write_atomic_replaces_content() {
        let (_dir, be) = backend();
        be.write_atomic(Path::new("f"), b"one", WriteMode::Regular).unwrap();
        be.write_atomic(Path::new("f"), b"two", WriteMode::Regular).unwrap();
        assert_eq!(be.read(Path::new("f")).unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn paths_may_not_escape_root() {
        let (_dir, be) = backend();
        assert!(be.read(Path::new("../outside")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn executable_mode_round_trips_through_stat() {
        let (_dir, be) = backend();
        be.write(Path::new("run.sh"), b"#!/bin/sh\n", WriteMode::Executable).unwrap();
        let stat = be.stat(Path::new("run.sh")).unwrap().expect("stat");
        assert_eq!(stat.kind, FileKind::Executable);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_stat_does_not_follow() {
        let (_dir, be) = backend();
        be.write(Path::new("target"), b"x", WriteMode::Regular).unwrap();
        be.symlink(Path::new("target"), Path::new("link")).unwrap();
        let stat = be.stat(Path::new("link")).unwrap().expect("stat");
        assert_eq!(stat.kind, FileKind::Symlink);
        assert_eq!(be.read_link(Path::new("link")).unwrap(), PathBuf::from("target"));
    }
}
