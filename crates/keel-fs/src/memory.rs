//! In-memory driver.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::{Backend, FileKind, FileStat, FsError, WriteMode};

#[derive(Clone, Debug)]
enum Node {
    File { data: Vec<u8>, mode: WriteMode, stat: FileStat },
    Symlink { target: PathBuf, stat: FileStat },
    Dir,
}

/// [`Backend`] driver over an in-memory tree.
///
/// Every operation takes a single mutex, which trivially satisfies the
/// atomicity contract. Stat fields that have no in-memory meaning (dev, uid,
/// gid) are zero; mtime/ctime/ino come from a per-backend counter so that
/// "file changed" is still observable through stat comparison.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    nodes: Mutex<BTreeMap<String, Node>>,
    clock: Mutex<u32>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u32 {
        let mut clock = self.clock.lock().expect("clock mutex poisoned");
        *clock += 1;
        *clock
    }

    fn fresh_stat(&self, kind: FileKind, size: u64) -> FileStat {
        let t = self.tick();
        FileStat {
            kind,
            size,
            mtime_sec: t,
            mtime_nsec: 0,
            ctime_sec: t,
            ctime_nsec: 0,
            dev: 1,
            ino: t,
            uid: 0,
            gid: 0,
        }
    }
}

/// Normalize to a `/`-joined key. Rejects `..` and absolute paths.
fn key_of(path: &Path) -> Result<String, FsError> {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes backend root: {}", path.display()),
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

fn parent_keys(key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    let Some((dirs, _file)) = key.rsplit_once('/') else {
        return out;
    };
    for part in dirs.split('/') {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

impl MemoryBackend {
    fn insert(&self, key: String, node: Node) {
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        for dir in parent_keys(&key) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        nodes.insert(key, node);
    }
}

impl Backend for MemoryBackend {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError> {
        let key = key_of(path)?;
        let nodes = self.nodes.lock().expect("node mutex poisoned");
        // Follow one level of symlink indirection, which is all the core
        // ever creates inside a gitdir.
        match nodes.get(&key) {
            Some(Node::File { data, .. }) => Ok(Some(data.clone())),
            Some(Node::Symlink { target, .. }) => {
                let target_key = key_of(target)?;
                match nodes.get(&target_key) {
                    Some(Node::File { data, .. }) => Ok(Some(data.clone())),
                    _ => Ok(None),
                }
            }
            Some(Node::Dir) | None => Ok(None),
        }
    }

    fn write(&self, path: &Path, data: &[u8], mode: WriteMode) -> Result<(), FsError> {
        let key = key_of(path)?;
        let kind = match mode {
            WriteMode::Regular => FileKind::File,
            WriteMode::Executable => FileKind::Executable,
        };
        let stat = self.fresh_stat(kind, data.len() as u64);
        self.insert(key, Node::File { data: data.to_vec(), mode, stat });
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let key = key_of(path)?;
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        if let Some(Node::File { data: existing, stat, .. }) = nodes.get_mut(&key) {
            existing.extend_from_slice(data);
            stat.size = existing.len() as u64;
            return Ok(());
        }
        drop(nodes);
        self.write(path, data, WriteMode::Regular)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<(), FsError> {
        let key = key_of(path)?;
        {
            let nodes = self.nodes.lock().expect("node mutex poisoned");
            if nodes.contains_key(&key) {
                return Err(FsError::AlreadyExists { path: path.to_path_buf() });
            }
        }
        self.write(path, data, WriteMode::Regular)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let key = key_of(path)?;
        let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        let nodes = self.nodes.lock().expect("node mutex poisoned");
        let mut names: Vec<String> = nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() {
                    None
                } else {
                    Some(rest.split('/').next().unwrap_or(rest).to_owned())
                }
            })
            .collect();
        names.dedup();
        Ok(names)
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError> {
        let key = key_of(path)?;
        let nodes = self.nodes.lock().expect("node mutex poisoned");
        Ok(nodes.get(&key).map(|node| match node {
            Node::File { stat, .. } | Node::Symlink { stat, .. } => *stat,
            Node::Dir => FileStat { kind: FileKind::Directory, ..FileStat::default() },
        }))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<(), FsError> {
        let key = key_of(link)?;
        let stat = self.fresh_stat(FileKind::Symlink, target.as_os_str().len() as u64);
        self.insert(key, Node::Symlink { target: target.to_path_buf(), stat });
        Ok(())
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf, FsError> {
        let key = key_of(path)?;
        let nodes = self.nodes.lock().expect("node mutex poisoned");
        match nodes.get(&key) {
            Some(Node::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(FsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {}", path.display()),
            ))),
            None => Err(FsError::NotFound { path: path.to_path_buf() }),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let from_key = key_of(from)?;
        let to_key = key_of(to)?;
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        let Some(node) = nodes.remove(&from_key) else {
            return Err(FsError::NotFound { path: from.to_path_buf() });
        };
        for dir in parent_keys(&to_key) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        nodes.insert(to_key, node);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        let key = key_of(path)?;
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        match nodes.remove(&key) {
            Some(Node::Dir) => {
                nodes.insert(key, Node::Dir);
                Err(FsError::NotADirectory { path: path.to_path_buf() })
            }
            Some(_) => Ok(()),
            None => Err(FsError::NotFound { path: path.to_path_buf() }),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        let key = key_of(path)?;
        let prefix = format!("{key}/");
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        let occupied = nodes.keys().any(|k| k.starts_with(&prefix));
        if occupied {
            return Err(FsError::NotADirectory { path: path.to_path_buf() });
        }
        nodes.remove(&key);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        let key = key_of(path)?;
        if key.is_empty() {
            return Ok(());
        }
        let mut nodes = self.nodes.lock().expect("node mutex poisoned");
        let mut acc = String::new();
        for part in key.split('/') {
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(part);
            nodes.entry(acc.clone()).or_insert(Node::Dir);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_overwrite() {
        let be = MemoryBackend::new();
        be.write(Path::new("a/b"), b"one", WriteMode::Regular).unwrap();
        be.write(Path::new("a/b"), b"two", WriteMode::Regular).unwrap();
        assert_eq!(be.read(Path::new("a/b")).unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn implicit_parent_dirs_are_listable() {
        let be = MemoryBackend::new();
        be.write(Path::new("refs/heads/main"), b"x", WriteMode::Regular).unwrap();
        assert_eq!(be.list(Path::new("refs")).unwrap(), vec!["heads"]);
        assert_eq!(be.list(Path::new("refs/heads")).unwrap(), vec!["main"]);
    }

    #[test]
    fn create_new_is_exclusive() {
        let be = MemoryBackend::new();
        be.create_new(Path::new("HEAD.lock"), b"").unwrap();
        assert!(matches!(
            be.create_new(Path::new("HEAD.lock"), b""),
            Err(FsError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn rename_moves_content() {
        let be = MemoryBackend::new();
        be.write(Path::new("tmp"), b"v", WriteMode::Regular).unwrap();
        be.rename(Path::new("tmp"), Path::new("refs/heads/main")).unwrap();
        assert_eq!(be.read(Path::new("tmp")).unwrap(), None);
        assert_eq!(be.read(Path::new("refs/heads/main")).unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn stat_changes_after_rewrite() {
        let be = MemoryBackend::new();
        be.write(Path::new("f"), b"a", WriteMode::Regular).unwrap();
        let first = be.stat(Path::new("f")).unwrap().expect("stat");
        be.write(Path::new("f"), b"b", WriteMode::Regular).unwrap();
        let second = be.stat(Path::new("f")).unwrap().expect("stat");
        assert_ne!(first.mtime_sec, second.mtime_sec);
    }

    #[test]
    fn symlink_read_follows_target() {
        let be = MemoryBackend::new();
        be.write(Path::new("real"), b"data", WriteMode::Regular).unwrap();
        be.symlink(Path::new("real"), Path::new("alias")).unwrap();
        assert_eq!(be.read(Path::new("alias")).unwrap().as_deref(), Some(&b"data"[..]));
        assert_eq!(be.read_link(Path::new("alias")).unwrap(), PathBuf::from("real"));
    }
}
