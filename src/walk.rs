//! Unified N-source tree walking.
//!
//! One traversal visits the union of paths across any combination of
//! committed trees, the staging index, and the worktree. At every visited
//! path the `map` hook sees one slot per source (`None` where the source
//! lacks the path), so asymmetric presence is directly observable — the
//! shape diff, status, and checkout pre-checks are all built on.
//!
//! Child iteration is sequential by design: concurrent traversal while a
//! checkout is writing causes file-lock contention on several storage
//! backends, so parallel iteration must always be an explicit opt-in layer
//! above this module, never the default here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use keel_fs::{Backend, FileKind, FileStat};
use keel_odb::object::oid_of;
use keel_odb::{EntryMode, ObjectId, ObjectKind, ObjectStore, tree};

use crate::error::Error;
use crate::index::Index;

/// One side of a walk.
#[derive(Clone, Debug)]
pub enum WalkSource<'a> {
    /// A committed tree, by tree id (callers peel commits first).
    Tree(ObjectId),
    /// The staging index (stage-0 entries).
    Index(&'a Index),
    /// The working directory.
    Worktree,
}

/// What one source knows about a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceEntry {
    /// Entry mode in this source.
    pub mode: EntryMode,
    /// Object id. Worktree files are hashed on visit so the id is always
    /// present for files; directories carry `None`.
    pub oid: Option<ObjectId>,
    /// Stat cache, where the source has one (index, worktree).
    pub stat: Option<FileStat>,
}

impl SourceEntry {
    /// `true` when this entry is a directory in its source.
    #[must_use]
    pub const fn is_tree(&self) -> bool {
        matches!(self.mode, EntryMode::Tree)
    }
}

/// The map hook: path plus one slot per source.
pub type MapFn<'f, V> =
    dyn FnMut(&str, &[Option<SourceEntry>]) -> Result<Option<V>, Error> + 'f;
/// The reduce hook: mapped parent value plus folded child values.
pub type ReduceFn<'f, V> = dyn FnMut(V, Vec<V>) -> Result<V, Error> + 'f;

/// Walking context over one repository's stores.
pub struct Walker<'a> {
    store: &'a ObjectStore,
    backend: &'a dyn Backend,
    workdir: Option<&'a Path>,
}

impl<'a> Walker<'a> {
    /// Build a walker. `workdir` is required only when a
    /// [`WalkSource::Worktree`] participates.
    #[must_use]
    pub fn new(
        store: &'a ObjectStore,
        backend: &'a dyn Backend,
        workdir: Option<&'a Path>,
    ) -> Self {
        Self { store, backend, workdir }
    }

    /// Walk the union of `sources` in lexicographic path order (directories
    /// compare with a `/` suffix).
    ///
    /// `map` runs once per visited path, root (`""`) included; returning
    /// `Ok(None)` drops the node but keeps its subtree's values, which then
    /// bubble past it. `reduce` folds a mapped node with its children's
    /// folded values. The returned vector carries the surviving top-level
    /// values (a single element when the root mapped to a value).
    ///
    /// # Errors
    /// Hook errors and store/backend failures propagate unchanged.
    pub fn walk<V>(
        &self,
        sources: &[WalkSource<'_>],
        map: &mut MapFn<'_, V>,
        reduce: &mut ReduceFn<'_, V>,
    ) -> Result<Vec<V>, Error> {
        let roots: Vec<Option<SourceEntry>> = sources
            .iter()
            .map(|source| {
                Some(SourceEntry {
                    mode: EntryMode::Tree,
                    oid: match source {
                        WalkSource::Tree(oid) => Some(*oid),
                        _ => None,
                    },
                    stat: None,
                })
            })
            .collect();
        self.visit(sources, "", &roots, map, reduce)
    }

    fn visit<V>(
        &self,
        sources: &[WalkSource<'_>],
        path: &str,
        entries: &[Option<SourceEntry>],
        map: &mut MapFn<'_, V>,
        reduce: &mut ReduceFn<'_, V>,
    ) -> Result<Vec<V>, Error> {
        let mapped = map(path, entries)?;

        // Merge children by name across every source that sees a directory
        // here, so a name that is a file on one side and a directory on
        // another still gets exactly one visit.
        let mut merged: BTreeMap<String, Vec<Option<SourceEntry>>> = BTreeMap::new();
        for (i, (source, entry)) in sources.iter().zip(entries).enumerate() {
            let Some(entry) = entry else { continue };
            if !entry.is_tree() {
                continue;
            }
            for (name, child) in self.children_of(source, path, entry)? {
                let slots = merged.entry(name).or_insert_with(|| vec![None; sources.len()]);
                if slots[i].is_none() {
                    slots[i] = Some(child);
                }
            }
        }

        // Visit order follows tree order; a name counts as a directory if
        // any source sees it as one.
        let mut visited: Vec<(String, Vec<Option<SourceEntry>>)> = merged.into_iter().collect();
        visited.sort_by(|(a_name, a_slots), (b_name, b_slots)| {
            let a_tree = a_slots.iter().flatten().any(SourceEntry::is_tree);
            let b_tree = b_slots.iter().flatten().any(SourceEntry::is_tree);
            tree::entry_order(a_name.as_bytes(), a_tree, b_name.as_bytes(), b_tree)
        });

        let mut child_values = Vec::new();
        for (name, slots) in visited {
            let child_path = if path.is_empty() {
                name
            } else {
                format!("{path}/{name}")
            };
            child_values.extend(self.visit(sources, &child_path, &slots, map, reduce)?);
        }

        match mapped {
            Some(value) => Ok(vec![reduce(value, child_values)?]),
            None => Ok(child_values),
        }
    }

    fn children_of(
        &self,
        source: &WalkSource<'_>,
        path: &str,
        entry: &SourceEntry,
    ) -> Result<Vec<(String, SourceEntry)>, Error> {
        match source {
            WalkSource::Tree(_) => {
                let Some(tree_oid) = entry.oid else {
                    return Ok(Vec::new());
                };
                let data = self.store.read(&tree_oid)?;
                let parsed = tree::parse(&data.bytes, self.store.hash())?;
                Ok(parsed
                    .into_iter()
                    .map(|e| {
                        let oid = Some(e.oid);
                        (e.name_lossy(), SourceEntry { mode: e.mode, oid, stat: None })
                    })
                    .collect())
            }
            WalkSource::Index(index) => Ok(index_children(index, path)),
            WalkSource::Worktree => self.worktree_children(path),
        }
    }

    fn worktree_children(&self, path: &str) -> Result<Vec<(String, SourceEntry)>, Error> {
        let Some(workdir) = self.workdir else {
            return Err(Error::MissingParameter { name: "workdir" });
        };
        let dir: PathBuf = if path.is_empty() {
            workdir.to_path_buf()
        } else {
            workdir.join(path)
        };
        let mut out = Vec::new();
        for name in self.backend.list(&dir)? {
            if name == ".git" {
                continue;
            }
            let full = dir.join(&name);
            let Some(stat) = self.backend.stat(&full)? else {
                continue;
            };
            let (mode, oid) = match stat.kind {
                FileKind::Directory => (EntryMode::Tree, None),
                FileKind::Symlink => {
                    let target = self.backend.read_link(&full)?;
                    let bytes = target.to_string_lossy().into_owned().into_bytes();
                    (
                        EntryMode::Link,
                        Some(oid_of(self.store.hash(), ObjectKind::Blob, &bytes)),
                    )
                }
                kind => {
                    let mode = if kind == FileKind::Executable {
                        EntryMode::BlobExecutable
                    } else {
                        EntryMode::Blob
                    };
                    let bytes = self.backend.read(&full)?.unwrap_or_default();
                    (mode, Some(oid_of(self.store.hash(), ObjectKind::Blob, &bytes)))
                }
            };
            out.push((name, SourceEntry { mode, oid, stat: Some(stat) }));
        }
        Ok(out)
    }
}

/// Immediate children of `path` implied by the index's flat path list.
fn index_children(index: &Index, path: &str) -> Vec<(String, SourceEntry)> {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };
    let mut out: BTreeMap<String, SourceEntry> = BTreeMap::new();
    for entry in index.iter_prefix(&prefix) {
        let rest = &entry.path[prefix.len()..];
        match rest.split_once('/') {
            Some((dir, _)) => {
                out.entry(dir.to_owned()).or_insert(SourceEntry {
                    mode: EntryMode::Tree,
                    oid: None,
                    stat: None,
                });
            }
            None => {
                out.insert(
                    rest.to_owned(),
                    SourceEntry {
                        mode: entry.mode,
                        oid: Some(entry.oid),
                        stat: Some(entry.stat),
                    },
                );
            }
        }
    }
    out.into_iter().collect()
}

/// Convenience: flatten a committed tree into path → `(mode, oid)` rows.
///
/// # Errors
/// Store failures propagate.
pub fn flatten_tree(
    store: &ObjectStore,
    root: ObjectId,
) -> Result<BTreeMap<String, (EntryMode, ObjectId)>, Error> {
    let mut rows = BTreeMap::new();
    flatten_into(store, "", root, &mut rows)?;
    Ok(rows)
}

fn flatten_into(
    store: &ObjectStore,
    prefix: &str,
    tree_oid: ObjectId,
    rows: &mut BTreeMap<String, (EntryMode, ObjectId)>,
) -> Result<(), Error> {
    let data = store.read(&tree_oid)?;
    for entry in tree::parse(&data.bytes, store.hash())? {
        let path = if prefix.is_empty() {
            entry.name_lossy()
        } else {
            format!("{prefix}/{}", entry.name_lossy())
        };
        if entry.mode.is_tree() {
            flatten_into(store, &path, entry.oid, rows)?;
        } else {
            rows.insert(path, (entry.mode, entry.oid));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use keel_fs::{MemoryBackend, WriteMode};
    use keel_odb::{HashKind, TreeEntry};

    use super::*;
    use crate::index::IndexEntry;

    fn store_on(backend: &Arc<dyn Backend>) -> ObjectStore {
        ObjectStore::new(Arc::clone(backend), PathBuf::from(".git/objects"), HashKind::Sha1)
    }

    fn write_blob(store: &ObjectStore, data: &[u8]) -> ObjectId {
        store.write(ObjectKind::Blob, data, false).unwrap()
    }

    fn write_tree(store: &ObjectStore, entries: &mut Vec<TreeEntry>) -> ObjectId {
        tree::sort_entries(entries);
        store.write(ObjectKind::Tree, &tree::serialize(entries), false).unwrap()
    }

    fn tree_entry(name: &str, mode: EntryMode, oid: ObjectId) -> TreeEntry {
        TreeEntry { mode, name: name.as_bytes().to_vec(), oid }
    }

    #[test]
    fn single_tree_walk_visits_in_order() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = store_on(&backend);
        let blob = write_blob(&store, b"x");
        let sub = write_tree(&store, &mut vec![tree_entry("inner.txt", EntryMode::Blob, blob)]);
        let root = write_tree(&store, &mut vec![
            tree_entry("b.txt", EntryMode::Blob, blob),
            tree_entry("a", EntryMode::Tree, sub),
        ]);

        let walker = Walker::new(&store, backend.as_ref(), None);
        let mut seen = Vec::new();
        walker
            .walk::<()>(
                &[WalkSource::Tree(root)],
                &mut |path, _| {
                    seen.push(path.to_owned());
                    Ok(None)
                },
                &mut |v, _| Ok(v),
            )
            .unwrap();
        assert_eq!(seen, vec!["", "a", "a/inner.txt", "b.txt"]);
    }

    #[test]
    fn asymmetric_presence_shows_none_slots() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = store_on(&backend);
        let blob = write_blob(&store, b"x");
        let root = write_tree(&store, &mut vec![tree_entry("only.txt", EntryMode::Blob, blob)]);

        let mut index = Index::new(HashKind::Sha1);
        index.insert(IndexEntry::new("staged.txt", EntryMode::Blob, blob));

        let walker = Walker::new(&store, backend.as_ref(), None);
        let mut rows: Vec<(String, bool, bool)> = Vec::new();
        walker
            .walk::<()>(
                &[WalkSource::Tree(root), WalkSource::Index(&index)],
                &mut |path, entries| {
                    if !path.is_empty() {
                        rows.push((path.to_owned(), entries[0].is_some(), entries[1].is_some()));
                    }
                    Ok(None)
                },
                &mut |v, _| Ok(v),
            )
            .unwrap();
        assert_eq!(rows, vec![
            ("only.txt".to_owned(), true, false),
            ("staged.txt".to_owned(), false, true),
        ]);
    }

    #[test]
    fn reduce_folds_child_values_into_parent() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = store_on(&backend);
        let blob = write_blob(&store, b"x");
        let sub = write_tree(&store, &mut vec![
            tree_entry("f1", EntryMode::Blob, blob),
            tree_entry("f2", EntryMode::Blob, blob),
        ]);
        let root = write_tree(&store, &mut vec![tree_entry("dir", EntryMode::Tree, sub)]);

        let walker = Walker::new(&store, backend.as_ref(), None);
        let counts = walker
            .walk::<usize>(
                &[WalkSource::Tree(root)],
                &mut |_, entries| {
                    let is_file = entries[0].as_ref().is_some_and(|e| !e.is_tree());
                    Ok(Some(usize::from(is_file)))
                },
                &mut |own, children| Ok(own + children.iter().sum::<usize>()),
            )
            .unwrap();
        assert_eq!(counts, vec![2]);
    }

    #[test]
    fn worktree_source_hashes_files() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = store_on(&backend);
        backend
            .write(Path::new("wt/hello.txt"), b"Hello world!\n", WriteMode::Regular)
            .unwrap();

        let workdir = PathBuf::from("wt");
        let walker = Walker::new(&store, backend.as_ref(), Some(&workdir));
        let mut found = None;
        walker
            .walk::<()>(
                &[WalkSource::Worktree],
                &mut |path, entries| {
                    if path == "hello.txt" {
                        found = entries[0].as_ref().and_then(|e| e.oid);
                    }
                    Ok(None)
                },
                &mut |v, _| Ok(v),
            )
            .unwrap();
        assert_eq!(
            found.map(|o| o.to_string()).as_deref(),
            Some("af5626b4a114abcb82d63db7c8082c3c4756e51b")
        );
    }

    #[test]
    fn flatten_tree_lists_nested_paths() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = store_on(&backend);
        let blob = write_blob(&store, b"x");
        let sub = write_tree(&store, &mut vec![tree_entry("deep.txt", EntryMode::Blob, blob)]);
        let root = write_tree(&store, &mut vec![
            tree_entry("top.txt", EntryMode::Blob, blob),
            tree_entry("dir", EntryMode::Tree, sub),
        ]);

        let flat = flatten_tree(&store, root).unwrap();
        let paths: Vec<&String> = flat.keys().collect();
        assert_eq!(paths, vec!["dir/deep.txt", "top.txt"]);
    }
}
