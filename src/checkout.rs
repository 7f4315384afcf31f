//! Worktree materialization.
//!
//! Places a target tree into the working directory: a conflict pre-check
//! against local modifications, atomic per-file placement (temp + rename)
//! preserving the executable bit and symlinks, removal of tracked files
//! that left the tree, and index entries for everything — including sparse
//! paths that were filtered out of the worktree itself. Untracked files
//! the target does not claim are never touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use keel_fs::{Backend, FileKind, WriteMode};
use keel_odb::object::oid_of;
use keel_odb::{EntryMode, ObjectId, ObjectKind, ObjectStore};
use tracing::debug;

use crate::error::{ConflictKind, Error};
use crate::index::{Index, IndexEntry};
use crate::walk::flatten_tree;

/// Checkout options.
#[derive(Clone, Debug, Default)]
pub struct CheckoutOptions {
    /// Restrict the checkout to these paths (exact or directory prefixes).
    /// Empty means the whole tree.
    pub filepaths: Vec<String>,
    /// Overwrite local modifications instead of failing.
    pub force: bool,
    /// Plan only: no worktree or index mutation.
    pub dry_run: bool,
    /// Sparse prefixes: entries outside them are recorded in the index but
    /// not materialized. `None` disables sparse filtering.
    pub sparse_prefixes: Option<Vec<String>>,
}

/// What a checkout did (or would do, under `dry_run`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckoutOutcome {
    /// Paths written or planned.
    pub updated: Vec<String>,
    /// Tracked paths removed or planned for removal.
    pub removed: Vec<String>,
}

fn path_selected(path: &str, filepaths: &[String]) -> bool {
    filepaths.is_empty()
        || filepaths
            .iter()
            .any(|f| path == f || path.starts_with(&format!("{f}/")))
}

fn path_sparse_included(path: &str, sparse: Option<&[String]>) -> bool {
    sparse.is_none_or(|prefixes| {
        prefixes
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{p}/")))
    })
}

/// Materialize `target_tree` into the worktree and index.
///
/// # Errors
/// - Checkout [`Error::Conflict`] listing every locally modified path the
///   checkout would overwrite (unless `force`).
/// - Store/backend failures propagate.
pub fn checkout_tree(
    store: &ObjectStore,
    backend: &dyn Backend,
    workdir: &Path,
    index: &mut Index,
    target_tree: ObjectId,
    opts: &CheckoutOptions,
) -> Result<CheckoutOutcome, Error> {
    let all_rows = flatten_tree(store, target_tree)?;
    let rows: BTreeMap<&String, &(EntryMode, ObjectId)> = all_rows
        .iter()
        .filter(|(path, _)| path_selected(path, &opts.filepaths))
        .collect();

    // Conflict pre-check: a path whose worktree content differs from the
    // index must not be silently clobbered or dropped.
    if !opts.force {
        let mut conflicts = Vec::new();
        for (path, &(_, target_oid)) in &rows {
            if worktree_blocks_update(store, backend, workdir, index, path, Some(*target_oid))? {
                conflicts.push((*path).clone());
            }
        }
        for entry in index.iter() {
            if entry.stage == 0
                && path_selected(&entry.path, &opts.filepaths)
                && !all_rows.contains_key(&entry.path)
                && worktree_blocks_update(store, backend, workdir, index, &entry.path, None)?
            {
                conflicts.push(entry.path.clone());
            }
        }
        if !conflicts.is_empty() {
            conflicts.sort_unstable();
            conflicts.dedup();
            return Err(Error::Conflict { kind: ConflictKind::Checkout, paths: conflicts });
        }
    }

    let mut outcome = CheckoutOutcome::default();

    // Tracked paths that leave the tree.
    let stale: Vec<String> = index
        .iter()
        .filter(|e| {
            e.stage == 0
                && path_selected(&e.path, &opts.filepaths)
                && !all_rows.contains_key(&e.path)
        })
        .map(|e| e.path.clone())
        .collect();

    for (path, value) in &rows {
        let path = (*path).clone();
        let (mode, oid) = **value;
        let materialize = path_sparse_included(&path, opts.sparse_prefixes.as_deref());
        if !opts.dry_run {
            if materialize {
                place_entry(store, backend, workdir, &path, mode, oid)?;
            }
            let mut entry = IndexEntry::new(path.clone(), mode, oid);
            if materialize
                && let Some(stat) = backend.stat(&workdir.join(&path))?
            {
                entry.stat = stat;
            }
            index.insert(entry);
        }
        outcome.updated.push(path);
    }

    for path in stale {
        if !opts.dry_run {
            match backend.remove(&workdir.join(&path)) {
                Ok(())
                | Err(keel_fs::FsError::NotFound { .. })
                | Err(keel_fs::FsError::NotADirectory { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            prune_empty_parents(backend, workdir, &path);
            index.remove(&path);
        }
        outcome.removed.push(path);
    }

    debug!(
        updated = outcome.updated.len(),
        removed = outcome.removed.len(),
        dry_run = opts.dry_run,
        "checkout materialized"
    );
    Ok(outcome)
}

/// `true` when the worktree file at `path` differs from the index AND from
/// the incoming target (`None` target = the path is being deleted).
fn worktree_blocks_update(
    store: &ObjectStore,
    backend: &dyn Backend,
    workdir: &Path,
    index: &Index,
    path: &str,
    target: Option<ObjectId>,
) -> Result<bool, Error> {
    let full = workdir.join(path);
    let Some(stat) = backend.stat(&full)? else {
        return Ok(false); // nothing on disk to lose
    };
    if stat.kind == FileKind::Directory {
        return Ok(false);
    }

    let disk_oid = hash_worktree_file(store, backend, &full, stat.kind)?;
    if target == Some(disk_oid) {
        return Ok(false); // already the incoming content
    }

    match index.get(path) {
        // Tracked: blocked iff locally modified relative to the index.
        Some(entry) => Ok(entry.oid != disk_oid),
        // Untracked file in the target's way: always precious.
        None => Ok(target.is_some()),
    }
}

fn hash_worktree_file(
    store: &ObjectStore,
    backend: &dyn Backend,
    full: &Path,
    kind: FileKind,
) -> Result<ObjectId, Error> {
    let bytes = if kind == FileKind::Symlink {
        backend.read_link(full)?.to_string_lossy().into_owned().into_bytes()
    } else {
        backend.read(full)?.unwrap_or_default()
    };
    Ok(oid_of(store.hash(), ObjectKind::Blob, &bytes))
}

fn place_entry(
    store: &ObjectStore,
    backend: &dyn Backend,
    workdir: &Path,
    path: &str,
    mode: EntryMode,
    oid: ObjectId,
) -> Result<(), Error> {
    let full = workdir.join(path);
    match mode {
        EntryMode::Blob | EntryMode::BlobExecutable => {
            let data = store.read(&oid)?;
            let write_mode = if mode == EntryMode::BlobExecutable {
                WriteMode::Executable
            } else {
                WriteMode::Regular
            };
            backend.write_atomic(&full, &data.bytes, write_mode)?;
        }
        EntryMode::Link => {
            let data = store.read(&oid)?;
            let target = PathBuf::from(String::from_utf8_lossy(&data.bytes).into_owned());
            // Replace whatever held the name before.
            match backend.remove(&full) {
                Ok(()) | Err(keel_fs::FsError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            backend.symlink(&target, &full)?;
        }
        EntryMode::Commit => {
            // Gitlink: record the mount point, never recurse into it.
            backend.create_dir_all(&full)?;
        }
        EntryMode::Tree => {}
    }
    Ok(())
}

fn prune_empty_parents(backend: &dyn Backend, workdir: &Path, path: &str) {
    let mut current = Path::new(path).parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() {
            break;
        }
        // Stops at the first non-empty directory.
        if backend.remove_dir(&workdir.join(dir)).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use keel_fs::MemoryBackend;
    use keel_odb::HashKind;

    use super::*;
    use crate::treebuild;

    struct Fixture {
        backend: Arc<dyn Backend>,
        store: ObjectStore,
        index: Index,
        workdir: PathBuf,
    }

    fn fixture() -> Fixture {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store =
            ObjectStore::new(Arc::clone(&backend), PathBuf::from(".git/objects"), HashKind::Sha1);
        Fixture {
            backend,
            store,
            index: Index::new(HashKind::Sha1),
            workdir: PathBuf::from("wt"),
        }
    }

    fn tree_of(fx: &Fixture, files: &[(&str, &str, EntryMode)]) -> ObjectId {
        let mut rows = BTreeMap::new();
        for (path, data, mode) in files {
            let oid = fx.store.write(ObjectKind::Blob, data.as_bytes(), false).unwrap();
            rows.insert((*path).to_owned(), (*mode, oid));
        }
        treebuild::write_tree(&fx.store, &rows, false).unwrap()
    }

    fn read_wt(fx: &Fixture, path: &str) -> Option<Vec<u8>> {
        fx.backend.read(&fx.workdir.join(path)).unwrap()
    }

    #[test]
    fn fresh_checkout_places_files_and_index() {
        let mut fx = fixture();
        let tree = tree_of(&fx, &[
            ("README.md", "# R\n", EntryMode::Blob),
            ("bin/run.sh", "#!/bin/sh\n", EntryMode::BlobExecutable),
        ]);
        let outcome = checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.updated.len(), 2);
        assert_eq!(read_wt(&fx, "README.md").as_deref(), Some(&b"# R\n"[..]));
        assert_eq!(fx.index.get("README.md").map(|e| e.mode), Some(EntryMode::Blob));
        assert_eq!(
            fx.index.get("bin/run.sh").map(|e| e.mode),
            Some(EntryMode::BlobExecutable)
        );
    }

    #[test]
    fn local_modification_blocks_checkout() {
        let mut fx = fixture();
        let v1 = tree_of(&fx, &[("f.txt", "v1\n", EntryMode::Blob)]);
        let v2 = tree_of(&fx, &[("f.txt", "v2\n", EntryMode::Blob)]);
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v1,
            &CheckoutOptions::default(),
        )
        .unwrap();

        // Hand-edit the file, then try to move to v2.
        fx.backend
            .write(&fx.workdir.join("f.txt"), b"local edit\n", WriteMode::Regular)
            .unwrap();
        let err = checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v2,
            &CheckoutOptions::default(),
        )
        .unwrap_err();
        match err {
            Error::Conflict { kind: ConflictKind::Checkout, paths } => {
                assert_eq!(paths, vec!["f.txt"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Force wins.
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v2,
            &CheckoutOptions { force: true, ..CheckoutOptions::default() },
        )
        .unwrap();
        assert_eq!(read_wt(&fx, "f.txt").as_deref(), Some(&b"v2\n"[..]));
    }

    #[test]
    fn untracked_file_in_the_way_conflicts_but_unrelated_untracked_survive() {
        let mut fx = fixture();
        fx.backend
            .write(&fx.workdir.join("notes.txt"), b"precious\n", WriteMode::Regular)
            .unwrap();
        fx.backend
            .write(&fx.workdir.join("claimed.txt"), b"mine\n", WriteMode::Regular)
            .unwrap();

        let tree = tree_of(&fx, &[("claimed.txt", "incoming\n", EntryMode::Blob)]);
        let err = checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        // The unclaimed untracked file survives a forced checkout.
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions { force: true, ..CheckoutOptions::default() },
        )
        .unwrap();
        assert_eq!(read_wt(&fx, "notes.txt").as_deref(), Some(&b"precious\n"[..]));
    }

    #[test]
    fn switching_trees_removes_stale_tracked_files() {
        let mut fx = fixture();
        let v1 = tree_of(&fx, &[
            ("keep.txt", "k\n", EntryMode::Blob),
            ("old/gone.txt", "g\n", EntryMode::Blob),
        ]);
        let v2 = tree_of(&fx, &[("keep.txt", "k\n", EntryMode::Blob)]);

        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v1,
            &CheckoutOptions::default(),
        )
        .unwrap();
        let outcome = checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v2,
            &CheckoutOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.removed, vec!["old/gone.txt"]);
        assert_eq!(read_wt(&fx, "old/gone.txt"), None);
        assert!(fx.index.get("old/gone.txt").is_none());
        assert_eq!(read_wt(&fx, "keep.txt").as_deref(), Some(&b"k\n"[..]));
    }

    #[test]
    fn filepath_checkout_touches_only_selected_paths() {
        let mut fx = fixture();
        let v1 = tree_of(&fx, &[
            ("a.txt", "a1\n", EntryMode::Blob),
            ("b.txt", "b1\n", EntryMode::Blob),
        ]);
        let v2 = tree_of(&fx, &[
            ("a.txt", "a2\n", EntryMode::Blob),
            ("b.txt", "b2\n", EntryMode::Blob),
        ]);
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v1,
            &CheckoutOptions::default(),
        )
        .unwrap();
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            v2,
            &CheckoutOptions { filepaths: vec!["a.txt".into()], ..CheckoutOptions::default() },
        )
        .unwrap();
        assert_eq!(read_wt(&fx, "a.txt").as_deref(), Some(&b"a2\n"[..]));
        assert_eq!(read_wt(&fx, "b.txt").as_deref(), Some(&b"b1\n"[..]));
    }

    #[test]
    fn sparse_paths_stay_in_index_but_off_disk() {
        let mut fx = fixture();
        let tree = tree_of(&fx, &[
            ("src/lib.rs", "lib\n", EntryMode::Blob),
            ("docs/manual.md", "m\n", EntryMode::Blob),
        ]);
        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions {
                sparse_prefixes: Some(vec!["src".into()]),
                ..CheckoutOptions::default()
            },
        )
        .unwrap();

        assert_eq!(read_wt(&fx, "src/lib.rs").as_deref(), Some(&b"lib\n"[..]));
        assert_eq!(read_wt(&fx, "docs/manual.md"), None);
        // Index still reflects the filtered-out path.
        assert!(fx.index.get("docs/manual.md").is_some());
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let mut fx = fixture();
        let tree = tree_of(&fx, &[("f.txt", "x\n", EntryMode::Blob)]);
        let outcome = checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions { dry_run: true, ..CheckoutOptions::default() },
        )
        .unwrap();
        assert_eq!(outcome.updated, vec!["f.txt"]);
        assert_eq!(read_wt(&fx, "f.txt"), None);
        assert!(fx.index.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_placed_via_the_symlink_primitive() {
        let mut fx = fixture();
        let target_oid = fx.store.write(ObjectKind::Blob, b"README.md", false).unwrap();
        let mut rows = BTreeMap::new();
        rows.insert("link".to_owned(), (EntryMode::Link, target_oid));
        let tree = treebuild::write_tree(&fx.store, &rows, false).unwrap();

        checkout_tree(
            &fx.store,
            fx.backend.as_ref(),
            &fx.workdir,
            &mut fx.index,
            tree,
            &CheckoutOptions::default(),
        )
        .unwrap();
        assert_eq!(
            fx.backend.read_link(&fx.workdir.join("link")).unwrap(),
            PathBuf::from("README.md")
        );
    }
}
