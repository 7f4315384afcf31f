//! Building tree objects from flat path maps.
//!
//! The inverse of [`crate::walk::flatten_tree`]: take `path → (mode, oid)`
//! rows and write the nested tree objects bottom-up, returning the root
//! tree id. Used by commit (tree-from-index) and by the merge engine's
//! build step.

use std::collections::BTreeMap;

use keel_odb::{EntryMode, ObjectId, ObjectKind, ObjectStore, tree};

use crate::error::Error;

/// Write the tree hierarchy for `rows` and return the root tree id.
///
/// An empty map produces the well-known empty tree.
///
/// # Errors
/// Store failures propagate; a path that is both a file and a directory
/// (`"a"` and `"a/b"`) is an [`Error::InvalidParameter`].
pub fn write_tree(
    store: &ObjectStore,
    rows: &BTreeMap<String, (EntryMode, ObjectId)>,
    dry_run: bool,
) -> Result<ObjectId, Error> {
    let mut files = Vec::new();
    let mut dirs: BTreeMap<&str, BTreeMap<String, (EntryMode, ObjectId)>> = BTreeMap::new();

    for (path, &(mode, oid)) in rows {
        match path.split_once('/') {
            None => files.push((path.as_str(), mode, oid)),
            Some((dir, rest)) => {
                dirs.entry(dir)
                    .or_default()
                    .insert(rest.to_owned(), (mode, oid));
            }
        }
    }

    let mut entries = Vec::with_capacity(files.len() + dirs.len());
    for (name, mode, oid) in files {
        if dirs.contains_key(name) {
            return Err(Error::InvalidParameter {
                name: "path",
                reason: format!("{name:?} is both a file and a directory"),
            });
        }
        entries.push(tree::TreeEntry { mode, name: name.as_bytes().to_vec(), oid });
    }
    for (name, children) in &dirs {
        let sub = write_tree(store, children, dry_run)?;
        entries.push(tree::TreeEntry {
            mode: EntryMode::Tree,
            name: name.as_bytes().to_vec(),
            oid: sub,
        });
    }

    tree::sort_entries(&mut entries);
    Ok(store.write(ObjectKind::Tree, &tree::serialize(&entries), dry_run)?)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use keel_fs::{Backend, MemoryBackend};
    use keel_odb::HashKind;

    use super::*;
    use crate::walk::flatten_tree;

    fn store() -> ObjectStore {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        ObjectStore::new(backend, PathBuf::from("objects"), HashKind::Sha1)
    }

    fn oid_of_blob(store: &ObjectStore, data: &[u8]) -> ObjectId {
        store.write(ObjectKind::Blob, data, false).unwrap()
    }

    #[test]
    fn empty_map_is_the_empty_tree() {
        let store = store();
        let root = write_tree(&store, &BTreeMap::new(), false).unwrap();
        assert_eq!(root, HashKind::Sha1.empty_tree());
    }

    #[test]
    fn roundtrips_through_flatten() {
        let store = store();
        let a = oid_of_blob(&store, b"a");
        let b = oid_of_blob(&store, b"b");
        let mut rows = BTreeMap::new();
        rows.insert("top.txt".to_owned(), (EntryMode::Blob, a));
        rows.insert("dir/nested/deep.sh".to_owned(), (EntryMode::BlobExecutable, b));

        let root = write_tree(&store, &rows, false).unwrap();
        assert_eq!(flatten_tree(&store, root).unwrap(), rows);
    }

    #[test]
    fn dry_run_writes_nothing_but_computes_the_same_id() {
        let store = store();
        let a = oid_of_blob(&store, b"a");
        let mut rows = BTreeMap::new();
        rows.insert("f".to_owned(), (EntryMode::Blob, a));

        let dry = write_tree(&store, &rows, true).unwrap();
        assert!(matches!(
            store.read(&dry),
            Err(keel_odb::OdbError::NotFound { .. })
        ));
        let wet = write_tree(&store, &rows, false).unwrap();
        assert_eq!(dry, wet);
    }

    #[test]
    fn file_directory_collision_is_rejected() {
        let store = store();
        let a = oid_of_blob(&store, b"a");
        let mut rows = BTreeMap::new();
        rows.insert("a".to_owned(), (EntryMode::Blob, a));
        rows.insert("a/b".to_owned(), (EntryMode::Blob, a));
        assert!(write_tree(&store, &rows, true).is_err());
    }
}
