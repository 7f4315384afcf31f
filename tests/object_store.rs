//! Object store scenarios: loose round-trips, pack ingestion, multi-pack
//! index, and lookup precedence.

use std::path::PathBuf;
use std::sync::Arc;

use keel_fs::{Backend, MemoryBackend};
use keel_odb::{HashKind, ObjectKind, ObjectStore, Source, pack_writer};

fn store() -> (Arc<dyn Backend>, ObjectStore) {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    let store =
        ObjectStore::new(Arc::clone(&backend), PathBuf::from(".git/objects"), HashKind::Sha1);
    (backend, store)
}

#[test]
fn loose_blob_roundtrip_has_the_known_oid() {
    let (_backend, store) = store();
    let oid = store.write(ObjectKind::Blob, b"Hello world!\n", false).unwrap();
    assert_eq!(oid.to_string(), "af5626b4a114abcb82d63db7c8082c3c4756e51b");

    let data = store.read(&oid).unwrap();
    assert_eq!(data.kind, ObjectKind::Blob);
    assert_eq!(&*data.bytes, b"Hello world!\n");
    assert_eq!(data.source, Source::Loose);
}

#[test]
fn empty_tree_is_recognized_without_disk_backing() {
    let (_backend, store) = store();
    let empty = HashKind::Sha1.empty_tree();
    assert_eq!(empty.to_string(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");

    // Never written, still readable.
    let data = store.read(&empty).unwrap();
    assert_eq!(data.kind, ObjectKind::Tree);
    assert!(data.bytes.is_empty());

    // Writing it produces the same id.
    let written = store.write(ObjectKind::Tree, b"", true).unwrap();
    assert_eq!(written, empty);
}

#[test]
fn write_is_idempotent_and_dry_run_computes_the_id() {
    let (_backend, store) = store();
    let dry = store.write(ObjectKind::Blob, b"payload", true).unwrap();
    assert!(matches!(store.read(&dry), Err(keel_odb::OdbError::NotFound { .. })));

    let wet = store.write(ObjectKind::Blob, b"payload", false).unwrap();
    assert_eq!(dry, wet);
    // A second write is a no-op.
    assert_eq!(store.write(ObjectKind::Blob, b"payload", false).unwrap(), wet);
}

#[test]
fn ingested_pack_serves_reads_and_wins_over_nothing() {
    let (_backend, store) = store();
    let objects = vec![
        (ObjectKind::Blob, b"from a pack".to_vec()),
        (ObjectKind::Blob, b"also packed".to_vec()),
    ];
    let (pack, _) = pack_writer::write_pack(HashKind::Sha1, &objects);
    let (pack_name, count) = store.ingest_pack(pack).unwrap();
    assert_eq!(count, 2);
    assert!(pack_name.starts_with("pack-"));

    let expected = keel_odb::object::oid_of(HashKind::Sha1, ObjectKind::Blob, b"from a pack");
    let data = store.read(&expected).unwrap();
    assert_eq!(&*data.bytes, b"from a pack");
    assert_eq!(data.source, Source::Pack(pack_name));
}

#[test]
fn multi_pack_index_is_consulted_first() {
    let (_backend, store) = store();
    let (pack, _) = pack_writer::write_pack(
        HashKind::Sha1,
        &[(ObjectKind::Blob, b"midx me".to_vec())],
    );
    store.ingest_pack(pack).unwrap();
    let indexed = store.write_midx().unwrap();
    assert_eq!(indexed, 1);
    store.refresh();

    let oid = keel_odb::object::oid_of(HashKind::Sha1, ObjectKind::Blob, b"midx me");
    let data = store.read(&oid).unwrap();
    assert_eq!(data.source, Source::Midx);
}

#[test]
fn iter_objects_covers_loose_and_packed() {
    let (_backend, store) = store();
    let loose = store.write(ObjectKind::Blob, b"loose one", false).unwrap();
    let (pack, _) =
        pack_writer::write_pack(HashKind::Sha1, &[(ObjectKind::Blob, b"packed one".to_vec())]);
    store.ingest_pack(pack).unwrap();

    let listed = store.iter_objects().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|(oid, source)| *oid == loose && *source == Source::Loose));
    assert!(listed.iter().any(|(_, source)| matches!(source, Source::Pack(_))));
}

#[test]
fn reads_are_deterministic() {
    let (_backend, store) = store();
    let oid = store.write(ObjectKind::Blob, b"stable", false).unwrap();
    let first = store.read(&oid).unwrap();
    let second = store.read(&oid).unwrap();
    assert_eq!(first.kind, second.kind);
    assert_eq!(first.bytes, second.bytes);
}

#[test]
fn prefix_search_resolves_and_rejects_ambiguity() {
    let (_backend, store) = store();
    let oid = store.write(ObjectKind::Blob, b"findable", false).unwrap();
    let hex = oid.to_string();
    assert_eq!(store.find_prefix(&hex[..8]).unwrap(), Some(oid));
    assert_eq!(store.find_prefix("ffffffff").unwrap(), None);
}
