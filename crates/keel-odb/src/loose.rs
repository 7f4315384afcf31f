//! Loose object layout: `objects/<first-2-hex>/<remaining-hex>`.

use std::path::{Path, PathBuf};

use keel_fs::{Backend, WriteMode};

use crate::error::OdbError;
use crate::object::{self, ObjectKind};
use crate::oid::{HashKind, ObjectId};
use crate::zlib;

/// Path of a loose object relative to the objects directory.
#[must_use]
pub fn path_of(objects_dir: &Path, oid: &ObjectId) -> PathBuf {
    let hex = oid.to_hex();
    objects_dir.join(&hex[..2]).join(&hex[2..])
}

/// Read and unwrap a loose object. `Ok(None)` when no loose file exists.
///
/// # Errors
/// Fails with [`OdbError::Corrupt`] when the file exists but does not
/// inflate or unwrap cleanly.
pub fn read(
    backend: &dyn Backend,
    objects_dir: &Path,
    oid: &ObjectId,
) -> Result<Option<(ObjectKind, Vec<u8>)>, OdbError> {
    let path = path_of(objects_dir, oid);
    let Some(compressed) = backend.read(&path)? else {
        return Ok(None);
    };
    let wrapped = zlib::inflate(&compressed)
        .map_err(|_| OdbError::corrupt(path.display().to_string(), "invalid zlib stream"))?;
    let (kind, payload) = object::unwrap(&wrapped)?;
    Ok(Some((kind, payload.to_vec())))
}

/// `true` if a loose file for `oid` exists.
///
/// # Errors
/// Propagates backend failures.
pub fn contains(
    backend: &dyn Backend,
    objects_dir: &Path,
    oid: &ObjectId,
) -> Result<bool, OdbError> {
    Ok(backend.stat(&path_of(objects_dir, oid))?.is_some())
}

/// Persist an object loose. Writing an already-present object is a no-op
/// (content addressing makes duplicates indistinguishable).
///
/// # Errors
/// Propagates backend failures.
pub fn write(
    backend: &dyn Backend,
    objects_dir: &Path,
    hash: HashKind,
    kind: ObjectKind,
    payload: &[u8],
) -> Result<ObjectId, OdbError> {
    let oid = object::oid_of(hash, kind, payload);
    let path = path_of(objects_dir, &oid);
    if backend.stat(&path)?.is_none() {
        let compressed = zlib::deflate(&object::wrap(kind, payload));
        backend.write_atomic(&path, &compressed, WriteMode::Regular)?;
    }
    Ok(oid)
}

/// Enumerate every loose object id under the objects directory.
///
/// Fanout directories are the two-hex-digit ones; anything else under
/// `objects/` (`pack/`, `info/`) is skipped.
///
/// # Errors
/// Propagates backend failures; malformed file names are skipped.
pub fn iter(
    backend: &dyn Backend,
    objects_dir: &Path,
    hash: HashKind,
) -> Result<Vec<ObjectId>, OdbError> {
    let mut out = Vec::new();
    for fanout in backend.list(objects_dir)? {
        if fanout.len() != 2 || !fanout.bytes().all(|b| crate::hex::digit(b).is_some()) {
            continue;
        }
        for rest in backend.list(&objects_dir.join(&fanout))? {
            let hex = format!("{fanout}{rest}");
            if hex.len() == hash.hex_len()
                && let Ok(oid) = hex.parse::<ObjectId>()
            {
                out.push(oid);
            }
        }
    }
    Ok(out)
}
