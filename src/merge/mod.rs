//! Deterministic three-way merge engine.
//!
//! Implements the diff → resolve → build pipeline over three trees (base,
//! ours, theirs): flatten each tree to path rows, apply the per-path
//! policy, run the [`blob`] text merge where both sides changed the same
//! file, stage conflicts in the index at stages 1/2/3, and build the merged
//! tree bottom-up when everything resolved.
//!
//! # Determinism guarantee
//!
//! The same three trees always produce the same result: paths are
//! processed in lexicographic order, blob identity drives resolution, and
//! the text merge is itself deterministic given the same inputs.

pub mod blob;

use std::collections::BTreeMap;

use keel_odb::{EntryMode, ObjectId, ObjectKind, ObjectStore};
use tracing::debug;

use crate::error::{ConflictKind, Error};
use crate::index::Index;
use crate::treebuild;
use crate::walk::flatten_tree;

/// A `(mode, oid)` slot; `None` means the path is absent on that side.
pub type Slot = Option<(EntryMode, ObjectId)>;

/// Conflict-marker labels.
#[derive(Clone, Debug)]
pub struct MergeLabels {
    /// Label after `<<<<<<<`.
    pub ours: String,
    /// Label after `>>>>>>>`.
    pub theirs: String,
    /// Label for the base side (kept for callers that render diff3-style
    /// reports).
    pub base: String,
}

impl Default for MergeLabels {
    fn default() -> Self {
        Self {
            ours: "ours".to_owned(),
            theirs: "theirs".to_owned(),
            base: "base".to_owned(),
        }
    }
}

/// Merge options.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Marker labels.
    pub labels: MergeLabels,
    /// Compute the conflict set and merged tree id without writing objects
    /// or touching the index.
    pub dry_run: bool,
}

/// One conflicted path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeConflict {
    /// The path.
    pub path: String,
    /// Base side.
    pub base: Slot,
    /// Our side.
    pub ours: Slot,
    /// Their side.
    pub theirs: Slot,
    /// Marker text for content conflicts (`None` for add/add,
    /// delete/modify, and mode conflicts).
    pub marker_text: Option<Vec<u8>>,
}

/// What a merge produced.
#[derive(Clone, Debug, Default)]
pub struct MergeOutcome {
    /// Root of the merged tree; present only when the merge is clean.
    pub tree: Option<ObjectId>,
    /// Conflicted paths in lexicographic order.
    pub conflicts: Vec<MergeConflict>,
    /// The merged path rows (clean paths only).
    pub rows: BTreeMap<String, (EntryMode, ObjectId)>,
}

impl MergeOutcome {
    /// `true` when no path conflicted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Lift into the error taxonomy for callers that treat conflicts as
    /// failure.
    ///
    /// # Errors
    /// A merge [`Error::Conflict`] listing the conflicted paths.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(Error::Conflict {
                kind: ConflictKind::Merge,
                paths: self.conflicts.iter().map(|c| c.path.clone()).collect(),
            })
        }
    }
}

/// Three-way merge of trees.
///
/// `base` is the common-ancestor tree (`None` for unrelated histories,
/// which behaves as the empty tree). The index receives stage-0 entries
/// for cleanly merged paths and stages 1/2/3 for conflicts — unless
/// `dry_run`, which leaves both the index and the object store untouched.
///
/// # Errors
/// Store failures propagate. Conflicts are data, not errors — see
/// [`MergeOutcome::into_result`].
pub fn merge_trees(
    store: &ObjectStore,
    base: Option<ObjectId>,
    ours: ObjectId,
    theirs: ObjectId,
    index: &mut Index,
    opts: &MergeOptions,
) -> Result<MergeOutcome, Error> {
    let base_rows = match base {
        Some(oid) => flatten_tree(store, oid)?,
        None => BTreeMap::new(),
    };
    let ours_rows = flatten_tree(store, ours)?;
    let theirs_rows = flatten_tree(store, theirs)?;

    let mut paths: Vec<&String> =
        base_rows.keys().chain(ours_rows.keys()).chain(theirs_rows.keys()).collect();
    paths.sort_unstable();
    paths.dedup();

    let mut outcome = MergeOutcome::default();
    for path in paths {
        let slots = (
            base_rows.get(path).copied(),
            ours_rows.get(path).copied(),
            theirs_rows.get(path).copied(),
        );
        match resolve_path(store, path, slots, opts)? {
            Resolution::Keep(None) => {}
            Resolution::Keep(Some(row)) => {
                outcome.rows.insert(path.clone(), row);
                if !opts.dry_run {
                    index.insert(crate::index::IndexEntry::new(path.clone(), row.0, row.1));
                }
            }
            Resolution::Conflicted(conflict) => {
                if !opts.dry_run {
                    index.set_conflict(path, conflict.base, conflict.ours, conflict.theirs);
                }
                outcome.conflicts.push(conflict);
            }
        }
    }

    if outcome.is_clean() {
        outcome.tree = Some(treebuild::write_tree(store, &outcome.rows, opts.dry_run)?);
    }
    debug!(
        paths = outcome.rows.len(),
        conflicts = outcome.conflicts.len(),
        "three-way tree merge resolved"
    );
    Ok(outcome)
}

enum Resolution {
    Keep(Slot),
    Conflicted(MergeConflict),
}

fn resolve_path(
    store: &ObjectStore,
    path: &str,
    (base, ours, theirs): (Slot, Slot, Slot),
    opts: &MergeOptions,
) -> Result<Resolution, Error> {
    // Same on both sides (same change, same addition, both deleted, or
    // untouched everywhere).
    if ours == theirs {
        return Ok(Resolution::Keep(ours));
    }
    // Only they changed.
    if base == ours {
        return Ok(Resolution::Keep(theirs));
    }
    // Only we changed.
    if base == theirs {
        return Ok(Resolution::Keep(ours));
    }

    // Both sides changed, differently.
    let conflict = |marker_text| {
        Resolution::Conflicted(MergeConflict {
            path: path.to_owned(),
            base,
            ours,
            theirs,
            marker_text,
        })
    };

    let (Some((ours_mode, ours_oid)), Some((theirs_mode, theirs_oid))) = (ours, theirs) else {
        // delete/modify or modify/delete (base present), or nothing to
        // reconcile content-wise.
        return Ok(conflict(None));
    };

    let content_mergeable = |mode: EntryMode| {
        matches!(mode, EntryMode::Blob | EntryMode::BlobExecutable)
    };
    if !content_mergeable(ours_mode) || !content_mergeable(theirs_mode) {
        // Symlinks and gitlinks have no line structure to merge.
        return Ok(conflict(None));
    }

    let base_bytes = match base {
        Some((_, oid)) => (*store.read(&oid)?.bytes).clone(),
        None => Vec::new(),
    };
    let ours_bytes = (*store.read(&ours_oid)?.bytes).clone();
    let theirs_bytes = (*store.read(&theirs_oid)?.bytes).clone();

    // A mode flip on one side rides along with the content result.
    let merged_mode = match base {
        Some((base_mode, _)) if ours_mode == base_mode => theirs_mode,
        _ => ours_mode,
    };

    match blob::merge_blobs(&base_bytes, &ours_bytes, &theirs_bytes, &opts.labels) {
        blob::BlobMerge::Clean(merged) => {
            let oid = store.write(ObjectKind::Blob, &merged, opts.dry_run)?;
            Ok(Resolution::Keep(Some((merged_mode, oid))))
        }
        blob::BlobMerge::Conflict(marker_text) => Ok(conflict(Some(marker_text))),
    }
}
