//! Three-way blob merge.
//!
//! The line-level merge itself comes from `diffy`; this module owns the
//! marker presentation: conflict blocks are rewritten to the configured
//! ours/theirs labels and the base section is dropped, producing the
//! classic `<<<<<<< / ======= / >>>>>>>` shape.

use crate::merge::MergeLabels;

/// Result of merging one file's content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobMerge {
    /// Merged cleanly.
    Clean(Vec<u8>),
    /// Conflicted; the bytes carry conflict markers.
    Conflict(Vec<u8>),
}

/// Merge `ours` and `theirs` against `base`.
#[must_use]
pub fn merge_blobs(base: &[u8], ours: &[u8], theirs: &[u8], labels: &MergeLabels) -> BlobMerge {
    match diffy::merge_bytes(base, ours, theirs) {
        Ok(clean) => BlobMerge::Clean(clean),
        Err(marked) => BlobMerge::Conflict(relabel(&marked, labels)),
    }
}

/// Rewrite marker lines to the configured labels and drop the base section
/// (`|||||||` … `=======`) that diff3-style output carries.
fn relabel(marked: &[u8], labels: &MergeLabels) -> Vec<u8> {
    let mut out = Vec::with_capacity(marked.len());
    let mut in_base_section = false;
    for line in split_inclusive_lines(marked) {
        if line.starts_with(b"<<<<<<<") {
            out.extend_from_slice(format!("<<<<<<< {}\n", labels.ours).as_bytes());
        } else if line.starts_with(b"|||||||") {
            in_base_section = true;
        } else if line.starts_with(b"=======")
            && line.iter().all(|&b| b == b'=' || b == b'\n' || b == b'\r')
        {
            in_base_section = false;
            out.extend_from_slice(b"=======\n");
        } else if line.starts_with(b">>>>>>>") {
            out.extend_from_slice(format!(">>>>>>> {}\n", labels.theirs).as_bytes());
        } else if !in_base_section {
            out.extend_from_slice(line);
        }
    }
    out
}

fn split_inclusive_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split_inclusive(|&b| b == b'\n')
}
