//! Revision resolution and commit-graph queries.
//!
//! `rev_parse` works through an explicit search list rather than
//! try/catch probing: the spelled name, then `refs/<x>`, `refs/heads/<x>`,
//! `refs/tags/<x>`, `refs/remotes/<x>`, `refs/remotes/<x>/HEAD`, then full
//! or abbreviated hex. Ancestry suffixes (`~n`, `^n`, `^{}`, `^{type}`)
//! apply on top.

use std::collections::{HashSet, VecDeque};

use keel_odb::{Commit, ObjectId, ObjectKind, ObjectStore, Tag};

use crate::error::Error;
use crate::refs::RefStore;

/// The ref-name candidates for a bare revision word, in probe order.
fn search_list(name: &str) -> Vec<String> {
    vec![
        name.to_owned(),
        format!("refs/{name}"),
        format!("refs/heads/{name}"),
        format!("refs/tags/{name}"),
        format!("refs/remotes/{name}"),
        format!("refs/remotes/{name}/HEAD"),
    ]
}

/// Resolve a revision expression to an object id.
///
/// # Errors
/// - [`Error::NotFound`] when nothing matches.
/// - [`Error::InvalidParameter`] for malformed expressions or ambiguous
///   hex prefixes.
pub fn rev_parse(refs: &RefStore, store: &ObjectStore, spec: &str) -> Result<ObjectId, Error> {
    if spec.is_empty() {
        return Err(Error::MissingParameter { name: "revision" });
    }
    let (base, suffix) = split_base(spec);
    let base = if base == "@" { "HEAD" } else { base };

    let mut oid = resolve_base(refs, store, base)
        .ok_or_else(|| Error::NotFound { what: format!("revision {spec:?}") })?;

    let mut rest = suffix;
    while !rest.is_empty() {
        let (next_oid, consumed) = apply_suffix(store, oid, rest)?;
        oid = next_oid;
        rest = &rest[consumed..];
    }
    Ok(oid)
}

fn split_base(spec: &str) -> (&str, &str) {
    match spec.find(['~', '^']) {
        Some(i) => (&spec[..i], &spec[i..]),
        None => (spec, ""),
    }
}

fn resolve_base(refs: &RefStore, store: &ObjectStore, base: &str) -> Option<ObjectId> {
    for candidate in search_list(base) {
        if let Ok(Some(oid)) = refs.resolve(&candidate) {
            return Some(oid);
        }
    }
    if base.len() == store.hash().hex_len()
        && let Ok(oid) = base.parse::<ObjectId>()
    {
        return Some(oid);
    }
    if base.len() >= 4 && base.bytes().all(|b| b.is_ascii_hexdigit()) {
        return store.find_prefix(base).ok().flatten();
    }
    None
}

fn apply_suffix(
    store: &ObjectStore,
    oid: ObjectId,
    rest: &str,
) -> Result<(ObjectId, usize), Error> {
    let bad = |reason: String| Error::InvalidParameter { name: "revision", reason };
    let bytes = rest.as_bytes();
    match bytes[0] {
        b'~' => {
            let (n, used) = leading_number(&rest[1..]);
            let steps = n.unwrap_or(1);
            let mut current = oid;
            for _ in 0..steps {
                current = first_parent(store, current)?
                    .ok_or_else(|| bad(format!("no first parent of {current}")))?;
            }
            Ok((current, 1 + used))
        }
        b'^' if rest[1..].starts_with("{}") => Ok((peel_tags(store, oid)?, 3)),
        b'^' if rest[1..].starts_with('{') => {
            let end = rest.find('}').ok_or_else(|| bad("unterminated '^{'".to_owned()))?;
            let type_name = &rest[2..end];
            let kind = ObjectKind::from_name(type_name.as_bytes())
                .ok_or_else(|| bad(format!("unknown object type {type_name:?}")))?;
            Ok((peel_to_kind(store, oid, kind)?, end + 1))
        }
        b'^' => {
            let (n, used) = leading_number(&rest[1..]);
            let parent_index = n.unwrap_or(1);
            if parent_index == 0 {
                return Ok((peel_to_kind(store, oid, ObjectKind::Commit)?, 1 + used));
            }
            let parents = parents_of(store, peel_to_kind(store, oid, ObjectKind::Commit)?)?;
            let chosen = parents
                .get(parent_index - 1)
                .ok_or_else(|| bad(format!("commit has no parent #{parent_index}")))?;
            Ok((*chosen, 1 + used))
        }
        other => Err(bad(format!("unexpected revision operator {:?}", other as char))),
    }
}

fn leading_number(s: &str) -> (Option<usize>, usize) {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        (None, 0)
    } else {
        (digits.parse().ok(), digits.len())
    }
}

/// Parent list of a commit (peeling annotated tags first).
///
/// # Errors
/// [`Error::InvalidParameter`] when the id does not peel to a commit.
pub fn parents_of(store: &ObjectStore, oid: ObjectId) -> Result<Vec<ObjectId>, Error> {
    let commit_oid = peel_to_kind(store, oid, ObjectKind::Commit)?;
    let data = store.read(&commit_oid)?;
    Ok(Commit::parse(&data.bytes)?.parents())
}

/// The tree a commit-ish resolves to.
///
/// # Errors
/// [`Error::InvalidParameter`] when the id peels to something without a
/// tree.
pub fn tree_of(store: &ObjectStore, oid: ObjectId) -> Result<ObjectId, Error> {
    let peeled = peel_tags(store, oid)?;
    let data = store.read(&peeled)?;
    match data.kind {
        ObjectKind::Tree => Ok(peeled),
        ObjectKind::Commit => Ok(Commit::parse(&data.bytes)?.tree()?),
        other => Err(Error::InvalidParameter {
            name: "revision",
            reason: format!("{peeled} is a {other}, which has no tree"),
        }),
    }
}

/// Follow annotated-tag targets until a non-tag object.
///
/// # Errors
/// Store failures propagate.
pub fn peel_tags(store: &ObjectStore, mut oid: ObjectId) -> Result<ObjectId, Error> {
    // Tag chains are short; the bound only guards corrupt self-references.
    for _ in 0..32 {
        let data = store.read(&oid)?;
        if data.kind != ObjectKind::Tag {
            return Ok(oid);
        }
        oid = Tag::parse(&data.bytes)?.target()?;
    }
    Err(Error::Corrupt {
        at: oid.to_string(),
        detail: "tag chain does not terminate".to_owned(),
    })
}

fn peel_to_kind(store: &ObjectStore, oid: ObjectId, kind: ObjectKind) -> Result<ObjectId, Error> {
    let peeled = peel_tags(store, oid)?;
    let data = store.read(&peeled)?;
    if data.kind == kind {
        return Ok(peeled);
    }
    if kind == ObjectKind::Tree && data.kind == ObjectKind::Commit {
        return Ok(Commit::parse(&data.bytes)?.tree()?);
    }
    Err(Error::InvalidParameter {
        name: "revision",
        reason: format!("{oid} does not peel to a {kind}"),
    })
}

fn first_parent(store: &ObjectStore, oid: ObjectId) -> Result<Option<ObjectId>, Error> {
    Ok(parents_of(store, oid)?.first().copied())
}

// ---------------------------------------------------------------------------
// Ancestry
// ---------------------------------------------------------------------------

/// `true` when `ancestor` is reachable from `descendant` via parent links.
///
/// # Errors
/// Store failures propagate.
pub fn is_ancestor(
    store: &ObjectStore,
    ancestor: ObjectId,
    descendant: ObjectId,
) -> Result<bool, Error> {
    if ancestor == descendant {
        return Ok(true);
    }
    let mut queue = VecDeque::from([descendant]);
    let mut seen = HashSet::new();
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        for parent in parents_of(store, current)? {
            if parent == ancestor {
                return Ok(true);
            }
            queue.push_back(parent);
        }
    }
    Ok(false)
}

/// A nearest common ancestor of two commits, or `None` for unrelated
/// histories. Breadth-first from both tips, so ties between equally near
/// ancestors resolve deterministically by visit order.
///
/// # Errors
/// Store failures propagate.
pub fn merge_base(
    store: &ObjectStore,
    a: ObjectId,
    b: ObjectId,
) -> Result<Option<ObjectId>, Error> {
    let mut ancestors_of_a = HashSet::new();
    let mut queue = VecDeque::from([a]);
    while let Some(current) = queue.pop_front() {
        if !ancestors_of_a.insert(current) {
            continue;
        }
        queue.extend(parents_of(store, current)?);
    }

    let mut queue = VecDeque::from([b]);
    let mut seen = HashSet::new();
    while let Some(current) = queue.pop_front() {
        if ancestors_of_a.contains(&current) {
            return Ok(Some(current));
        }
        if !seen.insert(current) {
            continue;
        }
        queue.extend(parents_of(store, current)?);
    }
    Ok(None)
}
