//! The ref store: loose refs, `packed-refs`, symbolic refs, and the reflog.
//!
//! # Read precedence
//!
//! A loose ref file always wins over a `packed-refs` row of the same name;
//! the packed row is only transitional state left behind by `pack()`.
//!
//! # Concurrency
//!
//! Updates are compare-and-swap: the new value is staged in a
//! `<name>.lock` sentinel created exclusively, the current value is
//! re-read under the lock, the reflog is appended, and an atomic rename
//! commits. A lost race surfaces as a lock [`Error::Conflict`] for the
//! caller to retry. Transient I/O is retried internally (3 attempts with
//! backoff) before giving up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keel_fs::{Backend, FileKind, FsError, WriteMode};
use keel_odb::{Envelope, HashKind, ObjectId};
use tracing::{debug, warn};

use crate::error::{ConflictKind, Error};

/// Bound on symbolic ref chains before [`Error::Corrupt`] is raised.
pub const MAX_SYMREF_DEPTH: usize = 5;

/// Well-known bare ref names that live directly in the gitdir.
const BARE_REFS: &[&str] = &["HEAD", "FETCH_HEAD", "MERGE_HEAD", "ORIG_HEAD", "CHERRY_PICK_HEAD"];

/// The value a ref file holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// A direct object id.
    Direct(ObjectId),
    /// A symbolic pointer to another ref.
    Symbolic(String),
}

/// One reflog journal line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflogEntry {
    /// Value before the update (zero for creation).
    pub old: ObjectId,
    /// Value after the update (zero for deletion).
    pub new: ObjectId,
    /// Who performed it.
    pub who: Envelope,
    /// Free-form message.
    pub message: String,
}

/// Validate a ref name against the published rules.
///
/// `one_level` additionally admits the well-known bare names (`HEAD`, …).
///
/// # Errors
/// [`Error::InvalidParameter`] naming the violated rule.
pub fn validate_ref_name(name: &str, one_level: bool) -> Result<(), Error> {
    let reject = |reason: &str| {
        Err(Error::InvalidParameter {
            name: "ref_name",
            reason: format!("{reason}: {name:?}"),
        })
    };
    if name.is_empty() {
        return reject("empty name");
    }
    if one_level && BARE_REFS.contains(&name) {
        return Ok(());
    }
    if !name.contains('/') {
        return reject("single-level name");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return reject("bad slash placement");
    }
    if name.contains("..") {
        return reject("'..' component");
    }
    if name.split('/').any(|c| c.ends_with(".lock")) {
        return reject("'.lock' suffix");
    }
    if name.split('/').any(|c| c.starts_with('.') || c.ends_with('.')) {
        return reject("dot-delimited component");
    }
    if name.contains("@{") {
        return reject("'@{' sequence");
    }
    for byte in name.bytes() {
        if byte < 0x20 || byte == 0x7f {
            return reject("control character");
        }
        if matches!(byte, b' ' | b':' | b'?' | b'[' | b'\\' | b'^' | b'~' | b'*') {
            return reject("forbidden character");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RefStore
// ---------------------------------------------------------------------------

/// The ref database of one repository.
pub struct RefStore {
    backend: Arc<dyn Backend>,
    gitdir: PathBuf,
    hash: HashKind,
    committer: Envelope,
}

impl std::fmt::Debug for RefStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefStore").field("gitdir", &self.gitdir).finish_non_exhaustive()
    }
}

impl RefStore {
    /// Open the ref store of `gitdir`. `committer` stamps reflog entries.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        gitdir: PathBuf,
        hash: HashKind,
        committer: Envelope,
    ) -> Self {
        Self { backend, gitdir, hash, committer }
    }

    /// Replace the identity used for reflog entries.
    pub fn set_committer(&mut self, committer: Envelope) {
        self.committer = committer;
    }

    /// The backend handle (shared with the rest of the repository).
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.gitdir.join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.gitdir.join(format!("{name}.lock"))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.gitdir.join("logs").join(name)
    }

    fn packed_path(&self) -> PathBuf {
        self.gitdir.join("packed-refs")
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read a ref's stored value without following symbolic pointers.
    ///
    /// # Errors
    /// [`Error::Corrupt`] for an unreadable value.
    pub fn read(&self, name: &str) -> Result<Option<RefValue>, Error> {
        if let Some(bytes) = with_retry(|| self.backend.read(&self.ref_path(name)))? {
            return Ok(Some(parse_ref_value(name, &bytes)?));
        }
        Ok(self.packed_lookup(name)?.map(RefValue::Direct))
    }

    /// Resolve a name to an object id, following symbolic refs.
    ///
    /// # Errors
    /// [`Error::Corrupt`] when the chain exceeds [`MAX_SYMREF_DEPTH`].
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>, Error> {
        self.resolve_depth(name, MAX_SYMREF_DEPTH)
    }

    /// As [`resolve`](Self::resolve) with an explicit depth budget.
    ///
    /// # Errors
    /// As [`resolve`](Self::resolve).
    pub fn resolve_depth(&self, name: &str, depth: usize) -> Result<Option<ObjectId>, Error> {
        let mut current = name.to_owned();
        for _ in 0..=depth {
            match self.read(&current)? {
                None => return Ok(None),
                Some(RefValue::Direct(oid)) => return Ok(Some(oid)),
                Some(RefValue::Symbolic(target)) => current = target,
            }
        }
        Err(Error::Corrupt {
            at: name.to_owned(),
            detail: format!("symbolic ref chain exceeds depth {depth}"),
        })
    }

    /// The symbolic target of a ref, or `None` for direct/absent refs.
    ///
    /// # Errors
    /// [`Error::Corrupt`] for an unreadable value.
    pub fn read_symbolic(&self, name: &str) -> Result<Option<String>, Error> {
        match self.read(name)? {
            Some(RefValue::Symbolic(target)) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// List `(name, oid)` for every ref under `prefix`, sorted by name.
    /// Symbolic refs are resolved; dangling ones are skipped.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>, Error> {
        let mut names: Vec<String> = Vec::new();
        self.collect_loose(Path::new("refs"), &mut names)?;
        for (name, _, _) in self.packed_rows()? {
            names.push(name);
        }
        names.sort_unstable();
        names.dedup();

        let mut out = Vec::new();
        for name in names {
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(oid) = self.resolve(&name)? {
                out.push((name, oid));
            }
        }
        Ok(out)
    }

    fn collect_loose(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), Error> {
        for entry in self.backend.list(&self.gitdir.join(dir))? {
            let rel = dir.join(&entry);
            let stat = self.backend.stat(&self.gitdir.join(&rel))?;
            match stat.map(|s| s.kind) {
                Some(FileKind::Directory) => self.collect_loose(&rel, out)?,
                Some(_) => {
                    if !entry.ends_with(".lock") {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Create or update a ref.
    ///
    /// When `expected_old` is given the update is compare-and-swap: the
    /// zero id asserts the ref must not exist yet, any other value must
    /// match the current resolution exactly.
    ///
    /// # Errors
    /// - Lock [`Error::Conflict`] when the CAS loses or the sentinel
    ///   already exists.
    /// - [`Error::InvalidParameter`] for a bad name.
    pub fn write(
        &self,
        name: &str,
        new: ObjectId,
        expected_old: Option<ObjectId>,
        log_message: &str,
    ) -> Result<(), Error> {
        validate_ref_name(name, true)?;
        let mut content = new.to_hex();
        content.push('\n');
        self.commit_update(name, expected_old, content.as_bytes(), Some(new), log_message)
    }

    /// Point a ref at another ref (`HEAD` → `refs/heads/main`).
    ///
    /// The target does not need to exist yet (a fresh repository's `HEAD`
    /// names an unborn branch).
    ///
    /// # Errors
    /// As [`write`](Self::write).
    pub fn write_symbolic(
        &self,
        name: &str,
        target: &str,
        expected_old: Option<ObjectId>,
        log_message: &str,
    ) -> Result<(), Error> {
        validate_ref_name(name, true)?;
        validate_ref_name(target, true)?;
        let content = format!("ref: {target}\n");
        let new = self.resolve(target)?;
        self.commit_update(name, expected_old, content.as_bytes(), new, log_message)
    }

    fn commit_update(
        &self,
        name: &str,
        expected_old: Option<ObjectId>,
        content: &[u8],
        new_for_log: Option<ObjectId>,
        log_message: &str,
    ) -> Result<(), Error> {
        let lock = self.lock_path(name);
        match self.backend.create_new(&lock, content) {
            Ok(()) => {}
            Err(FsError::AlreadyExists { .. }) => {
                return Err(Error::Conflict {
                    kind: ConflictKind::Lock,
                    paths: vec![name.to_owned()],
                });
            }
            Err(e) => return Err(e.into()),
        }

        // Everything below holds the lock; any failure must release it.
        let result = (|| {
            let current = self.resolve_depth(name, MAX_SYMREF_DEPTH)?;
            if let Some(expected) = expected_old {
                let matches = if expected.is_zero() {
                    current.is_none()
                } else {
                    current == Some(expected)
                };
                if !matches {
                    return Err(Error::Conflict {
                        kind: ConflictKind::Lock,
                        paths: vec![name.to_owned()],
                    });
                }
            }

            if self.reflog_enabled(name) {
                let entry = ReflogEntry {
                    old: current.unwrap_or_else(|| self.hash.zero()),
                    new: new_for_log.unwrap_or_else(|| self.hash.zero()),
                    who: self.committer.clone(),
                    message: log_message.to_owned(),
                };
                // The journal is durable before the rename commits.
                with_retry(|| {
                    self.backend.append(&self.log_path(name), format_reflog_line(&entry).as_bytes())
                })?;
            }

            with_retry(|| self.backend.rename(&lock, &self.ref_path(name)))?;
            debug!(ref_name = name, "ref updated");
            Ok(())
        })();

        if result.is_err() {
            let _ = self.backend.remove(&lock);
        }
        result
    }

    /// Delete a ref (loose and packed). Deleting a missing ref is a no-op.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let old = self.resolve_depth(name, MAX_SYMREF_DEPTH).unwrap_or(None);

        match self.backend.remove(&self.ref_path(name)) {
            Ok(()) | Err(FsError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let rows = self.packed_rows()?;
        if rows.iter().any(|(n, _, _)| n == name) {
            let remaining: Vec<_> = rows.into_iter().filter(|(n, _, _)| n != name).collect();
            self.write_packed(&remaining)?;
        }

        // Final reflog entry then journal removal, both best-effort.
        if self.reflog_enabled(name)
            && let Some(old) = old
        {
            let entry = ReflogEntry {
                old,
                new: self.hash.zero(),
                who: self.committer.clone(),
                message: "delete".to_owned(),
            };
            if let Err(e) =
                self.backend.append(&self.log_path(name), format_reflog_line(&entry).as_bytes())
            {
                warn!(ref_name = name, error = %e, "could not journal ref deletion");
            }
        }
        match self.backend.remove(&self.log_path(name)) {
            Ok(()) | Err(FsError::NotFound { .. }) => {}
            Err(e) => warn!(ref_name = name, error = %e, "could not remove reflog"),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // packed-refs
    // -----------------------------------------------------------------------

    fn packed_lookup(&self, name: &str) -> Result<Option<ObjectId>, Error> {
        Ok(self
            .packed_rows()?
            .into_iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, oid, _)| oid))
    }

    fn packed_rows(&self) -> Result<Vec<(String, ObjectId, Option<ObjectId>)>, Error> {
        let Some(bytes) = with_retry(|| self.backend.read(&self.packed_path()))? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut rows: Vec<(String, ObjectId, Option<ObjectId>)> = Vec::new();
        for line in text.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            if let Some(peeled_hex) = line.strip_prefix('^') {
                let peeled = peeled_hex.parse().map_err(|_| Error::Corrupt {
                    at: "packed-refs".to_owned(),
                    detail: format!("bad peeled line {line:?}"),
                })?;
                if let Some(last) = rows.last_mut() {
                    last.2 = Some(peeled);
                }
                continue;
            }
            let (oid_hex, name) = line.split_once(' ').ok_or_else(|| Error::Corrupt {
                at: "packed-refs".to_owned(),
                detail: format!("bad row {line:?}"),
            })?;
            let oid = oid_hex.parse().map_err(|_| Error::Corrupt {
                at: "packed-refs".to_owned(),
                detail: format!("bad oid in row {line:?}"),
            })?;
            rows.push((name.to_owned(), oid, None));
        }
        Ok(rows)
    }

    fn write_packed(&self, rows: &[(String, ObjectId, Option<ObjectId>)]) -> Result<(), Error> {
        let mut text = String::from("# pack-refs with: peeled fully-peeled sorted \n");
        let mut sorted: Vec<_> = rows.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, oid, peeled) in &sorted {
            text.push_str(&format!("{oid} {name}\n"));
            if let Some(peeled) = peeled {
                text.push_str(&format!("^{peeled}\n"));
            }
        }
        with_retry(|| {
            self.backend.write_atomic(&self.packed_path(), text.as_bytes(), WriteMode::Regular)
        })?;
        Ok(())
    }

    /// Move every loose direct ref under `refs/` into `packed-refs` and
    /// remove the loose files. Symbolic refs stay loose.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn pack(&self) -> Result<usize, Error> {
        let mut names = Vec::new();
        self.collect_loose(Path::new("refs"), &mut names)?;

        let mut rows = self.packed_rows()?;
        let mut newly_packed = Vec::new();
        for name in names {
            let Some(RefValue::Direct(oid)) = self.read(&name)? else {
                continue;
            };
            rows.retain(|(n, _, _)| *n != name);
            rows.push((name.clone(), oid, None));
            newly_packed.push(name);
        }
        self.write_packed(&rows)?;

        // Loose files go last: a crash mid-way leaves both copies, which the
        // read precedence tolerates.
        for name in &newly_packed {
            match self.backend.remove(&self.ref_path(name)) {
                Ok(()) | Err(FsError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(count = newly_packed.len(), "packed loose refs");
        Ok(newly_packed.len())
    }

    /// Extract one ref out of `packed-refs` into a loose file.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the ref is not packed.
    pub fn unpack(&self, name: &str) -> Result<(), Error> {
        let rows = self.packed_rows()?;
        let Some((_, oid, _)) = rows.iter().find(|(n, _, _)| n == name) else {
            return Err(Error::NotFound { what: format!("packed ref {name}") });
        };
        let mut content = oid.to_hex();
        content.push('\n');
        with_retry(|| {
            self.backend.write_atomic(&self.ref_path(name), content.as_bytes(), WriteMode::Regular)
        })?;
        let remaining: Vec<_> = rows.into_iter().filter(|(n, _, _)| n != name).collect();
        self.write_packed(&remaining)
    }

    // -----------------------------------------------------------------------
    // Reflog
    // -----------------------------------------------------------------------

    /// Reflog is kept for `HEAD`, branches, remote-tracking refs, and
    /// notes.
    fn reflog_enabled(&self, name: &str) -> bool {
        name == "HEAD"
            || name.starts_with("refs/heads/")
            || name.starts_with("refs/remotes/")
            || name.starts_with("refs/notes/")
    }

    /// Read the journal for a ref, oldest first. Missing journal means an
    /// empty history.
    ///
    /// # Errors
    /// [`Error::Corrupt`] for unparsable lines.
    pub fn reflog(&self, name: &str) -> Result<Vec<ReflogEntry>, Error> {
        let Some(bytes) = self.backend.read(&self.log_path(name))? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        text.lines().map(parse_reflog_line).collect()
    }
}

// ---------------------------------------------------------------------------
// File formats
// ---------------------------------------------------------------------------

fn parse_ref_value(name: &str, bytes: &[u8]) -> Result<RefValue, Error> {
    let text = std::str::from_utf8(bytes).map_err(|_| Error::Corrupt {
        at: name.to_owned(),
        detail: "non-UTF-8 ref value".to_owned(),
    })?;
    let text = text.trim_end_matches(['\n', '\r']);
    if let Some(target) = text.strip_prefix("ref: ") {
        return Ok(RefValue::Symbolic(target.trim().to_owned()));
    }
    text.parse().map(RefValue::Direct).map_err(|_| Error::Corrupt {
        at: name.to_owned(),
        detail: format!("unreadable ref value {text:?}"),
    })
}

fn format_reflog_line(entry: &ReflogEntry) -> String {
    format!("{} {} {}\t{}\n", entry.old, entry.new, entry.who, entry.message)
}

fn parse_reflog_line(line: &str) -> Result<ReflogEntry, Error> {
    let corrupt = || Error::Corrupt {
        at: "reflog".to_owned(),
        detail: format!("bad line {line:?}"),
    };
    let (prefix, message) = line.split_once('\t').unwrap_or((line, ""));
    let (old_hex, rest) = prefix.split_once(' ').ok_or_else(corrupt)?;
    let (new_hex, who) = rest.split_once(' ').ok_or_else(corrupt)?;
    Ok(ReflogEntry {
        old: old_hex.parse().map_err(|_| corrupt())?,
        new: new_hex.parse().map_err(|_| corrupt())?,
        who: who.parse().map_err(|_| corrupt())?,
        message: message.to_owned(),
    })
}

/// Retry transient I/O failures with bounded backoff.
fn with_retry<T>(mut op: impl FnMut() -> Result<T, FsError>) -> Result<T, FsError> {
    let mut attempt: u64 = 0;
    loop {
        match op() {
            Err(FsError::Io(e)) if attempt < 2 => {
                attempt += 1;
                debug!(attempt, error = %e, "transient ref I/O, retrying");
                std::thread::sleep(Duration::from_millis(10 * attempt));
            }
            other => return other,
        }
    }
}
