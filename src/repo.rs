//! The repository facade.
//!
//! A [`Repository`] binds one gitdir (and optional worktree) to the object
//! store, ref store, staging index, config snapshot, and event bus, and
//! exposes the composed operations everything above this crate calls:
//! init/open, commit, tag, branch, checkout, merge, reset, status, diff,
//! fetch, and push.
//!
//! # Locking
//!
//! Repository-wide mutations (index saves, HEAD moves, merges) serialize
//! on logical per-resource mutexes keyed by `(gitdir, resource)`. These do
//! not replace the ref store's on-disk CAS locks — they only keep this
//! process's own threads from interleaving multi-step operations.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use keel_fs::{Backend, WriteMode};
use keel_odb::{
    Commit, Envelope, HashKind, ObjectId, ObjectKind, ObjectStore, Tag, tree,
};
use keel_wire::fetch::{Deadline, FetchOptions};
use keel_wire::Advertisement;
use keel_wire::push::{PushCommand, ReportStatus};
use tracing::{debug, instrument};

use crate::checkout::{CheckoutOptions, CheckoutOutcome, checkout_tree};
use crate::config::{Config, ConfigSnapshot};
use crate::error::{Error, ResultExt as _};
use crate::events::{Event, EventBus, Resource};
use crate::index::{Index, IndexEntry};
use crate::merge::{MergeOptions, MergeOutcome, merge_trees};
use crate::refs::RefStore;
use crate::revision;
use crate::treebuild;
use crate::walk::{Walker, flatten_tree};

/// Options for [`Repository::init`].
#[derive(Clone, Debug)]
pub struct InitOptions {
    /// Create without a worktree.
    pub bare: bool,
    /// Hash function, fixed for the repository's lifetime.
    pub object_format: HashKind,
    /// Initial branch name; `None` consults `init.defaultbranch`, falling
    /// back to `main`.
    pub default_branch: Option<String>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self { bare: false, object_format: HashKind::Sha1, default_branch: None }
    }
}

/// Options for [`Repository::commit`].
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    /// Author identity; `None` uses the repository identity.
    pub author: Option<Envelope>,
    /// Committer identity; `None` uses the repository identity.
    pub committer: Option<Envelope>,
    /// Allow a commit whose tree equals its parent's.
    pub allow_empty: bool,
}

/// `reset` flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// Move HEAD only.
    Soft,
    /// Move HEAD and reload the index from the target.
    Mixed,
    /// Move HEAD, index, and worktree.
    Hard,
}

/// Per-path status row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    /// The path.
    pub path: String,
    /// Index vs HEAD (`None` = unchanged).
    pub staged: Option<ChangeKind>,
    /// Worktree vs index (`None` = unchanged).
    pub unstaged: Option<ChangeKind>,
}

/// The kind of change between two sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present on the new side only.
    Added,
    /// Content or mode differs.
    Modified,
    /// Present on the old side only.
    Deleted,
}

/// One row of a tree-to-tree diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    /// The path.
    pub path: String,
    /// What happened.
    pub change: ChangeKind,
    /// `(mode, oid)` on the old side.
    pub old: crate::merge::Slot,
    /// `(mode, oid)` on the new side.
    pub new: crate::merge::Slot,
}

/// What a fetch applied locally.
#[derive(Clone, Debug, Default)]
pub struct FetchResult {
    /// Installed pack name, when the server sent objects.
    pub pack_name: Option<String>,
    /// Remote-tracking refs updated, as `(name, oid)`.
    pub updated_refs: Vec<(String, ObjectId)>,
    /// Shallow tips recorded in `<gitdir>/shallow`.
    pub shallow: Vec<ObjectId>,
}

/// An open repository.
pub struct Repository {
    backend: Arc<dyn Backend>,
    gitdir: PathBuf,
    workdir: Option<PathBuf>,
    config: Config,
    snapshot: ConfigSnapshot,
    store: ObjectStore,
    refs: RefStore,
    events: EventBus,
    identity: Envelope,
    resource_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("gitdir", &self.gitdir)
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

fn default_identity() -> Envelope {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(0))
        .unwrap_or(0);
    Envelope {
        name: "keel".to_owned(),
        email: "keel@localhost".to_owned(),
        timestamp,
        zone: "+0000".to_owned(),
    }
}

impl Repository {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a repository at `root` (the gitdir itself when `bare`,
    /// `root/.git` otherwise) and open it.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] when a repository is already there.
    pub fn init(
        backend: Arc<dyn Backend>,
        root: impl Into<PathBuf>,
        opts: &InitOptions,
    ) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        let gitdir = if opts.bare { root.clone() } else { root.join(".git") };
        if backend.stat(&gitdir.join("HEAD"))?.is_some() {
            return Err(Error::AlreadyExists {
                what: format!("repository at {}", gitdir.display()),
            });
        }

        let mut config = Config::default();
        config.set("core.repositoryformatversion", if opts.object_format == HashKind::Sha1 {
            "0"
        } else {
            "1"
        });
        config.set("core.bare", if opts.bare { "true" } else { "false" });
        if opts.object_format != HashKind::Sha1 {
            config.set("extensions.objectformat", opts.object_format.config_name());
        }
        let branch = opts
            .default_branch
            .clone()
            .unwrap_or_else(|| "main".to_owned());
        config.set("init.defaultbranch", &branch);

        backend.create_dir_all(&gitdir.join("objects/info"))?;
        backend.create_dir_all(&gitdir.join("objects/pack"))?;
        backend.create_dir_all(&gitdir.join("refs/heads"))?;
        backend.create_dir_all(&gitdir.join("refs/tags"))?;
        backend.write(
            &gitdir.join("config"),
            config.serialize().as_bytes(),
            WriteMode::Regular,
        )?;
        backend.write(
            &gitdir.join("HEAD"),
            format!("ref: refs/heads/{branch}\n").as_bytes(),
            WriteMode::Regular,
        )?;
        debug!(gitdir = %gitdir.display(), bare = opts.bare, "initialized repository");

        Self::open(backend, root)
    }

    /// Open an existing repository at `root` (worktree root or bare
    /// gitdir).
    ///
    /// # Errors
    /// [`Error::NotFound`] when no repository lives there;
    /// [`Error::Unsupported`] for format features this library does not
    /// speak.
    pub fn open(backend: Arc<dyn Backend>, root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        let (gitdir, workdir) = if backend.stat(&root.join(".git/HEAD"))?.is_some() {
            (root.join(".git"), Some(root))
        } else if backend.stat(&root.join("HEAD"))?.is_some() {
            (root.clone(), None)
        } else {
            return Err(Error::NotFound {
                what: format!("repository at {}", root.display()),
            });
        };

        let config = match backend.read(&gitdir.join("config"))? {
            Some(bytes) => Config::parse(&String::from_utf8_lossy(&bytes))?,
            None => Config::default(),
        };
        let snapshot = ConfigSnapshot::resolve(&config)?;
        let workdir = if snapshot.bare { None } else { workdir };

        let identity = default_identity();
        let store = ObjectStore::new(
            Arc::clone(&backend),
            gitdir.join("objects"),
            snapshot.object_format,
        );
        let refs = RefStore::new(
            Arc::clone(&backend),
            gitdir.clone(),
            snapshot.object_format,
            identity.clone(),
        );

        Ok(Self {
            backend,
            gitdir,
            workdir,
            config,
            snapshot,
            store,
            refs,
            events: EventBus::new(),
            identity,
            resource_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the identity used for commits and reflog entries.
    pub fn set_identity(&mut self, identity: Envelope) {
        self.refs.set_committer(identity.clone());
        self.identity = identity;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The object store.
    #[must_use]
    pub const fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The ref store.
    #[must_use]
    pub const fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// The event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// The resolved config snapshot taken at open time.
    #[must_use]
    pub const fn config(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Raw config access (for keys outside the snapshot).
    #[must_use]
    pub const fn raw_config(&self) -> &Config {
        &self.config
    }

    /// The gitdir path (backend-relative).
    #[must_use]
    pub fn gitdir(&self) -> &Path {
        &self.gitdir
    }

    /// The worktree root; `None` for bare repositories.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// `HEAD`'s object id, `None` on an unborn branch.
    ///
    /// # Errors
    /// Ref store failures propagate.
    pub fn head(&self) -> Result<Option<ObjectId>, Error> {
        self.refs.resolve("HEAD")
    }

    /// The branch `HEAD` points at, `None` when detached.
    ///
    /// # Errors
    /// Ref store failures propagate.
    pub fn head_target(&self) -> Result<Option<String>, Error> {
        self.refs.read_symbolic("HEAD")
    }

    fn resource_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .resource_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_owned()).or_default())
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    /// Load the staging index.
    ///
    /// # Errors
    /// [`Error::Corrupt`] / [`Error::Unsupported`] from the binary format.
    pub fn load_index(&self) -> Result<Index, Error> {
        Index::load(self.backend.as_ref(), &self.gitdir, self.snapshot.object_format)
    }

    /// Persist the index atomically (last save wins) and publish the
    /// event.
    ///
    /// # Errors
    /// Backend failures propagate.
    pub fn save_index(&self, index: &Index) -> Result<(), Error> {
        let lock = self.resource_lock("index");
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.save(self.backend.as_ref(), &self.gitdir)?;
        self.events.publish(&Resource::Index, &Event::IndexSaved);
        Ok(())
    }

    /// Stage a worktree file (or removal) at `path`.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the path is neither on disk nor staged.
    pub fn add(&self, index: &mut Index, path: &str) -> Result<(), Error> {
        let workdir = self.workdir.as_deref().ok_or(Error::MissingParameter { name: "workdir" })?;
        let full = workdir.join(path);
        match self.backend.stat(&full)? {
            None => {
                if !index.remove(path) {
                    return Err(Error::NotFound { what: format!("path {path}") });
                }
            }
            Some(stat) => {
                let (mode, data) = match stat.kind {
                    keel_fs::FileKind::Symlink => {
                        let target = self.backend.read_link(&full)?;
                        (
                            keel_odb::EntryMode::Link,
                            target.to_string_lossy().into_owned().into_bytes(),
                        )
                    }
                    keel_fs::FileKind::Executable => (
                        keel_odb::EntryMode::BlobExecutable,
                        self.backend.read(&full)?.unwrap_or_default(),
                    ),
                    _ => (
                        keel_odb::EntryMode::Blob,
                        self.backend.read(&full)?.unwrap_or_default(),
                    ),
                };
                let oid = self.store.write(ObjectKind::Blob, &data, false)?;
                let mut entry = IndexEntry::new(path, mode, oid);
                entry.stat = stat;
                index.insert(entry);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit & tags & branches
    // -----------------------------------------------------------------------

    /// Commit the staged tree onto the current branch and return the new
    /// commit id.
    ///
    /// # Errors
    /// - [`Error::Conflict`] while the index holds unmerged stages, or on
    ///   a HEAD race.
    /// - [`Error::InvalidParameter`] for an empty commit without
    ///   `allow_empty`.
    #[instrument(skip_all, fields(gitdir = %self.gitdir.display()))]
    pub fn commit(&self, message: &str, opts: &CommitOptions) -> Result<ObjectId, Error> {
        let lock = self.resource_lock("HEAD");
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let index = self.load_index().in_operation("commit")?;
        if index.has_conflicts() {
            return Err(Error::Conflict {
                kind: crate::error::ConflictKind::Merge,
                paths: index.conflicted_paths(),
            });
        }

        let mut rows = BTreeMap::new();
        for entry in index.iter() {
            rows.insert(entry.path.clone(), (entry.mode, entry.oid));
        }
        let tree_oid = treebuild::write_tree(&self.store, &rows, false).in_operation("commit")?;

        let parent = self.head().in_operation("commit")?;
        if !opts.allow_empty
            && let Some(parent_oid) = parent
        {
            let parent_tree = revision::tree_of(&self.store, parent_oid)?;
            if parent_tree == tree_oid {
                return Err(Error::InvalidParameter {
                    name: "message",
                    reason: "nothing to commit (tree unchanged)".to_owned(),
                });
            }
        }

        let author = opts.author.clone().unwrap_or_else(|| self.identity.clone());
        let committer = opts.committer.clone().unwrap_or_else(|| self.identity.clone());
        let parents: Vec<ObjectId> = parent.into_iter().collect();
        let commit = Commit::new(tree_oid, &parents, &author, &committer, message);
        let oid = self
            .store
            .write(ObjectKind::Commit, &commit.serialize(), false)
            .in_operation("commit")?;

        let subject = message.lines().next().unwrap_or_default();
        let log = format!("commit: {subject}");
        // CAS against the parent we built on; the zero id asserts an unborn
        // branch stays unborn until this commit lands.
        let expected = Some(parent.unwrap_or_else(|| self.snapshot.object_format.zero()));
        match self.head_target().in_operation("commit")? {
            Some(branch) => self.refs.write(&branch, oid, expected, &log).in_operation("commit")?,
            None => self.refs.write("HEAD", oid, expected, &log).in_operation("commit")?,
        }
        self.events.publish(&Resource::Head, &Event::RefUpdated { old: parent, new: Some(oid) });
        debug!(commit = %oid, "created commit");
        Ok(oid)
    }

    /// Create a branch at `target` (default: `HEAD`).
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] when the branch exists.
    pub fn branch_create(&self, name: &str, target: Option<&str>) -> Result<ObjectId, Error> {
        let full = format!("refs/heads/{name}");
        let oid = match target {
            Some(spec) => self.rev_parse(spec)?,
            None => self.head()?.ok_or_else(|| Error::NotFound {
                what: "HEAD (unborn branch)".to_owned(),
            })?,
        };
        if self.refs.resolve(&full)?.is_some() {
            return Err(Error::AlreadyExists { what: format!("branch {name}") });
        }
        self.refs.write(&full, oid, Some(self.snapshot.object_format.zero()), "branch: created")?;
        self.events
            .publish(&Resource::Ref(full), &Event::RefUpdated { old: None, new: Some(oid) });
        Ok(oid)
    }

    /// Create a tag. With a message, an annotated tag object is written;
    /// without, the ref points straight at the target.
    ///
    /// # Errors
    /// [`Error::AlreadyExists`] when the tag exists.
    pub fn tag_create(
        &self,
        name: &str,
        target: &str,
        message: Option<&str>,
    ) -> Result<ObjectId, Error> {
        let full = format!("refs/tags/{name}");
        if self.refs.resolve(&full)?.is_some() {
            return Err(Error::AlreadyExists { what: format!("tag {name}") });
        }
        let target_oid = self.rev_parse(target)?;
        let ref_oid = match message {
            None => target_oid,
            Some(message) => {
                let kind = self.store.read(&target_oid)?.kind;
                let tag = Tag::new(target_oid, kind, name, &self.identity, message);
                self.store.write(ObjectKind::Tag, &tag.serialize(), false)?
            }
        };
        self.refs.write(&full, ref_oid, Some(self.snapshot.object_format.zero()), "tag: created")?;
        self.events
            .publish(&Resource::Ref(full), &Event::RefUpdated { old: None, new: Some(ref_oid) });
        Ok(ref_oid)
    }

    /// Delete a tag. Missing tags are a [`Error::NotFound`].
    ///
    /// # Errors
    /// As stated.
    pub fn tag_delete(&self, name: &str) -> Result<(), Error> {
        let full = format!("refs/tags/{name}");
        let old = self.refs.resolve(&full)?;
        if old.is_none() {
            return Err(Error::NotFound { what: format!("tag {name}") });
        }
        self.refs.delete(&full)?;
        self.events.publish(&Resource::Ref(full), &Event::RefUpdated { old, new: None });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Revision & ancestry
    // -----------------------------------------------------------------------

    /// Resolve a revision expression.
    ///
    /// # Errors
    /// See [`revision::rev_parse`].
    pub fn rev_parse(&self, spec: &str) -> Result<ObjectId, Error> {
        revision::rev_parse(&self.refs, &self.store, spec)
    }

    /// `true` when `ancestor` is reachable from `descendant`.
    ///
    /// # Errors
    /// Store failures propagate.
    pub fn is_ancestor(&self, ancestor: ObjectId, descendant: ObjectId) -> Result<bool, Error> {
        revision::is_ancestor(&self.store, ancestor, descendant)
    }

    /// Nearest common ancestor of two commits.
    ///
    /// # Errors
    /// Store failures propagate.
    pub fn merge_base(&self, a: ObjectId, b: ObjectId) -> Result<Option<ObjectId>, Error> {
        revision::merge_base(&self.store, a, b)
    }

    // -----------------------------------------------------------------------
    // Checkout & reset
    // -----------------------------------------------------------------------

    /// Check out a revision into the worktree.
    ///
    /// With non-empty `opts.filepaths` this is a file checkout and HEAD
    /// does not move; otherwise HEAD is repointed at the revision (the
    /// branch ref when `spec` names a branch, detached otherwise) unless
    /// `update_head` is `false`.
    ///
    /// # Errors
    /// Checkout [`Error::Conflict`] from the pre-check; resolution errors
    /// from `spec`.
    #[instrument(skip(self, opts), fields(gitdir = %self.gitdir.display()))]
    pub fn checkout(
        &self,
        spec: &str,
        opts: &CheckoutOptions,
        update_head: bool,
    ) -> Result<CheckoutOutcome, Error> {
        let workdir = self
            .workdir
            .as_deref()
            .ok_or(Error::MissingParameter { name: "workdir" })
            .in_operation("checkout")?;
        let target = self.rev_parse(spec).in_operation("checkout")?;
        let target_tree = revision::tree_of(&self.store, target).in_operation("checkout")?;
        let previous_head = self.head().in_operation("checkout")?;

        let lock = self.resource_lock("index");
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut index = self.load_index().in_operation("checkout")?;
        let outcome =
            checkout_tree(&self.store, self.backend.as_ref(), workdir, &mut index, target_tree, opts)
                .in_operation("checkout")?;
        if opts.dry_run {
            return Ok(outcome);
        }
        index.save(self.backend.as_ref(), &self.gitdir).in_operation("checkout")?;

        let file_checkout = !opts.filepaths.is_empty();
        if update_head && !file_checkout {
            // Prefer staying on a branch when the spec names one.
            let branch = format!("refs/heads/{spec}");
            if self.refs.resolve(&branch)?.is_some() {
                self.refs.write_symbolic("HEAD", &branch, None, &format!("checkout: {spec}"))?;
            } else {
                self.refs.write("HEAD", target, None, &format!("checkout: {spec}"))?;
            }
        }
        self.events.publish(&Resource::Worktree, &Event::CheckoutCompleted {
            previous_head,
            new_head: self.head()?,
            kind: if file_checkout { "file" } else { "branch" },
        });
        Ok(outcome)
    }

    /// Reset HEAD (and optionally index and worktree) to a revision.
    ///
    /// # Errors
    /// Resolution and store failures propagate.
    pub fn reset(&self, spec: &str, mode: ResetMode) -> Result<ObjectId, Error> {
        let target = self.rev_parse(spec).in_operation("reset")?;
        let target_commit = revision::peel_tags(&self.store, target)?;
        let old = self.head()?;

        if mode == ResetMode::Hard {
            let workdir = self
                .workdir
                .as_deref()
                .ok_or(Error::MissingParameter { name: "workdir" })?;
            let tree_oid = revision::tree_of(&self.store, target_commit)?;
            let lock = self.resource_lock("index");
            let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut index = self.load_index()?;
            checkout_tree(
                &self.store,
                self.backend.as_ref(),
                workdir,
                &mut index,
                tree_oid,
                &CheckoutOptions { force: true, ..CheckoutOptions::default() },
            )
            .in_operation("reset")?;
            index.save(self.backend.as_ref(), &self.gitdir)?;
        } else if mode == ResetMode::Mixed {
            let tree_oid = revision::tree_of(&self.store, target_commit)?;
            let mut index = Index::new(self.snapshot.object_format);
            for (path, (mode, oid)) in flatten_tree(&self.store, tree_oid)? {
                index.insert(IndexEntry::new(path, mode, oid));
            }
            self.save_index(&index)?;
        }

        let log = format!("reset: moving to {spec}");
        match self.head_target()? {
            Some(branch) => self.refs.write(&branch, target_commit, old, &log)?,
            None => self.refs.write("HEAD", target_commit, old, &log)?,
        }
        self.events
            .publish(&Resource::Head, &Event::RefUpdated { old, new: Some(target_commit) });
        Ok(target_commit)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge a revision into HEAD.
    ///
    /// Clean merges write a merge commit and advance the branch; conflicts
    /// stage 1/2/3 entries, write marker files into the worktree, and come
    /// back as data for the caller to resolve. `dry_run` computes the
    /// outcome without any mutation.
    ///
    /// # Errors
    /// Resolution and store failures; a merge against an unborn HEAD is
    /// [`Error::NotFound`].
    #[instrument(skip(self, opts), fields(gitdir = %self.gitdir.display()))]
    pub fn merge(
        &self,
        theirs_spec: &str,
        message: Option<&str>,
        opts: &MergeOptions,
    ) -> Result<MergeOutcome, Error> {
        let ours = self
            .head()
            .in_operation("merge")?
            .ok_or_else(|| Error::NotFound { what: "HEAD (unborn branch)".to_owned() })?;
        let theirs = self.rev_parse(theirs_spec).in_operation("merge")?;
        let theirs_commit = revision::peel_tags(&self.store, theirs)?;

        // Fast paths: already contained, or fast-forward.
        if self.is_ancestor(theirs_commit, ours)? {
            let tree = revision::tree_of(&self.store, ours)?;
            return Ok(MergeOutcome { tree: Some(tree), ..MergeOutcome::default() });
        }

        let base = self.merge_base(ours, theirs_commit)?;
        let ours_tree = revision::tree_of(&self.store, ours)?;
        let theirs_tree = revision::tree_of(&self.store, theirs_commit)?;
        let base_tree = base.map(|b| revision::tree_of(&self.store, b)).transpose()?;

        let lock = self.resource_lock("index");
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut index = self.load_index().in_operation("merge")?;
        let outcome =
            merge_trees(&self.store, base_tree, ours_tree, theirs_tree, &mut index, opts)
                .in_operation("merge")?;
        if opts.dry_run {
            return Ok(outcome);
        }

        // Materialize results that differ from our side.
        if let Some(workdir) = self.workdir.as_deref() {
            let ours_rows = flatten_tree(&self.store, ours_tree)?;
            for (path, &(mode, oid)) in &outcome.rows {
                if ours_rows.get(path) != Some(&(mode, oid)) {
                    let data = self.store.read(&oid)?;
                    let write_mode = if mode == keel_odb::EntryMode::BlobExecutable {
                        WriteMode::Executable
                    } else {
                        WriteMode::Regular
                    };
                    self.backend.write_atomic(&workdir.join(path), &data.bytes, write_mode)?;
                }
            }
            for conflict in &outcome.conflicts {
                if let Some(text) = &conflict.marker_text {
                    self.backend.write_atomic(
                        &workdir.join(&conflict.path),
                        text,
                        WriteMode::Regular,
                    )?;
                }
            }
        }
        index.save(self.backend.as_ref(), &self.gitdir).in_operation("merge")?;
        self.events.publish(&Resource::Index, &Event::IndexSaved);

        if outcome.is_clean() {
            let tree_oid = outcome.tree.ok_or_else(|| Error::Corrupt {
                at: "merge".to_owned(),
                detail: "clean merge without a tree".to_owned(),
            })?;
            let text = message
                .map_or_else(|| format!("Merge {theirs_spec}"), str::to_owned);
            let commit =
                Commit::new(tree_oid, &[ours, theirs_commit], &self.identity, &self.identity, text);
            let merge_commit =
                self.store.write(ObjectKind::Commit, &commit.serialize(), false)?;
            let log = format!("merge {theirs_spec}");
            match self.head_target()? {
                Some(branch) => self.refs.write(&branch, merge_commit, Some(ours), &log)?,
                None => self.refs.write("HEAD", merge_commit, Some(ours), &log)?,
            }
            self.events
                .publish(&Resource::Head, &Event::RefUpdated { old: Some(ours), new: Some(merge_commit) });
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Diff & status
    // -----------------------------------------------------------------------

    /// Diff two trees (`None` old side = the empty tree).
    ///
    /// # Errors
    /// Store failures propagate.
    pub fn diff_trees(
        &self,
        old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<Vec<DiffEntry>, Error> {
        let old_rows = match old {
            Some(oid) => flatten_tree(&self.store, oid)?,
            None => BTreeMap::new(),
        };
        let new_rows = flatten_tree(&self.store, new)?;

        let mut paths: Vec<&String> = old_rows.keys().chain(new_rows.keys()).collect();
        paths.sort_unstable();
        paths.dedup();

        let mut out = Vec::new();
        for path in paths {
            let old_slot = old_rows.get(path).copied();
            let new_slot = new_rows.get(path).copied();
            let change = match (old_slot, new_slot) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Deleted,
                (Some(a), Some(b)) if a != b => ChangeKind::Modified,
                _ => continue,
            };
            out.push(DiffEntry { path: path.clone(), change, old: old_slot, new: new_slot });
        }
        Ok(out)
    }

    /// Three-way status: HEAD tree vs index vs worktree.
    ///
    /// # Errors
    /// Store and backend failures propagate.
    pub fn status(&self) -> Result<Vec<StatusEntry>, Error> {
        use crate::walk::WalkSource;

        let index = self.load_index()?;
        let head_tree = match self.head()? {
            Some(head) => Some(revision::tree_of(&self.store, head)?),
            None => None,
        };

        let mut sources = Vec::new();
        match head_tree {
            Some(tree_oid) => sources.push(WalkSource::Tree(tree_oid)),
            None => sources.push(WalkSource::Tree(self.snapshot.object_format.empty_tree())),
        }
        sources.push(WalkSource::Index(&index));
        let has_worktree = self.workdir.is_some();
        if has_worktree {
            sources.push(WalkSource::Worktree);
        }

        let walker = Walker::new(&self.store, self.backend.as_ref(), self.workdir.as_deref());
        let mut rows = Vec::new();
        walker.walk::<()>(
            &sources,
            &mut |path, entries| {
                if path.is_empty() || entries.iter().flatten().any(crate::walk::SourceEntry::is_tree)
                {
                    return Ok(None);
                }
                let head_slot = entries[0].as_ref().and_then(|e| e.oid.map(|oid| (e.mode, oid)));
                let index_slot = entries[1].as_ref().and_then(|e| e.oid.map(|oid| (e.mode, oid)));
                let wt_slot = entries
                    .get(2)
                    .and_then(|s| s.as_ref())
                    .and_then(|e| e.oid.map(|oid| (e.mode, oid)));

                let staged = change_between(head_slot, index_slot);
                let unstaged = if has_worktree {
                    change_between(index_slot, wt_slot)
                } else {
                    None
                };
                if staged.is_some() || unstaged.is_some() {
                    rows.push(StatusEntry { path: path.to_owned(), staged, unstaged });
                }
                Ok(None)
            },
            &mut |v, _| Ok(v),
        )?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Shallow bookkeeping
    // -----------------------------------------------------------------------

    /// Tips recorded in `<gitdir>/shallow`.
    ///
    /// # Errors
    /// Backend failures propagate.
    pub fn shallow_tips(&self) -> Result<Vec<ObjectId>, Error> {
        let Some(bytes) = self.backend.read(&self.gitdir.join("shallow"))? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for line in String::from_utf8_lossy(&bytes).lines() {
            out.push(line.parse().map_err(|_| Error::Corrupt {
                at: "shallow".to_owned(),
                detail: format!("bad tip {line:?}"),
            })?);
        }
        Ok(out)
    }

    fn record_shallow(
        &self,
        shallow: &[ObjectId],
        unshallow: &[ObjectId],
    ) -> Result<Vec<ObjectId>, Error> {
        let mut tips: Vec<ObjectId> = self.shallow_tips()?;
        tips.extend_from_slice(shallow);
        tips.retain(|t| !unshallow.contains(t));
        tips.sort_unstable();
        tips.dedup();
        let path = self.gitdir.join("shallow");
        if tips.is_empty() {
            match self.backend.remove(&path) {
                Ok(()) | Err(keel_fs::FsError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            let mut text = String::new();
            for tip in &tips {
                text.push_str(&tip.to_hex());
                text.push('\n');
            }
            self.backend.write_atomic(&path, text.as_bytes(), WriteMode::Regular)?;
        }
        Ok(tips)
    }

    // -----------------------------------------------------------------------
    // Fetch & push
    // -----------------------------------------------------------------------

    /// Fetch `ref_names` from a connected carrier and apply the result:
    /// ingest the pack, index it, update `refs/remotes/<remote>/…`, and
    /// record shallow tips.
    ///
    /// # Errors
    /// Wire, store, and ref failures propagate; cancellation and timeouts
    /// surface as [`Error::Cancelled`] / [`Error::TimedOut`] with all temp
    /// state discarded.
    #[instrument(skip_all, fields(remote = remote, refs = ref_names.len()))]
    #[allow(clippy::too_many_arguments)]
    pub fn fetch<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        advert: &Advertisement,
        remote: &str,
        ref_names: &[String],
        depth: Option<u32>,
        cancel: &AtomicBool,
        deadline: Deadline,
    ) -> Result<FetchResult, Error> {
        if advert.object_format != self.snapshot.object_format {
            return Err(Error::Unsupported {
                what: format!(
                    "remote object format {}",
                    advert.object_format.config_name()
                ),
            })
            .in_operation("fetch");
        }

        let mut wants = Vec::new();
        let mut targets = Vec::new();
        for name in ref_names {
            let record = advert
                .find_ref(name)
                .ok_or_else(|| Error::NotFound { what: format!("remote ref {name}") })
                .in_operation("fetch")?;
            wants.push(record.oid);
            targets.push((name.clone(), record.oid));
        }

        let haves: Vec<ObjectId> =
            self.refs.list("refs/")?.into_iter().map(|(_, oid)| oid).collect();

        let mut pack = Vec::new();
        let mut progress = std::io::sink();
        let summary = keel_wire::fetch::run(
            reader,
            writer,
            advert,
            &FetchOptions {
                wants,
                haves,
                depth,
                filter_blob_none: false,
                agent: format!("keel/{}", env!("CARGO_PKG_VERSION")),
            },
            &mut pack,
            &mut progress,
            cancel,
            deadline,
        )
        .map_err(Error::from)
        .in_operation("fetch")?;

        // The Index state of the machine: verify the trailer, build the
        // .idx, install both.
        let pack_name = if pack.is_empty() {
            None
        } else {
            // Strip the goodbye LF some servers append after the pack.
            let trimmed = strip_pack_goodbye(&self.store, pack);
            Some(self.store.ingest_pack(trimmed).in_operation("fetch")?.0)
        };

        let mut updated_refs = Vec::new();
        for (name, oid) in targets {
            let tracking = match name.strip_prefix("refs/heads/") {
                Some(short) => format!("refs/remotes/{remote}/{short}"),
                None => format!("refs/remotes/{remote}/{name}"),
            };
            let old = self.refs.resolve(&tracking)?;
            self.refs.write(&tracking, oid, None, &format!("fetch {name}"))?;
            self.events.publish(
                &Resource::Ref(tracking.clone()),
                &Event::RefUpdated { old, new: Some(oid) },
            );
            updated_refs.push((tracking, oid));
        }

        let shallow = self
            .record_shallow(&summary.shallow, &summary.unshallow)
            .in_operation("fetch")?;
        Ok(FetchResult { pack_name, updated_refs, shallow })
    }

    /// Push `local_spec` to `remote_ref` over a connected carrier.
    ///
    /// The pack contains every object reachable from the local tip that is
    /// not already reachable from the advertised remote tips.
    ///
    /// # Errors
    /// Non-fast-forward pushes without `force` fail with a lock
    /// [`Error::Conflict`]; wire failures propagate.
    #[instrument(skip_all, fields(remote_ref = remote_ref))]
    #[allow(clippy::too_many_arguments)]
    pub fn push<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
        advert: &Advertisement,
        local_spec: &str,
        remote_ref: &str,
        force: bool,
        cancel: &AtomicBool,
        deadline: Deadline,
    ) -> Result<ReportStatus, Error> {
        let new = self.rev_parse(local_spec).in_operation("push")?;
        let old = advert
            .find_ref(remote_ref)
            .map_or_else(|| self.snapshot.object_format.zero(), |r| r.oid);

        if !force && !old.is_zero() {
            let known = self.store.contains(&old)?;
            if !known || !self.is_ancestor(old, new)? {
                return Err(Error::Conflict {
                    kind: crate::error::ConflictKind::Lock,
                    paths: vec![remote_ref.to_owned()],
                })
                .in_operation("push");
            }
        }

        // Objects the remote can already reach stay home.
        let mut exclude = HashSet::new();
        for record in &advert.refs {
            if self.store.contains(&record.oid)? {
                collect_reachable(&self.store, record.oid, &mut exclude)?;
            }
        }
        let mut include = HashSet::new();
        collect_reachable(&self.store, new, &mut include)?;

        let mut objects = Vec::new();
        for oid in ordered_for_pack(&self.store, &include, &exclude)? {
            let data = self.store.read(&oid)?;
            objects.push((data.kind, (*data.bytes).clone()));
        }
        let (pack, _) = keel_odb::pack_writer::write_pack(self.snapshot.object_format, &objects);

        let commands = vec![PushCommand { name: remote_ref.to_owned(), old, new }];
        let pack_bytes: &[u8] = if objects.is_empty() { &[] } else { &pack };
        let report = keel_wire::push::run(
            reader,
            writer,
            advert,
            &commands,
            pack_bytes,
            &format!("keel/{}", env!("CARGO_PKG_VERSION")),
            cancel,
            deadline,
        )
        .map_err(Error::from)
        .in_operation("push")?;
        Ok(report)
    }
}

fn change_between(old: crate::merge::Slot, new: crate::merge::Slot) -> Option<ChangeKind> {
    match (old, new) {
        (None, Some(_)) => Some(ChangeKind::Added),
        (Some(_), None) => Some(ChangeKind::Deleted),
        (Some(a), Some(b)) if a != b => Some(ChangeKind::Modified),
        _ => None,
    }
}

/// Pack receivers tolerate a single trailing LF goodbye byte after the
/// trailer; drop it when the pack verifies without it.
fn strip_pack_goodbye(store: &ObjectStore, pack: Vec<u8>) -> Vec<u8> {
    if pack.last() == Some(&b'\n') {
        let trimmed = &pack[..pack.len() - 1];
        if keel_odb::pack::PackFile::parse(
            PathBuf::from("incoming.pack"),
            trimmed.to_vec(),
            store.hash(),
        )
        .is_ok()
        {
            return trimmed.to_vec();
        }
    }
    pack
}

/// Every object reachable from `tip` (commits, trees, blobs, tags), added
/// to `out`.
fn collect_reachable(
    store: &ObjectStore,
    tip: ObjectId,
    out: &mut HashSet<ObjectId>,
) -> Result<(), Error> {
    let mut queue = VecDeque::from([tip]);
    while let Some(oid) = queue.pop_front() {
        if !out.insert(oid) {
            continue;
        }
        // Shallow boundaries reference parents that were never fetched.
        let data = match store.read(&oid) {
            Ok(data) => data,
            Err(keel_odb::OdbError::NotFound { .. }) => {
                out.remove(&oid);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match data.kind {
            ObjectKind::Commit => {
                let commit = Commit::parse(&data.bytes)?;
                queue.push_back(commit.tree()?);
                queue.extend(commit.parents());
            }
            ObjectKind::Tree => {
                for entry in tree::parse(&data.bytes, store.hash())? {
                    if entry.mode != keel_odb::EntryMode::Commit {
                        queue.push_back(entry.oid);
                    }
                }
            }
            ObjectKind::Tag => queue.push_back(Tag::parse(&data.bytes)?.target()?),
            ObjectKind::Blob => {}
        }
    }
    Ok(())
}

/// Deterministic pack order: commits, then trees, then blobs and tags, each
/// sorted by id.
fn ordered_for_pack(
    store: &ObjectStore,
    include: &HashSet<ObjectId>,
    exclude: &HashSet<ObjectId>,
) -> Result<Vec<ObjectId>, Error> {
    let mut commits = Vec::new();
    let mut trees = Vec::new();
    let mut rest = Vec::new();
    for oid in include {
        if exclude.contains(oid) {
            continue;
        }
        match store.read(oid)?.kind {
            ObjectKind::Commit => commits.push(*oid),
            ObjectKind::Tree => trees.push(*oid),
            _ => rest.push(*oid),
        }
    }
    commits.sort_unstable();
    trees.sort_unstable();
    rest.sort_unstable();
    commits.extend(trees);
    commits.extend(rest);
    Ok(commits)
}
