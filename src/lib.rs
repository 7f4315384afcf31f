//! keel — a portable Git object & transport engine over pluggable storage.
//!
//! This crate is the repository layer: the ref store, staging index, tree
//! walker, merge engine, worktree materializer, and the [`Repository`]
//! facade that binds them to the object database ([`keel-odb`](keel_odb)),
//! the wire protocol ([`keel-wire`](keel_wire)), and a storage backend
//! ([`keel-fs`](keel_fs)). No external `git` executable is involved
//! anywhere.
//!
//! # Quick tour
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keel::repo::{InitOptions, Repository};
//! use keel_fs::NativeBackend;
//!
//! # fn main() -> Result<(), keel::Error> {
//! let backend = Arc::new(NativeBackend::new("/tmp/demo"));
//! let repo = Repository::init(backend, "", &InitOptions::default())?;
//! let mut index = repo.load_index()?;
//! repo.add(&mut index, "README.md")?;
//! repo.save_index(&index)?;
//! repo.commit("initial import\n", &Default::default())?;
//! # Ok(())
//! # }
//! ```

pub mod checkout;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod merge;
pub mod refs;
pub mod repo;
pub mod revision;
pub mod treebuild;
pub mod walk;

pub use error::{ConflictKind, Error};
pub use repo::Repository;
