//! Content-addressed object database for keel.
//!
//! Everything below the repository layer that touches objects lives here:
//! the byte and hash primitives (hex, SHA-1/SHA-256, the three pack varint
//! codecs, zlib), the canonical object model with byte-exact parsers for
//! trees, commits, and tags, the loose-object layout, packfile reading and
//! writing with delta resolution, pack `.idx` and multi-pack-index support,
//! and the [`ObjectStore`] that binds them behind one lookup surface.
//!
//! # Crate layout
//!
//! - [`oid`] / [`hex`] — [`ObjectId`], [`HashKind`], the hex codec.
//! - [`object`] — wrapped form `"<type> <size>\0<payload>"` and digesting.
//! - [`tree`], [`commit`], [`tag`] — object parsers and serializers.
//! - [`loose`], [`pack`], [`idx`], [`midx`], [`pack_writer`] — storage
//!   formats.
//! - [`varint`], [`delta`], [`zlib`] — pack building blocks.
//! - [`store`] — the [`ObjectStore`] facade with its bounded caches.
//! - [`error`] — the [`OdbError`] enum returned throughout.

pub mod cache;
pub mod commit;
pub mod delta;
pub mod error;
pub mod hex;
pub mod idx;
pub mod loose;
pub mod midx;
pub mod object;
pub mod oid;
pub mod pack;
pub mod pack_writer;
pub mod store;
pub mod tag;
pub mod tree;
pub mod varint;
pub mod zlib;

pub use commit::{Commit, Envelope};
pub use error::OdbError;
pub use object::ObjectKind;
pub use oid::{HashKind, Hasher, ObjectId, OidParseError};
pub use store::{ObjectData, ObjectStore, Source};
pub use tag::Tag;
pub use tree::{EntryMode, TreeEntry};
