//! The object store: one lookup surface over loose objects, packfiles, and
//! the multi-pack index.
//!
//! Lookup order is multi-pack index, then each pack index (fanout binary
//! search), then the loose layout; first hit wins. The store's only shared
//! mutable state is the lazily loaded pack list, the optional multi-pack
//! index, and the bounded object cache — all behind readers-writer locks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use keel_fs::{Backend, WriteMode};
use tracing::debug;

use crate::cache::LruCache;
use crate::error::OdbError;
use crate::idx::{self, IdxEntry, PackIndex};
use crate::loose;
use crate::midx::{self, MultiPackIndex};
use crate::object::{self, ObjectKind};
use crate::oid::{HashKind, ObjectId};
use crate::pack::{self, PackFile};
use crate::varint;
use crate::zlib;

/// Default bound for the inflated-object cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Where a read was satisfied from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// `objects/<ab>/<rest>`.
    Loose,
    /// A pack, by file name.
    Pack(String),
    /// Routed through the multi-pack index.
    Midx,
    /// The well-known empty tree, synthesized without disk backing.
    EmptyTree,
}

/// A materialized object.
#[derive(Clone, Debug)]
pub struct ObjectData {
    /// Object type.
    pub kind: ObjectKind,
    /// Content-form payload.
    pub bytes: Arc<Vec<u8>>,
    /// Where it came from.
    pub source: Source,
}

/// A pack with its paired index, loaded together.
#[derive(Debug)]
pub struct LoadedPack {
    /// The verified pack.
    pub pack: PackFile,
    /// Its `.idx`.
    pub index: PackIndex,
    /// File name (`pack-<hex>.pack`).
    pub name: String,
}

type PackList = Arc<Vec<Arc<LoadedPack>>>;

/// The content-addressed object database of one repository.
pub struct ObjectStore {
    backend: Arc<dyn Backend>,
    objects_dir: PathBuf,
    hash: HashKind,
    packs: RwLock<Option<PackList>>,
    midx: RwLock<Option<Arc<Option<MultiPackIndex>>>>,
    cache: LruCache<ObjectId, (ObjectKind, Vec<u8>, Source)>,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("objects_dir", &self.objects_dir)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Open the store rooted at `objects_dir` (usually `<gitdir>/objects`).
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, objects_dir: PathBuf, hash: HashKind) -> Self {
        Self::with_cache_capacity(backend, objects_dir, hash, DEFAULT_CACHE_CAPACITY)
    }

    /// Like [`new`](Self::new) with an explicit object-cache bound.
    #[must_use]
    pub fn with_cache_capacity(
        backend: Arc<dyn Backend>,
        objects_dir: PathBuf,
        hash: HashKind,
        cache_capacity: usize,
    ) -> Self {
        Self {
            backend,
            objects_dir,
            hash,
            packs: RwLock::new(None),
            midx: RwLock::new(None),
            cache: LruCache::new(cache_capacity),
        }
    }

    /// The repository hash function.
    #[must_use]
    pub const fn hash(&self) -> HashKind {
        self.hash
    }

    fn pack_dir(&self) -> PathBuf {
        self.objects_dir.join("pack")
    }

    // -----------------------------------------------------------------------
    // Pack list & multi-pack index loading
    // -----------------------------------------------------------------------

    fn load_packs(&self) -> Result<PackList, OdbError> {
        {
            let guard = self.packs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(list) = guard.as_ref() {
                return Ok(Arc::clone(list));
            }
        }
        let list = self.scan_packs()?;
        let mut guard = self.packs.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Another thread may have scanned concurrently; last write wins and
        // both lists describe the same directory state.
        *guard = Some(Arc::clone(&list));
        Ok(list)
    }

    fn scan_packs(&self) -> Result<PackList, OdbError> {
        let dir = self.pack_dir();
        let mut loaded = Vec::new();
        for name in self.backend.list(&dir)? {
            let Some(stem) = name.strip_suffix(".pack") else {
                continue;
            };
            let pack_path = dir.join(&name);
            let idx_path = dir.join(format!("{stem}.idx"));
            let Some(pack_bytes) = self.backend.read(&pack_path)? else {
                continue;
            };
            let Some(idx_bytes) = self.backend.read(&idx_path)? else {
                debug!(pack = %name, "pack has no index, skipping");
                continue;
            };
            let pack = PackFile::parse(pack_path, pack_bytes, self.hash)?;
            let index = PackIndex::parse(&idx_bytes, self.hash)?;
            loaded.push(Arc::new(LoadedPack { pack, index, name }));
        }
        debug!(count = loaded.len(), "scanned pack directory");
        Ok(Arc::new(loaded))
    }

    fn load_midx(&self) -> Result<Arc<Option<MultiPackIndex>>, OdbError> {
        {
            let guard = self.midx.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(m) = guard.as_ref() {
                return Ok(Arc::clone(m));
            }
        }
        let path = self.objects_dir.join("info").join("multi-pack-index");
        let parsed = match self.backend.read(&path)? {
            Some(bytes) => Some(MultiPackIndex::parse(&bytes, self.hash)?),
            None => None,
        };
        let arc = Arc::new(parsed);
        let mut guard = self.midx.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(Arc::clone(&arc));
        Ok(arc)
    }

    /// Drop the pack list, multi-pack index, and object cache so the next
    /// read re-lists the directory. Call after packs are added or removed
    /// underfoot.
    pub fn refresh(&self) {
        *self.packs.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        *self.midx.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        self.cache.clear();
    }

    /// Re-scan only if the set of pack files on disk changed since the list
    /// was loaded. Returns `true` when a change was detected.
    fn refresh_if_stale(&self) -> Result<bool, OdbError> {
        let loaded: Option<Vec<String>> = {
            let guard = self.packs.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.as_ref().map(|list| list.iter().map(|p| p.name.clone()).collect())
        };
        let Some(mut loaded) = loaded else {
            return Ok(false);
        };
        loaded.sort_unstable();
        let on_disk: Vec<String> = self
            .backend
            .list(&self.pack_dir())?
            .into_iter()
            .filter(|n| n.ends_with(".pack"))
            .collect();
        if loaded == on_disk {
            return Ok(false);
        }
        debug!("pack directory changed underfoot, invalidating caches");
        self.refresh();
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read an object's type and content.
    ///
    /// # Errors
    /// [`OdbError::NotFound`] when the id is not locatable anywhere; other
    /// failures indicate corruption or backend trouble.
    pub fn read(&self, oid: &ObjectId) -> Result<ObjectData, OdbError> {
        if let Some(hit) = self.cache.get(oid) {
            let (kind, bytes, source) = (*hit).clone();
            return Ok(ObjectData { kind, bytes: Arc::new(bytes), source });
        }
        match self.read_uncached(oid)? {
            Some(data) => {
                self.cache
                    .insert(*oid, Arc::new((data.kind, (*data.bytes).clone(), data.source.clone())));
                Ok(data)
            }
            None => {
                // A pack may have appeared or vanished underfoot; re-list
                // the directory once before declaring the object missing.
                if self.refresh_if_stale()? {
                    return self
                        .read_uncached(oid)?
                        .ok_or(OdbError::NotFound { oid: *oid });
                }
                Err(OdbError::NotFound { oid: *oid })
            }
        }
    }

    /// Read the wrapped form (`"<type> <size>\0<payload>"`).
    ///
    /// # Errors
    /// Same as [`read`](Self::read).
    pub fn read_wrapped(&self, oid: &ObjectId) -> Result<Vec<u8>, OdbError> {
        let data = self.read(oid)?;
        Ok(object::wrap(data.kind, &data.bytes))
    }

    fn read_uncached(&self, oid: &ObjectId) -> Result<Option<ObjectData>, OdbError> {
        let packs = self.load_packs()?;

        if let Some(hit) = self.load_midx()?.as_ref().as_ref().and_then(|m| m.lookup(oid)) {
            if let Some(loaded) = packs.iter().find(|p| p.name == hit.pack_name) {
                let (kind, bytes) = self.entry_from(loaded, hit.offset, &packs)?;
                return Ok(Some(ObjectData {
                    kind,
                    bytes: Arc::new(bytes),
                    source: Source::Midx,
                }));
            }
            debug!(pack = %hit.pack_name, "multi-pack-index names a missing pack");
        }

        for loaded in packs.iter() {
            if let Some(offset) = loaded.index.lookup(oid) {
                let (kind, bytes) = self.entry_from(loaded, offset, &packs)?;
                return Ok(Some(ObjectData {
                    kind,
                    bytes: Arc::new(bytes),
                    source: Source::Pack(loaded.name.clone()),
                }));
            }
        }

        if let Some((kind, bytes)) = loose::read(self.backend.as_ref(), &self.objects_dir, oid)? {
            return Ok(Some(ObjectData { kind, bytes: Arc::new(bytes), source: Source::Loose }));
        }

        // The empty tree exists in every repository whether or not anyone
        // ever wrote it.
        if *oid == self.hash.empty_tree() {
            return Ok(Some(ObjectData {
                kind: ObjectKind::Tree,
                bytes: Arc::new(Vec::new()),
                source: Source::EmptyTree,
            }));
        }
        Ok(None)
    }

    fn entry_from(
        &self,
        loaded: &LoadedPack,
        offset: u64,
        packs: &PackList,
    ) -> Result<(ObjectKind, Vec<u8>), OdbError> {
        let external = |base: &ObjectId| -> Result<Option<(ObjectKind, Vec<u8>)>, OdbError> {
            // A ref-delta base may live in another pack or loose.
            for other in packs.iter() {
                if let Some(off) = other.index.lookup(base) {
                    return other.pack.entry_at(off, &|_| Ok(None)).map(Some);
                }
            }
            loose::read(self.backend.as_ref(), &self.objects_dir, base)
        };
        loaded.pack.entry_at(offset, &external)
    }

    /// `true` if the object is locatable without materializing it.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn contains(&self, oid: &ObjectId) -> Result<bool, OdbError> {
        let packs = self.load_packs()?;
        if self.load_midx()?.as_ref().as_ref().is_some_and(|m| m.lookup(oid).is_some()) {
            return Ok(true);
        }
        if packs.iter().any(|p| p.index.lookup(oid).is_some()) {
            return Ok(true);
        }
        loose::contains(self.backend.as_ref(), &self.objects_dir, oid)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write an object, returning its id.
    ///
    /// Idempotent: the id is computed even for `dry_run`, and an object
    /// already present (loose or packed) is not rewritten.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn write(
        &self,
        kind: ObjectKind,
        payload: &[u8],
        dry_run: bool,
    ) -> Result<ObjectId, OdbError> {
        let oid = object::oid_of(self.hash, kind, payload);
        if dry_run || self.contains(&oid)? {
            return Ok(oid);
        }
        loose::write(self.backend.as_ref(), &self.objects_dir, self.hash, kind, payload)
    }

    // -----------------------------------------------------------------------
    // Enumeration & prefix search
    // -----------------------------------------------------------------------

    /// Enumerate every object with the source a lookup would pick.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn iter_objects(&self) -> Result<Vec<(ObjectId, Source)>, OdbError> {
        let mut seen: BTreeMap<ObjectId, Source> = BTreeMap::new();
        for loaded in self.load_packs()?.iter() {
            for entry in loaded.index.entries() {
                seen.entry(entry.oid).or_insert_with(|| Source::Pack(loaded.name.clone()));
            }
        }
        for oid in loose::iter(self.backend.as_ref(), &self.objects_dir, self.hash)? {
            seen.entry(oid).or_insert(Source::Loose);
        }
        Ok(seen.into_iter().collect())
    }

    /// Resolve an unambiguous hex prefix to a full id.
    ///
    /// # Errors
    /// [`OdbError::AmbiguousPrefix`] when several objects share the prefix.
    pub fn find_prefix(&self, prefix: &str) -> Result<Option<ObjectId>, OdbError> {
        if prefix.len() < 4 || prefix.len() > self.hash.hex_len() {
            return Ok(None);
        }
        let prefix = prefix.to_ascii_lowercase();
        let mut matches: Vec<ObjectId> = Vec::new();

        for loaded in self.load_packs()?.iter() {
            matches.extend(loaded.index.prefix_matches(&prefix));
        }
        // Loose fanout: the first two hex chars pick the directory.
        let fan = &prefix[..2];
        for rest in self.backend.list(&self.objects_dir.join(fan))? {
            let hex = format!("{fan}{rest}");
            if hex.starts_with(&prefix)
                && hex.len() == self.hash.hex_len()
                && let Ok(oid) = hex.parse::<ObjectId>()
            {
                matches.push(oid);
            }
        }

        matches.sort_unstable();
        matches.dedup();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(OdbError::AmbiguousPrefix { prefix }),
        }
    }

    // -----------------------------------------------------------------------
    // Pack ingestion (index-pack)
    // -----------------------------------------------------------------------

    /// Persist a raw pack received over the wire: verify it, build its
    /// `.idx`, and install both under `objects/pack/`.
    ///
    /// Returns the pack name and object count.
    ///
    /// # Errors
    /// - [`OdbError::Corrupt`] / [`OdbError::Unsupported`] from pack parsing.
    /// - [`OdbError::BaseMissing`] when a ref-delta base is neither in the
    ///   pack nor already in the store.
    pub fn ingest_pack(&self, bytes: Vec<u8>) -> Result<(String, u32), OdbError> {
        let tmp_path = self.pack_dir().join("tmp.pack");
        let pack = PackFile::parse(tmp_path, bytes, self.hash)?;
        let rows = self.index_entries_of(&pack)?;

        let name = format!("pack-{}", pack.trailer_oid().to_hex());
        let pack_path = self.pack_dir().join(format!("{name}.pack"));
        let idx_path = self.pack_dir().join(format!("{name}.idx"));
        let idx_bytes = idx::write(self.hash, &rows, &pack.trailer_oid());

        self.backend.write_atomic(&pack_path, pack.bytes(), WriteMode::Regular)?;
        self.backend.write_atomic(&idx_path, &idx_bytes, WriteMode::Regular)?;
        debug!(pack = %name, objects = rows.len(), "installed pack");

        self.refresh();
        Ok((format!("{name}.pack"), pack.object_count()))
    }

    /// Walk every entry of `pack`, resolving deltas, and produce the index
    /// rows `(oid, crc32, offset)`.
    #[allow(clippy::cast_possible_truncation)]
    fn index_entries_of(&self, pack: &PackFile) -> Result<Vec<IdxEntry>, OdbError> {
        let data = pack.bytes();
        let body_len = data.len() - self.hash.oid_len();
        let mut rows = Vec::with_capacity(pack.object_count() as usize);

        let mut pos = 12usize;
        for _ in 0..pack.object_count() {
            let offset = pos as u64;
            let header = varint::parse_entry_header(&data[pos..body_len])?;
            let mut cursor = pos + header.header_len;
            match header.type_code {
                pack::TYPE_OFS_DELTA => {
                    let (_, used) = varint::parse_ofs_distance(&data[cursor..body_len])?;
                    cursor += used;
                }
                pack::TYPE_REF_DELTA => cursor += self.hash.oid_len(),
                _ => {}
            }
            let (_, consumed) = zlib::inflate_prefix(&data[cursor..body_len])?;
            let end = cursor + consumed;

            // Materialize through the pack reader so delta chains and
            // external bases take the same path as normal reads.
            let external = |base: &ObjectId| -> Result<Option<(ObjectKind, Vec<u8>)>, OdbError> {
                match self.read(base) {
                    Ok(d) => Ok(Some((d.kind, (*d.bytes).clone()))),
                    Err(OdbError::NotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            };
            let (kind, payload) = pack.entry_at(offset, &external)?;
            let oid = object::oid_of(self.hash, kind, &payload);

            let mut crc = crc32fast::Hasher::new();
            crc.update(&data[pos..end]);
            rows.push(IdxEntry { oid, crc32: crc.finalize(), offset });

            pos = end;
        }

        if pos != body_len {
            return Err(OdbError::corrupt(
                pack.path().display().to_string(),
                format!("{} trailing bytes after last entry", body_len - pos),
            ));
        }
        Ok(rows)
    }

    /// Rebuild `objects/info/multi-pack-index` over the current pack list.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub fn write_midx(&self) -> Result<usize, OdbError> {
        let packs = self.load_packs()?;
        let tables: Vec<(String, Vec<(ObjectId, u64)>)> = packs
            .iter()
            .map(|p| {
                let rows = p.index.entries().iter().map(|e| (e.oid, e.offset)).collect();
                (p.name.clone(), rows)
            })
            .collect();
        let total = tables.iter().map(|(_, rows)| rows.len()).sum();
        let bytes = midx::write(self.hash, &tables);
        let path = self.objects_dir.join("info").join("multi-pack-index");
        self.backend.write_atomic(&path, &bytes, WriteMode::Regular)?;
        *self.midx.write().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
        Ok(total)
    }
}
