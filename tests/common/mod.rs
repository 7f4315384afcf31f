//! Shared helpers for keel integration tests.
//!
//! Every test repository lives on its own in-memory backend — no side
//! effects on the host filesystem and no reliance on an installed git.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use keel::repo::{InitOptions, Repository};
use keel_fs::{Backend, MemoryBackend, WriteMode};
use keel_odb::Envelope;

/// A repository over an in-memory backend, rooted at the backend root.
pub struct TestRepo {
    pub backend: Arc<dyn Backend>,
    pub repo: Repository,
}

impl TestRepo {
    /// Initialize a fresh non-bare repository with a deterministic
    /// identity.
    pub fn new() -> Self {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut repo =
            Repository::init(Arc::clone(&backend), "", &InitOptions::default()).expect("init");
        repo.set_identity(fixed_identity());
        Self { backend, repo }
    }

    /// Write a worktree file.
    pub fn write_file(&self, path: &str, content: &str) {
        self.backend
            .write(Path::new(path), content.as_bytes(), WriteMode::Regular)
            .expect("write file");
    }

    /// Read a worktree file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.backend.read(Path::new(path)).expect("read file")
    }

    /// Stage paths and commit, returning the commit id.
    pub fn commit_files(&self, message: &str, paths: &[&str]) -> keel_odb::ObjectId {
        let mut index = self.repo.load_index().expect("load index");
        for path in paths {
            self.repo.add(&mut index, path).expect("add");
        }
        self.repo.save_index(&index).expect("save index");
        self.repo.commit(message, &Default::default()).expect("commit")
    }
}

/// A fixed identity so object ids are reproducible across runs.
pub fn fixed_identity() -> Envelope {
    Envelope {
        name: "Integration Test".to_owned(),
        email: "it@example.com".to_owned(),
        timestamp: 1_700_000_000,
        zone: "+0000".to_owned(),
    }
}
