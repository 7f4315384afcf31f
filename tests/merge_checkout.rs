//! Merge and checkout scenarios driven through the repository facade.

mod common;

use common::TestRepo;
use keel::checkout::CheckoutOptions;
use keel::error::{ConflictKind, Error};
use keel::index::{STAGE_BASE, STAGE_OURS, STAGE_THEIRS};
use keel::merge::MergeOptions;

/// base "a\nb\nc\n"; ours edits line 1, theirs edits line 3.
fn diverged_repo() -> TestRepo {
    let t = TestRepo::new();
    t.write_file("f.txt", "a\nb\nc\n");
    t.commit_files("base\n", &["f.txt"]);

    t.repo.branch_create("side", None).expect("branch");

    t.write_file("f.txt", "x\nb\nc\n");
    t.commit_files("ours\n", &["f.txt"]);

    t.repo.checkout("side", &CheckoutOptions::default(), true).expect("checkout side");
    t.write_file("f.txt", "a\nb\nz\n");
    t.commit_files("theirs\n", &["f.txt"]);

    t.repo.checkout("main", &CheckoutOptions::default(), true).expect("checkout main");
    t
}

#[test]
fn clean_three_way_merge_combines_both_edits() {
    let t = diverged_repo();
    let outcome = t.repo.merge("side", None, &MergeOptions::default()).unwrap();
    assert!(outcome.is_clean());

    // Worktree and index carry the combined content.
    assert_eq!(t.read_file("f.txt").as_deref(), Some(&b"x\nb\nz\n"[..]));
    let index = t.repo.load_index().unwrap();
    assert_eq!(index.stages("f.txt").len(), 1);
    assert!(index.get("f.txt").is_some());

    // A merge commit with two parents landed on main.
    let head = t.repo.head().unwrap().expect("head");
    let commit =
        keel_odb::Commit::parse(&t.repo.store().read(&head).unwrap().bytes).unwrap();
    assert_eq!(commit.parents().len(), 2);
}

#[test]
fn conflicting_merge_stages_three_sides_and_writes_markers() {
    let t = TestRepo::new();
    t.write_file("f.txt", "a\n");
    t.commit_files("base\n", &["f.txt"]);
    t.repo.branch_create("side", None).unwrap();

    t.write_file("f.txt", "b\n");
    t.commit_files("ours\n", &["f.txt"]);

    t.repo.checkout("side", &CheckoutOptions::default(), true).unwrap();
    t.write_file("f.txt", "c\n");
    t.commit_files("theirs\n", &["f.txt"]);
    t.repo.checkout("main", &CheckoutOptions::default(), true).unwrap();

    let outcome = t.repo.merge("side", None, &MergeOptions::default()).unwrap();
    assert!(!outcome.is_clean());

    assert_eq!(
        t.read_file("f.txt").as_deref(),
        Some(&b"<<<<<<< ours\nb\n=======\nc\n>>>>>>> theirs\n"[..])
    );

    let index = t.repo.load_index().unwrap();
    let stages = index.stages("f.txt");
    assert!(stages.contains_key(&STAGE_BASE));
    assert!(stages.contains_key(&STAGE_OURS));
    assert!(stages.contains_key(&STAGE_THEIRS));
    assert!(index.get("f.txt").is_none());

    // Committing while conflicted is refused.
    let err = t.repo.commit("merge attempt\n", &Default::default()).unwrap_err();
    assert!(matches!(err.root(), Error::Conflict { kind: ConflictKind::Merge, .. }));
}

#[test]
fn dry_run_merge_reports_without_mutating() {
    let t = diverged_repo();
    let head_before = t.repo.head().unwrap();
    let opts = MergeOptions { dry_run: true, ..MergeOptions::default() };
    let outcome = t.repo.merge("side", None, &opts).unwrap();
    assert!(outcome.is_clean());
    assert!(outcome.tree.is_some());

    // Nothing moved.
    assert_eq!(t.repo.head().unwrap(), head_before);
    assert_eq!(t.read_file("f.txt").as_deref(), Some(&b"x\nb\nc\n"[..]));
}

#[test]
fn merging_an_ancestor_is_a_no_op() {
    let t = TestRepo::new();
    t.write_file("f", "v1\n");
    let c1 = t.commit_files("one\n", &["f"]);
    t.write_file("f", "v2\n");
    t.commit_files("two\n", &["f"]);

    let outcome = t.repo.merge(&c1.to_string(), None, &MergeOptions::default()).unwrap();
    assert!(outcome.is_clean());
    assert_eq!(t.read_file("f").as_deref(), Some(&b"v2\n"[..]));
}

#[test]
fn checkout_switches_branches_and_preserves_untracked() {
    let t = TestRepo::new();
    t.write_file("tracked.txt", "main\n");
    t.commit_files("main content\n", &["tracked.txt"]);

    t.repo.branch_create("side", None).unwrap();
    t.repo.checkout("side", &CheckoutOptions::default(), true).unwrap();
    t.write_file("tracked.txt", "side\n");
    t.commit_files("side content\n", &["tracked.txt"]);

    // An untracked file neither branch claims.
    t.write_file("scratch.txt", "keep me\n");

    t.repo.checkout("main", &CheckoutOptions::default(), true).unwrap();
    assert_eq!(t.read_file("tracked.txt").as_deref(), Some(&b"main\n"[..]));
    assert_eq!(t.read_file("scratch.txt").as_deref(), Some(&b"keep me\n"[..]));
    assert_eq!(t.repo.head_target().unwrap().as_deref(), Some("refs/heads/main"));
}

#[test]
fn checkout_refuses_to_clobber_local_edits() {
    let t = TestRepo::new();
    t.write_file("f.txt", "v1\n");
    t.commit_files("one\n", &["f.txt"]);
    t.repo.branch_create("side", None).unwrap();
    t.write_file("f.txt", "v2\n");
    t.commit_files("two\n", &["f.txt"]);

    // Local, uncommitted edit on main.
    t.write_file("f.txt", "local\n");
    let err = t
        .repo
        .checkout("side", &CheckoutOptions::default(), true)
        .unwrap_err();
    match err.root() {
        Error::Conflict { kind: ConflictKind::Checkout, paths } => {
            assert_eq!(paths, &["f.txt"]);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Force discards the edit.
    let opts = CheckoutOptions { force: true, ..CheckoutOptions::default() };
    t.repo.checkout("side", &opts, true).unwrap();
    assert_eq!(t.read_file("f.txt").as_deref(), Some(&b"v1\n"[..]));
}

#[test]
fn file_checkout_restores_one_path_without_moving_head() {
    let t = TestRepo::new();
    t.write_file("a.txt", "a\n");
    t.write_file("b.txt", "b\n");
    t.commit_files("two files\n", &["a.txt", "b.txt"]);
    let head = t.repo.head().unwrap();

    t.write_file("a.txt", "edited\n");
    t.write_file("b.txt", "edited\n");

    let opts = CheckoutOptions {
        filepaths: vec!["a.txt".into()],
        force: true,
        ..CheckoutOptions::default()
    };
    t.repo.checkout("HEAD", &opts, true).unwrap();

    assert_eq!(t.read_file("a.txt").as_deref(), Some(&b"a\n"[..]));
    assert_eq!(t.read_file("b.txt").as_deref(), Some(&b"edited\n"[..]));
    assert_eq!(t.repo.head().unwrap(), head);
}

#[test]
fn detached_checkout_by_commit_id() {
    let t = TestRepo::new();
    t.write_file("f", "v1\n");
    let c1 = t.commit_files("one\n", &["f"]);
    t.write_file("f", "v2\n");
    t.commit_files("two\n", &["f"]);

    t.repo.checkout(&c1.to_string(), &CheckoutOptions::default(), true).unwrap();
    assert_eq!(t.repo.head().unwrap(), Some(c1));
    // Detached: HEAD is a direct oid, not a symref.
    assert_eq!(t.repo.head_target().unwrap(), None);
    assert_eq!(t.read_file("f").as_deref(), Some(&b"v1\n"[..]));
}
