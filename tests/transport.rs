//! Wire protocol scenarios: framing, discovery, side-band, and a full
//! fetch → checkout round-trip against a simulated server.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use common::{TestRepo, fixed_identity};
use keel::checkout::CheckoutOptions;
use keel_odb::{Commit, EntryMode, HashKind, ObjectId, ObjectKind, pack_writer, tree};
use keel_wire::fetch::Deadline;
use keel_wire::pkt::{self, Packet};
use keel_wire::push::RefUpdateStatus;
use keel_wire::sideband::{SideBandLimit, mux_pack};
use keel_wire::{Advertisement, advert};

#[test]
fn pkt_line_framing_basics() {
    // A lone flush.
    let packets = pkt::decode_all(b"0000").unwrap();
    assert_eq!(packets, vec![Packet::Flush]);

    // "hi\n" frames as 0007hi\n.
    assert_eq!(pkt::encode_data(b"hi\n"), b"0007hi\n");
}

#[test]
fn v2_advertisement_reports_version_format_and_head() {
    let head = "af5626b4a114abcb82d63db7c8082c3c4756e51b";
    let mut bytes = Vec::new();
    bytes.extend(pkt::encode_text("version 2"));
    bytes.extend(pkt::encode_text("agent=test/1"));
    bytes.extend(pkt::encode_text("fetch"));
    bytes.extend_from_slice(b"0000");
    bytes.extend(pkt::encode_text(&format!("{head} HEAD symref-target:refs/heads/main")));
    bytes.extend(pkt::encode_text(&format!("{head} refs/heads/main")));
    bytes.extend_from_slice(b"0000");

    let parsed = advert::parse(&pkt::decode_all(&bytes).unwrap()).unwrap();
    assert_eq!(parsed.protocol_version, 2);
    assert_eq!(parsed.object_format, HashKind::Sha1);
    assert_eq!(parsed.head_target.as_deref(), Some("refs/heads/main"));
}

#[test]
fn sideband_demux_mux_identity_for_pack_bytes() {
    let pack: Vec<u8> = (0u32..100_000).map(|i| (i % 256) as u8).collect();

    let mut wire = Vec::new();
    for frame in mux_pack(&pack, SideBandLimit::Large) {
        wire.extend(frame);
    }
    wire.extend_from_slice(b"0000");

    let mut cursor = &wire[..];
    let mut reader = keel_wire::PktReader::new(&mut cursor);
    let mut out = Vec::new();
    let mut progress = Vec::new();
    keel_wire::sideband::demux(
        &mut reader,
        &mut keel_wire::sideband::DemuxSinks { pack: &mut out, progress: &mut progress },
    )
    .unwrap();

    // Channel-1 bytes survive byte-exact (plus the goodbye LF).
    assert_eq!(&out[..pack.len()], &pack[..]);
}

// ---------------------------------------------------------------------------
// Simulated server
// ---------------------------------------------------------------------------

/// A one-commit upstream built object-by-object, plus its v2 responses.
struct FakeServer {
    objects: Vec<(ObjectKind, Vec<u8>)>,
    tip: ObjectId,
}

impl FakeServer {
    /// One commit whose tree has `README.md → "# R\n"`.
    fn with_readme() -> Self {
        let hash = HashKind::Sha1;
        let blob = b"# R\n".to_vec();
        let blob_oid = keel_odb::object::oid_of(hash, ObjectKind::Blob, &blob);

        let mut entries = vec![tree::TreeEntry {
            mode: EntryMode::Blob,
            name: b"README.md".to_vec(),
            oid: blob_oid,
        }];
        tree::sort_entries(&mut entries);
        let tree_bytes = tree::serialize(&entries);
        let tree_oid = keel_odb::object::oid_of(hash, ObjectKind::Tree, &tree_bytes);

        let who = fixed_identity();
        let commit = Commit::new(tree_oid, &[], &who, &who, "upstream import\n");
        let commit_bytes = commit.serialize();
        let tip = keel_odb::object::oid_of(hash, ObjectKind::Commit, &commit_bytes);

        Self {
            objects: vec![
                (ObjectKind::Commit, commit_bytes),
                (ObjectKind::Tree, tree_bytes),
                (ObjectKind::Blob, blob),
            ],
            tip,
        }
    }

    fn advertisement(&self) -> Advertisement {
        let packets = vec![
            Packet::Data(b"version 2\n".to_vec()),
            Packet::Data(b"fetch=shallow\n".to_vec()),
            Packet::Data(b"object-format=sha1\n".to_vec()),
            Packet::Flush,
            Packet::Data(
                format!("{} HEAD symref-target:refs/heads/main\n", self.tip).into_bytes(),
            ),
            Packet::Data(format!("{} refs/heads/main\n", self.tip).into_bytes()),
            Packet::Flush,
        ];
        advert::parse(&packets).unwrap()
    }

    /// The v2 fetch response: shallow grants (when asked), acknowledgments,
    /// then the pack over side-band.
    fn fetch_response(&self, depth: Option<u32>) -> Vec<u8> {
        let (pack, _) = pack_writer::write_pack(HashKind::Sha1, &self.objects);
        let mut out = Vec::new();
        if depth.is_some() {
            out.extend(pkt::encode_text("shallow-info"));
            out.extend(pkt::encode_text(&format!("shallow {}", self.tip)));
            out.extend(pkt::encode(&Packet::Delim));
        }
        out.extend(pkt::encode_text("acknowledgments"));
        out.extend(pkt::encode_text("NAK"));
        out.extend(pkt::encode(&Packet::Delim));
        out.extend(pkt::encode_text("packfile"));
        for frame in mux_pack(&pack, SideBandLimit::Large) {
            out.extend(frame);
        }
        out.extend(pkt::encode(&Packet::Flush));
        out
    }
}

#[test]
fn fetch_then_checkout_materializes_the_upstream_worktree() {
    let server = FakeServer::with_readme();
    let t = TestRepo::new();
    let cancel = AtomicBool::new(false);

    let response = server.fetch_response(Some(1));
    let result = t
        .repo
        .fetch(
            &response[..],
            Vec::new(),
            &server.advertisement(),
            "origin",
            &["refs/heads/main".to_owned()],
            Some(1),
            &cancel,
            Deadline::new(None),
        )
        .unwrap();

    assert!(result.pack_name.is_some());
    assert_eq!(result.updated_refs.len(), 1);
    assert_eq!(result.updated_refs[0].0, "refs/remotes/origin/main");
    assert_eq!(result.updated_refs[0].1, server.tip);
    // Depth-1 fetch recorded the shallow tip.
    assert_eq!(result.shallow, vec![server.tip]);
    assert_eq!(t.repo.shallow_tips().unwrap(), vec![server.tip]);

    // Checkout of the fetched ref reproduces the upstream file exactly.
    t.repo
        .checkout("refs/remotes/origin/main", &CheckoutOptions::default(), true)
        .unwrap();
    assert_eq!(t.read_file("README.md").as_deref(), Some(&b"# R\n"[..]));

    let index = t.repo.load_index().unwrap();
    let entry = index.get("README.md").expect("index entry");
    assert_eq!(entry.stage, 0);
    assert_eq!(index.len(), 1);
}

#[test]
fn fetch_request_carries_wants_and_done() {
    let server = FakeServer::with_readme();
    let t = TestRepo::new();
    let cancel = AtomicBool::new(false);

    let response = server.fetch_response(None);
    let mut request = Vec::new();
    t.repo
        .fetch(
            &response[..],
            &mut request,
            &server.advertisement(),
            "origin",
            &["refs/heads/main".to_owned()],
            None,
            &cancel,
            Deadline::new(None),
        )
        .unwrap();

    let lines: Vec<String> =
        pkt::decode_all(&request).unwrap().iter().filter_map(Packet::text).collect();
    assert!(lines.contains(&"command=fetch".to_owned()));
    assert!(lines.contains(&format!("want {}", server.tip)));
    assert!(lines.contains(&"done".to_owned()));
}

#[test]
fn fetch_of_an_unadvertised_ref_is_not_found() {
    let server = FakeServer::with_readme();
    let t = TestRepo::new();
    let cancel = AtomicBool::new(false);
    let err = t
        .repo
        .fetch(
            &b""[..],
            Vec::new(),
            &server.advertisement(),
            "origin",
            &["refs/heads/nope".to_owned()],
            None,
            &cancel,
            Deadline::new(None),
        )
        .unwrap_err();
    assert!(matches!(err.root(), keel::Error::NotFound { .. }));
}

#[test]
fn push_sends_commands_pack_and_parses_report() {
    let t = TestRepo::new();
    t.write_file("f.txt", "content\n");
    let tip = t.commit_files("one\n", &["f.txt"]);
    let cancel = AtomicBool::new(false);

    // Remote advertises an empty repository that accepts report-status
    // over side-band.
    let advert_packets = vec![
        Packet::Data(
            format!(
                "{} capabilities^{{}}\0report-status side-band-64k agent=test/1",
                "0000000000000000000000000000000000000000"
            )
            .into_bytes(),
        ),
        Packet::Flush,
    ];
    let remote = advert::parse(&advert_packets).unwrap();

    // Server-side response: report-status pkt-lines inside channel 1.
    let mut inner = Vec::new();
    inner.extend(pkt::encode_text("unpack ok"));
    inner.extend(pkt::encode_text("ok refs/heads/main"));
    inner.extend(pkt::encode(&Packet::Flush));
    let mut response = Vec::new();
    let mut payload = vec![1u8];
    payload.extend_from_slice(&inner);
    response.extend(pkt::encode_data(&payload));
    response.extend(pkt::encode(&Packet::Flush));

    let mut sent = Vec::new();
    let report = t
        .repo
        .push(
            &response[..],
            &mut sent,
            &remote,
            "main",
            "refs/heads/main",
            false,
            &cancel,
            Deadline::new(None),
        )
        .unwrap();

    assert!(report.all_ok());
    assert_eq!(report.refs[0].1, RefUpdateStatus::Ok);

    // The wire carries the command line and then a verifiable pack with
    // the commit, its tree, and its blob.
    let zero = "0".repeat(40);
    let expected_command = format!("{zero} {tip} refs/heads/main");
    assert!(sent.windows(expected_command.len()).any(|w| w == expected_command.as_bytes()));

    let pack_start = sent.windows(4).position(|w| w == b"PACK").expect("pack in stream");
    let pack = keel_odb::pack::PackFile::parse(
        "sent.pack".into(),
        sent[pack_start..].to_vec(),
        HashKind::Sha1,
    )
    .unwrap();
    assert_eq!(pack.object_count(), 3);
}

#[test]
fn non_fast_forward_push_is_refused_without_force() {
    let t = TestRepo::new();
    t.write_file("f", "v1\n");
    let c1 = t.commit_files("one\n", &["f"]);
    t.write_file("f", "v2\n");
    t.commit_files("two\n", &["f"]);

    // Push c1 (an ancestor of HEAD) onto a remote already at HEAD.
    let head = t.repo.head().unwrap().expect("head");
    let advert_packets = vec![
        Packet::Data(format!("{head} refs/heads/main\0report-status").into_bytes()),
        Packet::Flush,
    ];
    let remote = advert::parse(&advert_packets).unwrap();
    let cancel = AtomicBool::new(false);

    let err = t
        .repo
        .push(
            &b""[..],
            Vec::new(),
            &remote,
            &c1.to_string(),
            "refs/heads/main",
            false,
            &cancel,
            Deadline::new(None),
        )
        .unwrap_err();
    assert!(matches!(err.root(), keel::Error::Conflict { .. }));
}

#[test]
fn fetched_pack_objects_resolve_through_the_store() {
    let server = FakeServer::with_readme();
    let t = TestRepo::new();
    let cancel = AtomicBool::new(false);
    t.repo
        .fetch(
            &server.fetch_response(None)[..],
            Vec::new(),
            &server.advertisement(),
            "origin",
            &["refs/heads/main".to_owned()],
            None,
            &cancel,
            Deadline::new(None),
        )
        .unwrap();

    // Walk commit → tree → blob purely through the object store.
    let commit_data = t.repo.store().read(&server.tip).unwrap();
    let commit = Commit::parse(&commit_data.bytes).unwrap();
    let mut rows = BTreeMap::new();
    for entry in
        tree::parse(&t.repo.store().read(&commit.tree().unwrap()).unwrap().bytes, HashKind::Sha1)
            .unwrap()
    {
        rows.insert(entry.name_lossy(), entry.oid);
    }
    let readme = rows["README.md"];
    assert_eq!(&*t.repo.store().read(&readme).unwrap().bytes, b"# R\n");
}
