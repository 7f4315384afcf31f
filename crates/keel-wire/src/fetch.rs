//! Fetch negotiation: `Init → Discover → Negotiate → Receive → Done`.
//!
//! The carrier is an abstract byte stream pair; discovery has already
//! produced an [`Advertisement`] when [`run`] is called, so the machine
//! here covers the request, the acknowledgment exchange, and the
//! side-band-multiplexed pack stream. Indexing the received pack is the
//! object store's job, giving the caller the spec'd `Index` step.
//!
//! Every pkt-line boundary is a suspension point: the abort flag and the
//! deadline are checked before each read, and a failure at any state
//! leaves only the caller-owned sinks to clean up.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use keel_odb::ObjectId;
use tracing::debug;

use crate::advert::Advertisement;
use crate::error::WireError;
use crate::pkt::{self, Packet, PktReader};
use crate::sideband::{DemuxSinks, demux};

// ---------------------------------------------------------------------------
// Session plumbing shared with push
// ---------------------------------------------------------------------------

/// Deadline for a whole transport operation, checked at frame boundaries.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    total: Option<Duration>,
}

impl Deadline {
    /// A deadline `total` from now; `None` never expires.
    #[must_use]
    pub fn new(total: Option<Duration>) -> Self {
        Self { started: Instant::now(), total }
    }

    /// Fail with [`WireError::TimedOut`] once expired.
    ///
    /// # Errors
    /// [`WireError::TimedOut`] after expiry.
    pub fn check(&self, what: &'static str) -> Result<(), WireError> {
        match self.total {
            Some(limit) if self.started.elapsed() >= limit => Err(WireError::TimedOut { what }),
            _ => Ok(()),
        }
    }
}

pub(crate) fn checkpoint(
    cancel: &AtomicBool,
    deadline: &Deadline,
    what: &'static str,
) -> Result<(), WireError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(WireError::Cancelled);
    }
    deadline.check(what)
}

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// What to request.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Tips the client wants.
    pub wants: Vec<ObjectId>,
    /// Tips the client already has.
    pub haves: Vec<ObjectId>,
    /// Shallow-clone depth.
    pub depth: Option<u32>,
    /// Request the `blob:none` partial-clone filter.
    pub filter_blob_none: bool,
    /// Agent string advertised to the server.
    pub agent: String,
}

/// Machine states, exposed for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    /// Nothing sent yet.
    Init,
    /// Advertisement consumed.
    Discover,
    /// Wants/haves on the wire, reading acknowledgments.
    Negotiate,
    /// Pack bytes streaming.
    Receive,
    /// Stream complete.
    Done,
}

/// What a completed fetch produced (beyond the pack bytes in the sink).
#[derive(Clone, Debug, Default)]
pub struct FetchSummary {
    /// Tips the server reported as shallow boundaries.
    pub shallow: Vec<ObjectId>,
    /// Tips no longer shallow after this fetch.
    pub unshallow: Vec<ObjectId>,
    /// Channel-1 bytes forwarded to the pack sink.
    pub pack_bytes: u64,
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

/// Build the protocol-v2 `fetch` command body.
#[must_use]
pub fn build_request_v2(advert: &Advertisement, opts: &FetchOptions) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(pkt::encode_text("command=fetch"));
    if !opts.agent.is_empty() {
        out.extend(pkt::encode_text(&format!("agent={}", opts.agent)));
    }
    out.extend(pkt::encode_text(&format!(
        "object-format={}",
        advert.object_format.config_name()
    )));
    out.extend(pkt::encode(&Packet::Delim));
    out.extend(pkt::encode_text("ofs-delta"));
    for want in &opts.wants {
        out.extend(pkt::encode_text(&format!("want {want}")));
    }
    for have in &opts.haves {
        out.extend(pkt::encode_text(&format!("have {have}")));
    }
    if let Some(depth) = opts.depth {
        out.extend(pkt::encode_text(&format!("deepen {depth}")));
    }
    if opts.filter_blob_none {
        out.extend(pkt::encode_text("filter blob:none"));
    }
    out.extend(pkt::encode_text("done"));
    out.extend(pkt::encode(&Packet::Flush));
    out
}

/// Build the protocol-v1 `upload-pack` request.
///
/// First want line carries the capability choices; haves and `done` follow
/// the flush.
#[must_use]
pub fn build_request_v1(advert: &Advertisement, opts: &FetchOptions) -> Vec<u8> {
    let mut caps = vec!["side-band-64k".to_owned(), "ofs-delta".to_owned()];
    if advert.supports("multi_ack") {
        caps.push("multi_ack".to_owned());
    }
    if opts.depth.is_some() && advert.supports("shallow") {
        caps.push("shallow".to_owned());
    }
    if !opts.agent.is_empty() {
        caps.push(format!("agent={}", opts.agent));
    }

    let mut out = Vec::new();
    for (i, want) in opts.wants.iter().enumerate() {
        if i == 0 {
            out.extend(pkt::encode_text(&format!("want {want} {}", caps.join(" "))));
        } else {
            out.extend(pkt::encode_text(&format!("want {want}")));
        }
    }
    if let Some(depth) = opts.depth {
        out.extend(pkt::encode_text(&format!("deepen {depth}")));
    }
    out.extend(pkt::encode(&Packet::Flush));
    for have in &opts.haves {
        out.extend(pkt::encode_text(&format!("have {have}")));
    }
    out.extend(pkt::encode_text("done"));
    out
}

// ---------------------------------------------------------------------------
// The exchange
// ---------------------------------------------------------------------------

/// Run a fetch over a connected carrier.
///
/// Pack bytes stream into `pack_sink`; progress text into `progress_sink`.
///
/// # Errors
/// - [`WireError::Protocol`] on malformed frames, a missing pack section,
///   or channel-3 content.
/// - [`WireError::Cancelled`] / [`WireError::TimedOut`] from the abort flag
///   and deadline.
#[allow(clippy::too_many_arguments)]
pub fn run<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    advert: &Advertisement,
    opts: &FetchOptions,
    pack_sink: &mut dyn Write,
    progress_sink: &mut dyn Write,
    cancel: &AtomicBool,
    deadline: Deadline,
) -> Result<FetchSummary, WireError> {
    if opts.wants.is_empty() {
        return Err(WireError::protocol("negotiate", "nothing to want"));
    }
    debug!(version = advert.protocol_version, wants = opts.wants.len(), "starting fetch");

    checkpoint(cancel, &deadline, "request write")?;
    let request = match advert.protocol_version {
        2 => build_request_v2(advert, opts),
        1 => build_request_v1(advert, opts),
        v => return Err(WireError::Unsupported { what: format!("protocol version {v}") }),
    };
    writer.write_all(&request)?;
    writer.flush()?;
    let mut state = FetchState::Negotiate;

    let mut reader = PktReader::new(reader);
    let mut summary = FetchSummary::default();

    if advert.protocol_version == 2 {
        read_v2_response(
            &mut reader, &mut summary, &mut state, pack_sink, progress_sink, cancel, &deadline,
        )?;
    } else {
        read_v1_response(
            &mut reader, &mut summary, &mut state, opts, pack_sink, progress_sink, cancel,
            &deadline,
        )?;
    }

    debug_assert_eq!(state, FetchState::Done);
    debug!(pack_bytes = summary.pack_bytes, "fetch complete");
    Ok(summary)
}

fn read_v2_response<R: Read>(
    reader: &mut PktReader<R>,
    summary: &mut FetchSummary,
    state: &mut FetchState,
    pack_sink: &mut dyn Write,
    progress_sink: &mut dyn Write,
    cancel: &AtomicBool,
    deadline: &Deadline,
) -> Result<(), WireError> {
    loop {
        checkpoint(cancel, deadline, "fetch response")?;
        let packet = reader.expect_packet("negotiate")?;
        let Some(section) = packet.text() else {
            return Err(WireError::protocol("negotiate", "expected a section header"));
        };
        match section.as_str() {
            "shallow-info" => read_shallow_lines(reader, summary, cancel, deadline)?,
            "acknowledgments" => read_ack_lines(reader, cancel, deadline)?,
            "packfile" => {
                *state = FetchState::Receive;
                let (_, pack_bytes) = demux(
                    reader,
                    &mut DemuxSinks { pack: pack_sink, progress: progress_sink },
                )?;
                summary.pack_bytes = pack_bytes;
                *state = FetchState::Done;
                return Ok(());
            }
            other => {
                return Err(WireError::protocol(
                    "negotiate",
                    format!("unknown response section {other:?}"),
                ));
            }
        }
    }
}

fn read_shallow_lines<R: Read>(
    reader: &mut PktReader<R>,
    summary: &mut FetchSummary,
    cancel: &AtomicBool,
    deadline: &Deadline,
) -> Result<(), WireError> {
    loop {
        checkpoint(cancel, deadline, "shallow-info")?;
        let packet = reader.expect_packet("negotiate")?;
        let Some(line) = packet.text() else {
            // Delim ends the section; flush would end the response early.
            return Ok(());
        };
        if let Some(oid) = line.strip_prefix("shallow ") {
            summary.shallow.push(parse_line_oid(oid)?);
        } else if let Some(oid) = line.strip_prefix("unshallow ") {
            summary.unshallow.push(parse_line_oid(oid)?);
        } else {
            return Err(WireError::protocol(
                "negotiate",
                format!("unexpected shallow-info line {line:?}"),
            ));
        }
    }
}

fn read_ack_lines<R: Read>(
    reader: &mut PktReader<R>,
    cancel: &AtomicBool,
    deadline: &Deadline,
) -> Result<(), WireError> {
    loop {
        checkpoint(cancel, deadline, "acknowledgments")?;
        let packet = reader.expect_packet("negotiate")?;
        let Some(line) = packet.text() else {
            return Ok(());
        };
        if line == "NAK" || line == "ready" || line.starts_with("ACK ") {
            continue;
        }
        return Err(WireError::protocol(
            "negotiate",
            format!("unexpected acknowledgment {line:?}"),
        ));
    }
}

#[allow(clippy::too_many_arguments)]
fn read_v1_response<R: Read>(
    reader: &mut PktReader<R>,
    summary: &mut FetchSummary,
    state: &mut FetchState,
    opts: &FetchOptions,
    pack_sink: &mut dyn Write,
    progress_sink: &mut dyn Write,
    cancel: &AtomicBool,
    deadline: &Deadline,
) -> Result<(), WireError> {
    // Shallow grants come first when a depth was requested, closed by a
    // flush.
    if opts.depth.is_some() {
        loop {
            checkpoint(cancel, deadline, "shallow grants")?;
            let packet = reader.expect_packet("negotiate")?;
            let Some(line) = packet.text() else {
                break;
            };
            if let Some(oid) = line.strip_prefix("shallow ") {
                summary.shallow.push(parse_line_oid(oid)?);
            } else if let Some(oid) = line.strip_prefix("unshallow ") {
                summary.unshallow.push(parse_line_oid(oid)?);
            } else {
                // Not a shallow grant after all: let the ack loop see it.
                reader.unread(packet);
                break;
            }
        }
    }

    // Acknowledgment lines until the final ACK or NAK.
    loop {
        checkpoint(cancel, deadline, "acknowledgments")?;
        let packet = reader.expect_packet("negotiate")?;
        let Some(line) = packet.text() else {
            continue;
        };
        if line == "NAK" {
            break;
        }
        if let Some(rest) = line.strip_prefix("ACK ") {
            // multi_ack interim lines carry a status suffix; the bare final
            // ACK ends negotiation.
            if !rest.contains(' ') {
                break;
            }
            continue;
        }
        return Err(WireError::protocol(
            "negotiate",
            format!("unexpected negotiation line {line:?}"),
        ));
    }

    *state = FetchState::Receive;
    let (_, pack_bytes) = demux(
        reader,
        &mut DemuxSinks { pack: pack_sink, progress: progress_sink },
    )?;
    summary.pack_bytes = pack_bytes;
    *state = FetchState::Done;
    Ok(())
}

fn parse_line_oid(hex: &str) -> Result<ObjectId, WireError> {
    hex.parse()
        .map_err(|_| WireError::protocol("negotiate", format!("bad oid {hex:?}")))
}
