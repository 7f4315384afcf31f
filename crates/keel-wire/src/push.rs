//! Push: receive-pack command list, pack upload, report-status parsing.

use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;

use keel_odb::ObjectId;
use tracing::debug;

use crate::advert::Advertisement;
use crate::error::WireError;
use crate::fetch::{Deadline, checkpoint};
use crate::pkt::{self, Packet, PktReader};
use crate::sideband::{DemuxSinks, demux};

/// One ref update the client asks the server to apply.
///
/// A zero `old` creates the ref; a zero `new` deletes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushCommand {
    /// Full ref name on the remote.
    pub name: String,
    /// Expected current value on the server.
    pub old: ObjectId,
    /// Desired new value.
    pub new: ObjectId,
}

/// Per-ref outcome from report-status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefUpdateStatus {
    /// Server applied the update.
    Ok,
    /// Server rejected it, with its reason text.
    Rejected(String),
}

/// Parsed report-status response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportStatus {
    /// `unpack ok` line seen.
    pub unpack_ok: bool,
    /// Ref name → outcome, in server order.
    pub refs: Vec<(String, RefUpdateStatus)>,
}

impl ReportStatus {
    /// `true` when the pack unpacked and every ref update was accepted.
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.unpack_ok && self.refs.iter().all(|(_, s)| *s == RefUpdateStatus::Ok)
    }
}

/// Build the receive-pack command section. The first command line carries
/// the capability choices after a NUL.
#[must_use]
pub fn build_commands(advert: &Advertisement, commands: &[PushCommand], agent: &str) -> Vec<u8> {
    let mut caps = vec!["report-status".to_owned()];
    if advert.supports("side-band-64k") {
        caps.push("side-band-64k".to_owned());
    }
    if !agent.is_empty() {
        caps.push(format!("agent={agent}"));
    }

    let mut out = Vec::new();
    for (i, command) in commands.iter().enumerate() {
        let line = format!("{} {} {}", command.old, command.new, command.name);
        if i == 0 {
            let mut payload = line.into_bytes();
            payload.push(0);
            payload.extend_from_slice(caps.join(" ").as_bytes());
            payload.push(b'\n');
            out.extend(pkt::encode_data(&payload));
        } else {
            out.extend(pkt::encode_text(&line));
        }
    }
    out.extend(pkt::encode(&Packet::Flush));
    out
}

/// Run a push over a connected carrier: send the command list and the pack,
/// then parse report-status.
///
/// `pack` may be empty when every update is a deletion.
///
/// # Errors
/// - [`WireError::Protocol`] on malformed status lines or channel-3
///   content.
/// - [`WireError::Cancelled`] / [`WireError::TimedOut`] from the abort flag
///   and deadline.
#[allow(clippy::too_many_arguments)]
pub fn run<R: Read, W: Write>(
    reader: R,
    mut writer: W,
    advert: &Advertisement,
    commands: &[PushCommand],
    pack: &[u8],
    agent: &str,
    cancel: &AtomicBool,
    deadline: Deadline,
) -> Result<ReportStatus, WireError> {
    if commands.is_empty() {
        return Err(WireError::protocol("send-pack", "no ref updates to send"));
    }
    debug!(commands = commands.len(), pack_bytes = pack.len(), "starting push");

    checkpoint(cancel, &deadline, "push request")?;
    writer.write_all(&build_commands(advert, commands, agent))?;
    // The pack rides the carrier raw, after the command flush.
    if !pack.is_empty() {
        writer.write_all(pack)?;
    }
    writer.flush()?;

    if !advert.supports("report-status") {
        // Nothing will come back; assume success the way the old protocol
        // did.
        return Ok(ReportStatus {
            unpack_ok: true,
            refs: commands
                .iter()
                .map(|c| (c.name.clone(), RefUpdateStatus::Ok))
                .collect(),
        });
    }

    checkpoint(cancel, &deadline, "report-status")?;
    let mut reader = PktReader::new(reader);
    let status_lines = if advert.supports("side-band-64k") {
        // The report itself arrives pkt-lined inside channel 1.
        let mut inner = Vec::new();
        let mut progress = Vec::new();
        demux(&mut reader, &mut DemuxSinks { pack: &mut inner, progress: &mut progress })?;
        pkt::decode_all(&inner)?
    } else {
        let mut lines = Vec::new();
        while let Some(packet) = reader.read_packet()? {
            if packet == Packet::Flush {
                break;
            }
            lines.push(packet);
        }
        lines
    };

    parse_report(&status_lines)
}

fn parse_report(packets: &[Packet]) -> Result<ReportStatus, WireError> {
    let mut report = ReportStatus::default();
    for packet in packets {
        let Some(line) = packet.text() else {
            continue;
        };
        if line == "unpack ok" {
            report.unpack_ok = true;
        } else if let Some(reason) = line.strip_prefix("unpack ") {
            return Err(WireError::protocol(
                "receive-pack",
                format!("server failed to unpack: {reason}"),
            ));
        } else if let Some(name) = line.strip_prefix("ok ") {
            report.refs.push((name.to_owned(), RefUpdateStatus::Ok));
        } else if let Some(rest) = line.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            report
                .refs
                .push((name.to_owned(), RefUpdateStatus::Rejected(reason.to_owned())));
        } else {
            return Err(WireError::protocol(
                "receive-pack",
                format!("unexpected report-status line {line:?}"),
            ));
        }
    }
    Ok(report)
}
