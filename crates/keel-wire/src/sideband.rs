//! Side-band multiplexing.
//!
//! Inside a side-band session the first payload byte of every data frame
//! names a channel: `1` packfile bytes, `2` progress text, `3` a fatal
//! error. Frames without a recognized channel byte only occur outside the
//! multiplexed part and are handed through as plain packet lines.
//!
//! The demuxer is pull-driven: it only reads the next frame from the
//! carrier after the sinks have accepted the previous one, so a slow
//! consumer naturally throttles the producer.

use std::io::Write;

use crate::error::WireError;
use crate::pkt::{Packet, PktReader, encode_data};

/// Channel byte for packfile data.
pub const BAND_PACK: u8 = 1;
/// Channel byte for progress text.
pub const BAND_PROGRESS: u8 = 2;
/// Channel byte for a fatal error.
pub const BAND_ERROR: u8 = 3;

/// Negotiated side-band flavor, which bounds the payload after the channel
/// byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideBandLimit {
    /// `side-band-64k`: 65519 bytes of payload per frame.
    Large,
    /// Legacy `side-band`: 999 bytes of payload per frame.
    Small,
}

impl SideBandLimit {
    /// Maximum payload bytes after the channel byte.
    #[must_use]
    pub const fn max_payload(self) -> usize {
        match self {
            Self::Large => 65519,
            Self::Small => 999,
        }
    }
}

/// Where demultiplexed frames go.
pub struct DemuxSinks<'a> {
    /// Receives channel-1 bytes.
    pub pack: &'a mut dyn Write,
    /// Receives channel-2 bytes.
    pub progress: &'a mut dyn Write,
}

/// Demultiplex data frames until the next flush (which is consumed).
///
/// Frames with no channel byte are returned as plain packet lines, in
/// order, alongside the count of packfile bytes forwarded.
///
/// # Errors
/// - Channel 3 content becomes [`WireError::Protocol`] with stage
///   `"receive-pack"`, terminating the session for every consumer.
/// - Sink write failures and carrier failures propagate.
pub fn demux<R: std::io::Read>(
    reader: &mut PktReader<R>,
    sinks: &mut DemuxSinks<'_>,
) -> Result<(Vec<Packet>, u64), WireError> {
    let mut lines = Vec::new();
    let mut pack_bytes = 0u64;
    loop {
        let packet = reader.expect_packet("side-band")?;
        match packet {
            Packet::Flush => return Ok((lines, pack_bytes)),
            Packet::Data(payload) => match payload.split_first() {
                Some((&BAND_PACK, rest)) => {
                    sinks.pack.write_all(rest)?;
                    pack_bytes += rest.len() as u64;
                }
                Some((&BAND_PROGRESS, rest)) => sinks.progress.write_all(rest)?,
                Some((&BAND_ERROR, rest)) => {
                    return Err(WireError::protocol(
                        "receive-pack",
                        String::from_utf8_lossy(rest).trim_end().to_owned(),
                    ));
                }
                _ => lines.push(Packet::Data(payload)),
            },
            other => lines.push(other),
        }
    }
}

/// Multiplex packfile bytes onto channel 1, closed by the goodbye frame.
///
/// The terminating goodbye (a single LF on channel 1) is appended iff any
/// packfile bytes were forwarded; the caller appends its own flush.
#[must_use]
pub fn mux_pack(pack: &[u8], limit: SideBandLimit) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for chunk in pack.chunks(limit.max_payload()) {
        let mut payload = Vec::with_capacity(1 + chunk.len());
        payload.push(BAND_PACK);
        payload.extend_from_slice(chunk);
        frames.push(encode_data(&payload));
    }
    if !pack.is_empty() {
        frames.push(encode_data(&[BAND_PACK, b'\n']));
    }
    frames
}

/// Multiplex one progress message onto channel 2.
#[must_use]
pub fn mux_progress(text: &str, limit: SideBandLimit) -> Vec<Vec<u8>> {
    text.as_bytes()
        .chunks(limit.max_payload())
        .map(|chunk| {
            let mut payload = Vec::with_capacity(1 + chunk.len());
            payload.push(BAND_PROGRESS);
            payload.extend_from_slice(chunk);
            encode_data(&payload)
        })
        .collect()
}
