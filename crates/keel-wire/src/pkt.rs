//! pkt-line framing.
//!
//! Every frame is a 4-hex-digit length (including the 4 header bytes)
//! followed by the payload, except the three sentinels: `0000` flush,
//! `0001` delim, `0002` response-end.
//!
//! [`PktReader`] is a typed cursor over the carrier byte stream: it pulls
//! one frame at a time and offers a single-slot [`unread`](PktReader::unread)
//! so a parser that looked one frame too far can hand it back.

use std::io::Read;

use crate::error::WireError;

/// Largest frame length value on the wire (`0xfff0` per the protocol).
pub const MAX_PKT_LEN: usize = 65520;
/// Largest data payload a frame can carry.
pub const MAX_PKT_PAYLOAD: usize = MAX_PKT_LEN - 4;

/// One pkt-line frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// `0000` — section/stream terminator.
    Flush,
    /// `0001` — section separator (protocol v2).
    Delim,
    /// `0002` — response end (protocol v2 stateless carriers).
    ResponseEnd,
    /// A data frame.
    Data(Vec<u8>),
}

impl Packet {
    /// The payload of a data frame, `None` for sentinels.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Payload interpreted as text with one trailing newline stripped —
    /// the shape ref advertisements and negotiation lines come in.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let data = self.data()?;
        let text = String::from_utf8_lossy(data);
        Some(text.strip_suffix('\n').unwrap_or(&text).to_owned())
    }
}

/// Frame a data payload.
///
/// # Panics
/// Panics if the payload exceeds [`MAX_PKT_PAYLOAD`]; callers chunk first.
#[must_use]
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_PKT_PAYLOAD, "pkt-line payload too large");
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Frame a text line, appending the conventional trailing newline.
#[must_use]
pub fn encode_text(line: &str) -> Vec<u8> {
    let mut payload = line.as_bytes().to_vec();
    payload.push(b'\n');
    encode_data(&payload)
}

/// Serialize any packet.
#[must_use]
pub fn encode(packet: &Packet) -> Vec<u8> {
    match packet {
        Packet::Flush => b"0000".to_vec(),
        Packet::Delim => b"0001".to_vec(),
        Packet::ResponseEnd => b"0002".to_vec(),
        Packet::Data(d) => encode_data(d),
    }
}

/// Pull-based frame reader with single-slot rollback.
#[derive(Debug)]
pub struct PktReader<R> {
    inner: R,
    rollback: Option<Packet>,
}

impl<R: Read> PktReader<R> {
    /// Wrap a carrier stream.
    pub const fn new(inner: R) -> Self {
        Self { inner, rollback: None }
    }

    /// Push one frame back; the next [`read_packet`](Self::read_packet)
    /// returns it. At most one frame can be outstanding.
    ///
    /// # Panics
    /// Panics if a frame is already pushed back — that is a parser bug, not
    /// a runtime condition.
    pub fn unread(&mut self, packet: Packet) {
        assert!(self.rollback.is_none(), "pkt-line rollback slot already occupied");
        self.rollback = Some(packet);
    }

    /// Read the next frame. `Ok(None)` at clean end of stream.
    ///
    /// # Errors
    /// [`WireError::Protocol`] on a malformed length or a truncated frame.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, WireError> {
        if let Some(packet) = self.rollback.take() {
            return Ok(Some(packet));
        }

        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.inner, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|_| WireError::protocol("pkt-line", "non-ASCII length"))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| WireError::protocol("pkt-line", format!("bad length {len_str:?}")))?;

        match len {
            0 => Ok(Some(Packet::Flush)),
            1 => Ok(Some(Packet::Delim)),
            2 => Ok(Some(Packet::ResponseEnd)),
            3 => Err(WireError::protocol("pkt-line", "reserved length 0003")),
            _ if len > MAX_PKT_LEN => {
                Err(WireError::protocol("pkt-line", format!("length {len} exceeds maximum")))
            }
            _ => {
                let mut payload = vec![0u8; len - 4];
                self.inner
                    .read_exact(&mut payload)
                    .map_err(|e| WireError::protocol("pkt-line", format!("truncated frame: {e}")))?;
                Ok(Some(Packet::Data(payload)))
            }
        }
    }

    /// Read the next frame, treating end-of-stream as a protocol error.
    ///
    /// # Errors
    /// As [`read_packet`](Self::read_packet), plus on EOF.
    pub fn expect_packet(&mut self, stage: &'static str) -> Result<Packet, WireError> {
        self.read_packet()?
            .ok_or_else(|| WireError::protocol(stage, "unexpected end of stream"))
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Read exactly `buf.len()` bytes, or detect a clean EOF before the first
/// byte. A partial header is a protocol error.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(WireError::protocol("pkt-line", "truncated length header"));
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Decode every frame of a complete buffer.
///
/// # Errors
/// As [`PktReader::read_packet`].
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Packet>, WireError> {
    let mut reader = PktReader::new(&mut buf);
    let mut out = Vec::new();
    while let Some(packet) = reader.read_packet()? {
        out.push(packet);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_known_payload() {
        assert_eq!(encode_data(b"hi\n"), b"0007hi\n");
    }

    #[test]
    fn flush_decodes_alone() {
        let packets = decode_all(b"0000").unwrap();
        assert_eq!(packets, vec![Packet::Flush]);
    }

    #[test]
    fn sentinels_decode() {
        let packets = decode_all(b"000000010002").unwrap();
        assert_eq!(packets, vec![Packet::Flush, Packet::Delim, Packet::ResponseEnd]);
    }

    #[test]
    fn data_roundtrip() {
        let bytes = encode_data(b"want abc\n");
        let packets = decode_all(&bytes).unwrap();
        assert_eq!(packets[0].data(), Some(&b"want abc\n"[..]));
    }

    #[test]
    fn reserved_length_three_is_an_error() {
        assert!(decode_all(b"0003").is_err());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        assert!(decode_all(b"0008hi").is_err());
    }

    #[test]
    fn rollback_returns_the_same_packet() {
        let bytes = [encode_data(b"one\n"), encode_data(b"two\n")].concat();
        let mut cursor = &bytes[..];
        let mut reader = PktReader::new(&mut cursor);
        let first = reader.read_packet().unwrap().expect("frame");
        reader.unread(first.clone());
        assert_eq!(reader.read_packet().unwrap(), Some(first));
        let second = reader.read_packet().unwrap().expect("frame");
        assert_eq!(second.text().as_deref(), Some("two"));
    }

    #[test]
    fn text_strips_one_newline() {
        let packet = Packet::Data(b"version 2\n".to_vec());
        assert_eq!(packet.text().as_deref(), Some("version 2"));
    }

    proptest::proptest! {
        #[test]
        fn any_payload_roundtrips(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096)) {
            let bytes = encode_data(&payload);
            let packets = decode_all(&bytes).unwrap();
            proptest::prop_assert_eq!(packets[0].data(), Some(&payload[..]));
        }
    }
}
