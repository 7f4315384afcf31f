//! Ref advertisement parsing, protocol v1 and v2.
//!
//! The discovery response (`info/refs?service=git-upload-pack`, or the
//! greeting on a bidirectional carrier) is a pkt-line stream. If its first
//! meaningful line is `version 2` we get key=value capabilities terminated
//! by a flush, then ref lines with `symref-target:`/`peeled:` attributes.
//! Otherwise it is v1: the first ref line smuggles the capability list
//! after a NUL, `HEAD`'s symbolic target comes from the `symref=`
//! capability or, failing that, from matching `HEAD`'s OID against a
//! branch.

use keel_odb::{HashKind, ObjectId};

use crate::error::WireError;
use crate::pkt::Packet;

/// One advertised ref.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefRecord {
    /// The ref's object id.
    pub oid: ObjectId,
    /// Full ref name (`HEAD`, `refs/heads/main`, …).
    pub name: String,
    /// Symbolic target, when advertised (`HEAD` → `refs/heads/main`).
    pub symref_target: Option<String>,
    /// Peeled target for annotated tags (`refs/tags/v1^{}`).
    pub peeled: Option<ObjectId>,
}

/// A parsed ref advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Protocol version the server answered with (1 or 2).
    pub protocol_version: u8,
    /// Capability strings exactly as advertised (v1 tokens or v2
    /// `key[=value]` lines).
    pub capabilities: Vec<String>,
    /// Advertised refs in server order.
    pub refs: Vec<RefRecord>,
    /// Hash function of the remote repository.
    pub object_format: HashKind,
    /// What `HEAD` points to, when determinable.
    pub head_target: Option<String>,
}

impl Advertisement {
    /// `true` if the server advertised a capability (v1 token or v2 key).
    #[must_use]
    pub fn supports(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == name || c.starts_with(name) && c[name.len()..].starts_with('='))
    }

    /// Look up an advertised ref by name.
    #[must_use]
    pub fn find_ref(&self, name: &str) -> Option<&RefRecord> {
        self.refs.iter().find(|r| r.name == name)
    }
}

/// Parse a discovery response.
///
/// # Errors
/// [`WireError::Protocol`] on malformed lines; [`WireError::Unsupported`]
/// on a version line other than 1 or 2.
pub fn parse(packets: &[Packet]) -> Result<Advertisement, WireError> {
    let mut rest = packets;

    // Smart-HTTP responses prefix `# service=git-upload-pack` + flush.
    if let Some(Packet::Data(d)) = rest.first()
        && d.starts_with(b"# service=")
    {
        rest = &rest[1..];
        if let Some(Packet::Flush) = rest.first() {
            rest = &rest[1..];
        }
    }

    match rest.first() {
        Some(packet @ Packet::Data(_)) if packet.text().as_deref() == Some("version 2") => {
            parse_v2(&rest[1..])
        }
        Some(packet @ Packet::Data(_))
            if packet.text().is_some_and(|t| t.starts_with("version ")) =>
        {
            Err(WireError::Unsupported {
                what: packet.text().unwrap_or_default(),
            })
        }
        Some(_) => parse_v1(rest),
        None => Err(WireError::protocol("discover", "empty advertisement")),
    }
}

fn parse_oid(hex: &str, stage: &'static str) -> Result<ObjectId, WireError> {
    hex.parse()
        .map_err(|_| WireError::protocol(stage, format!("bad oid {hex:?}")))
}

// ---------------------------------------------------------------------------
// Protocol v2
// ---------------------------------------------------------------------------

fn parse_v2(packets: &[Packet]) -> Result<Advertisement, WireError> {
    let mut capabilities = Vec::new();
    let mut refs = Vec::new();
    let mut object_format = HashKind::Sha1;

    let mut iter = packets.iter();
    // Capability lines up to the first flush.
    for packet in iter.by_ref() {
        match packet {
            Packet::Flush => break,
            Packet::Data(_) => {
                let line = packet.text().unwrap_or_default();
                if let Some(fmt) = line.strip_prefix("object-format=") {
                    object_format = HashKind::from_config_name(fmt).ok_or_else(|| {
                        WireError::Unsupported { what: format!("object format {fmt}") }
                    })?;
                }
                capabilities.push(line);
            }
            other => {
                return Err(WireError::protocol(
                    "discover",
                    format!("unexpected {other:?} in capability list"),
                ));
            }
        }
    }

    // Ref lines (the ls-refs section), if the stream carries them.
    for packet in iter {
        match packet {
            Packet::Flush => break,
            Packet::Data(_) => {
                let line = packet.text().unwrap_or_default();
                refs.push(parse_v2_ref_line(&line)?);
            }
            other => {
                return Err(WireError::protocol(
                    "discover",
                    format!("unexpected {other:?} in ref list"),
                ));
            }
        }
    }

    let head_target = refs
        .iter()
        .find(|r| r.name == "HEAD")
        .and_then(|r| r.symref_target.clone());

    Ok(Advertisement {
        protocol_version: 2,
        capabilities,
        refs,
        object_format,
        head_target,
    })
}

fn parse_v2_ref_line(line: &str) -> Result<RefRecord, WireError> {
    let mut parts = line.split(' ');
    let oid = parse_oid(
        parts.next().ok_or_else(|| WireError::protocol("discover", "empty ref line"))?,
        "discover",
    )?;
    let name = parts
        .next()
        .ok_or_else(|| WireError::protocol("discover", format!("ref line without name: {line:?}")))?
        .to_owned();
    let mut record = RefRecord { oid, name, symref_target: None, peeled: None };
    for attr in parts {
        if let Some(target) = attr.strip_prefix("symref-target:") {
            record.symref_target = Some(target.to_owned());
        } else if let Some(peeled) = attr.strip_prefix("peeled:") {
            record.peeled = Some(parse_oid(peeled, "discover")?);
        }
        // Unknown attributes are forward-compatible noise.
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Protocol v1
// ---------------------------------------------------------------------------

fn parse_v1(packets: &[Packet]) -> Result<Advertisement, WireError> {
    let mut capabilities: Vec<String> = Vec::new();
    let mut refs: Vec<RefRecord> = Vec::new();
    let mut object_format = HashKind::Sha1;
    let mut first_data = true;

    for packet in packets {
        let Packet::Data(payload) = packet else {
            continue;
        };
        let (ref_part, caps_part) = match payload.iter().position(|&b| b == 0) {
            Some(nul) => (&payload[..nul], Some(&payload[nul + 1..])),
            None => (&payload[..], None),
        };
        if first_data {
            let Some(caps) = caps_part else {
                return Err(WireError::protocol("discover", "first ref line lacks capabilities"));
            };
            let caps_text = String::from_utf8_lossy(caps);
            for token in caps_text.split_whitespace() {
                if let Some(fmt) = token.strip_prefix("object-format=") {
                    object_format = HashKind::from_config_name(fmt).ok_or_else(|| {
                        WireError::Unsupported { what: format!("object format {fmt}") }
                    })?;
                }
                capabilities.push(token.to_owned());
            }
            first_data = false;
        }

        let line = String::from_utf8_lossy(ref_part);
        let line = line.strip_suffix('\n').unwrap_or(&line);
        // "capabilities^{}" placeholder advertises an empty repository.
        if line.ends_with(" capabilities^{}") {
            continue;
        }
        let (oid_hex, name) = line
            .split_once(' ')
            .ok_or_else(|| WireError::protocol("discover", format!("bad ref line {line:?}")))?;
        let oid = parse_oid(oid_hex, "discover")?;

        if let Some(base) = name.strip_suffix("^{}") {
            if let Some(record) = refs.iter_mut().find(|r| r.name == base) {
                record.peeled = Some(oid);
            }
            continue;
        }
        refs.push(RefRecord { oid, name: name.to_owned(), symref_target: None, peeled: None });
    }

    // HEAD's target: prefer the symref capability, fall back to OID match.
    let mut head_target = capabilities.iter().find_map(|c| {
        c.strip_prefix("symref=HEAD:").map(str::to_owned)
    });
    if head_target.is_none()
        && let Some(head) = refs.iter().find(|r| r.name == "HEAD")
    {
        head_target = refs
            .iter()
            .find(|r| r.name.starts_with("refs/heads/") && r.oid == head.oid)
            .map(|r| r.name.clone());
    }
    if let Some(target) = &head_target
        && let Some(head) = refs.iter_mut().find(|r| r.name == "HEAD")
    {
        head.symref_target = Some(target.clone());
    }

    Ok(Advertisement {
        protocol_version: 1,
        capabilities,
        refs,
        object_format,
        head_target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::{Packet, decode_all, encode_text};

    fn data(s: &str) -> Packet {
        Packet::Data(format!("{s}\n").into_bytes())
    }

    #[test]
    fn v2_advertisement_parses() {
        let packets = vec![
            data("version 2"),
            data("agent=keel/0.4"),
            data("ls-refs"),
            data("fetch=shallow filter"),
            data("object-format=sha1"),
            Packet::Flush,
            data("af5626b4a114abcb82d63db7c8082c3c4756e51b HEAD symref-target:refs/heads/main"),
            data("af5626b4a114abcb82d63db7c8082c3c4756e51b refs/heads/main"),
            Packet::Flush,
        ];
        let advert = parse(&packets).unwrap();
        assert_eq!(advert.protocol_version, 2);
        assert_eq!(advert.object_format, HashKind::Sha1);
        assert_eq!(advert.head_target.as_deref(), Some("refs/heads/main"));
        assert!(advert.supports("ls-refs"));
        assert!(advert.supports("fetch"));
        assert_eq!(advert.refs.len(), 2);
    }

    #[test]
    fn v1_advertisement_parses_caps_and_peeled() {
        let head = "af5626b4a114abcb82d63db7c8082c3c4756e51b";
        let tag = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
        let first = format!(
            "{head} HEAD\0multi_ack side-band-64k symref=HEAD:refs/heads/main agent=git/2.44"
        );
        let packets = vec![
            Packet::Data(first.into_bytes()),
            data(&format!("{head} refs/heads/main")),
            data(&format!("{head} refs/tags/v1")),
            data(&format!("{tag} refs/tags/v1^{{}}")),
            Packet::Flush,
        ];
        let advert = parse(&packets).unwrap();
        assert_eq!(advert.protocol_version, 1);
        assert!(advert.supports("side-band-64k"));
        assert_eq!(advert.head_target.as_deref(), Some("refs/heads/main"));
        let v1_tag = advert.find_ref("refs/tags/v1").expect("tag ref");
        assert_eq!(v1_tag.peeled.map(|o| o.to_string()).as_deref(), Some(tag));
        let head_record = advert.find_ref("HEAD").expect("HEAD");
        assert_eq!(head_record.symref_target.as_deref(), Some("refs/heads/main"));
    }

    #[test]
    fn v1_head_target_inferred_from_matching_oid() {
        let head = "af5626b4a114abcb82d63db7c8082c3c4756e51b";
        let first = format!("{head} HEAD\0multi_ack");
        let packets = vec![
            Packet::Data(first.into_bytes()),
            data(&format!("{head} refs/heads/trunk")),
            Packet::Flush,
        ];
        let advert = parse(&packets).unwrap();
        assert_eq!(advert.head_target.as_deref(), Some("refs/heads/trunk"));
    }

    #[test]
    fn smart_http_service_banner_is_skipped() {
        let mut bytes = encode_text("# service=git-upload-pack");
        bytes.extend_from_slice(b"0000");
        bytes.extend(encode_text("version 2"));
        bytes.extend(encode_text("fetch"));
        bytes.extend_from_slice(b"0000");
        let packets = decode_all(&bytes).unwrap();
        let advert = parse(&packets).unwrap();
        assert_eq!(advert.protocol_version, 2);
    }

    #[test]
    fn sha256_object_format_is_recognized() {
        let packets = vec![
            data("version 2"),
            data("object-format=sha256"),
            Packet::Flush,
        ];
        let advert = parse(&packets).unwrap();
        assert_eq!(advert.object_format, HashKind::Sha256);
    }

    #[test]
    fn unknown_version_is_unsupported() {
        let packets = vec![data("version 3")];
        assert!(matches!(parse(&packets), Err(WireError::Unsupported { .. })));
    }
}
