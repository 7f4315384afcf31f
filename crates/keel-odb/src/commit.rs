//! Commit object parsing and serialization.
//!
//! A commit payload is a header block (`tree`, `parent`*, `author`,
//! `committer`, then anything else — `encoding`, `gpgsig`, …) terminated by
//! a blank line, followed by the raw message. Multi-line header values
//! continue on lines starting with a single space.
//!
//! Parsing keeps every header in its original order so that
//! parse-then-serialize reproduces the input byte for byte, signatures
//! included.

use std::fmt;
use std::str::FromStr;

use crate::error::OdbError;
use crate::oid::ObjectId;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// An author/committer/tagger line: `Name <email> timestamp zone`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Person name (may contain spaces).
    pub name: String,
    /// Email address, without the angle brackets.
    pub email: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Timezone offset exactly as written (e.g. `+0200`, `-0730`).
    pub zone: String,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> {} {}", self.name, self.email, self.timestamp, self.zone)
    }
}

impl FromStr for Envelope {
    type Err = OdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let open = s
            .find(" <")
            .ok_or_else(|| OdbError::corrupt("identity envelope", "missing ' <'"))?;
        let close = s[open..]
            .find("> ")
            .map(|i| open + i)
            .ok_or_else(|| OdbError::corrupt("identity envelope", "missing '> '"))?;
        let name = s[..open].to_owned();
        let email = s[open + 2..close].to_owned();
        let rest = &s[close + 2..];
        let (ts, zone) = rest
            .split_once(' ')
            .ok_or_else(|| OdbError::corrupt("identity envelope", "missing timezone"))?;
        let timestamp: i64 = ts
            .parse()
            .map_err(|_| OdbError::corrupt("identity envelope", "unparsable timestamp"))?;
        Ok(Self { name, email, timestamp, zone: zone.to_owned() })
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A parsed commit.
///
/// Headers are kept as an ordered list; the well-known ones have typed
/// accessors. The message is everything after the blank line, verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    headers: Vec<(String, String)>,
    /// Raw message, trailing newlines included.
    pub message: String,
}

impl Commit {
    /// Build a new commit with canonical header order.
    #[must_use]
    pub fn new(
        tree: ObjectId,
        parents: &[ObjectId],
        author: &Envelope,
        committer: &Envelope,
        message: impl Into<String>,
    ) -> Self {
        let mut headers = vec![("tree".to_owned(), tree.to_hex())];
        for parent in parents {
            headers.push(("parent".to_owned(), parent.to_hex()));
        }
        headers.push(("author".to_owned(), author.to_string()));
        headers.push(("committer".to_owned(), committer.to_string()));
        Self { headers, message: message.into() }
    }

    /// Parse a commit payload.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] on structural problems (no headers, non-UTF-8
    /// content, missing tree).
    pub fn parse(payload: &[u8]) -> Result<Self, OdbError> {
        let (headers, message) = parse_headers(payload, "commit")?;
        let commit = Self { headers, message };
        commit.tree()?; // a commit without a tree is not a commit
        Ok(commit)
    }

    /// Serialize back to payload bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        serialize_headers(&self.headers, &self.message)
    }

    /// The tree this commit snapshots.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] when the header is missing or unparsable.
    pub fn tree(&self) -> Result<ObjectId, OdbError> {
        let value = self
            .header("tree")
            .ok_or_else(|| OdbError::corrupt("commit", "missing tree header"))?;
        value
            .parse()
            .map_err(|_| OdbError::corrupt("commit", format!("bad tree oid {value:?}")))
    }

    /// Parent ids in order. Empty for a root commit; two or more for a
    /// merge.
    #[must_use]
    pub fn parents(&self) -> Vec<ObjectId> {
        self.headers
            .iter()
            .filter(|(k, _)| k == "parent")
            .filter_map(|(_, v)| v.parse().ok())
            .collect()
    }

    /// The author envelope.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] when missing or malformed.
    pub fn author(&self) -> Result<Envelope, OdbError> {
        self.header("author")
            .ok_or_else(|| OdbError::corrupt("commit", "missing author header"))?
            .parse()
    }

    /// The committer envelope.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] when missing or malformed.
    pub fn committer(&self) -> Result<Envelope, OdbError> {
        self.header("committer")
            .ok_or_else(|| OdbError::corrupt("commit", "missing committer header"))?
            .parse()
    }

    /// The GPG signature block, if present, with continuation indentation
    /// removed.
    #[must_use]
    pub fn gpgsig(&self) -> Option<&str> {
        self.header("gpgsig")
    }

    /// First value of an arbitrary header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Shared header-block codec (commits and tags)
// ---------------------------------------------------------------------------

pub(crate) fn parse_headers(
    payload: &[u8],
    what: &'static str,
) -> Result<(Vec<(String, String)>, String), OdbError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| OdbError::corrupt(what, "non-UTF-8 payload"))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut rest = text;
    loop {
        let Some((line, remainder)) = rest.split_once('\n') else {
            return Err(OdbError::corrupt(what, "unterminated header block"));
        };
        rest = remainder;
        if line.is_empty() {
            break;
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            let Some((_, value)) = headers.last_mut() else {
                return Err(OdbError::corrupt(what, "continuation before first header"));
            };
            value.push('\n');
            value.push_str(continuation);
        } else {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| OdbError::corrupt(what, format!("malformed header {line:?}")))?;
            headers.push((key.to_owned(), value.to_owned()));
        }
    }
    if headers.is_empty() {
        return Err(OdbError::corrupt(what, "no headers"));
    }
    Ok((headers, rest.to_owned()))
}

pub(crate) fn serialize_headers(headers: &[(String, String)], message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in headers {
        out.extend_from_slice(key.as_bytes());
        out.push(b' ');
        // Re-indent continuation lines.
        let mut lines = value.split('\n');
        if let Some(first) = lines.next() {
            out.extend_from_slice(first.as_bytes());
        }
        for line in lines {
            out.push(b'\n');
            out.push(b' ');
            out.extend_from_slice(line.as_bytes());
        }
        out.push(b'\n');
    }
    out.push(b'\n');
    out.extend_from_slice(message.as_bytes());
    out
}
