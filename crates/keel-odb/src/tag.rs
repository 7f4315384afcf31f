//! Annotated tag object parsing and serialization.
//!
//! Same header-block shape as commits: `object`, `type`, `tag`, `tagger`,
//! blank line, message. A detached signature, when present, simply trails
//! the message and rides along verbatim.

use crate::commit::{Envelope, parse_headers, serialize_headers};
use crate::error::OdbError;
use crate::object::ObjectKind;
use crate::oid::ObjectId;

/// A parsed annotated tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    headers: Vec<(String, String)>,
    /// Raw message (plus trailing signature block, if any).
    pub message: String,
}

impl Tag {
    /// Build a new tag with canonical header order.
    #[must_use]
    pub fn new(
        target: ObjectId,
        target_kind: ObjectKind,
        name: &str,
        tagger: &Envelope,
        message: impl Into<String>,
    ) -> Self {
        let headers = vec![
            ("object".to_owned(), target.to_hex()),
            ("type".to_owned(), target_kind.as_str().to_owned()),
            ("tag".to_owned(), name.to_owned()),
            ("tagger".to_owned(), tagger.to_string()),
        ];
        Self { headers, message: message.into() }
    }

    /// Parse a tag payload.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] on structural problems.
    pub fn parse(payload: &[u8]) -> Result<Self, OdbError> {
        let (headers, message) = parse_headers(payload, "tag")?;
        let tag = Self { headers, message };
        tag.target()?;
        tag.target_kind()?;
        Ok(tag)
    }

    /// Serialize back to payload bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        serialize_headers(&self.headers, &self.message)
    }

    /// The tagged object.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] when the `object` header is missing or bad.
    pub fn target(&self) -> Result<ObjectId, OdbError> {
        let value = self
            .header("object")
            .ok_or_else(|| OdbError::corrupt("tag", "missing object header"))?;
        value
            .parse()
            .map_err(|_| OdbError::corrupt("tag", format!("bad object oid {value:?}")))
    }

    /// Declared type of the tagged object.
    ///
    /// # Errors
    /// [`OdbError::Corrupt`] when missing or unknown.
    pub fn target_kind(&self) -> Result<ObjectKind, OdbError> {
        let value = self
            .header("type")
            .ok_or_else(|| OdbError::corrupt("tag", "missing type header"))?;
        ObjectKind::from_name(value.as_bytes())
            .ok_or_else(|| OdbError::corrupt("tag", format!("unknown target type {value:?}")))
    }

    /// The tag name (`v1.0.0`, not `refs/tags/v1.0.0`).
    #[must_use]
    pub fn name(&self) -> &str {
        self.header("tag").unwrap_or_default()
    }

    /// The tagger envelope, when present (some historic tags omit it).
    #[must_use]
    pub fn tagger(&self) -> Option<Envelope> {
        self.header("tagger").and_then(|v| v.parse().ok())
    }

    fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::HashKind;

    const SAMPLE: &str = "object 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
         type tree\n\
         tag empty-root\n\
         tagger Rel Eng <rel@example.com> 1700000000 +0000\n\
         \n\
         The empty tree, tagged.\n";

    #[test]
    fn parse_fields() {
        let tag = Tag::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(tag.target().unwrap(), HashKind::Sha1.empty_tree());
        assert_eq!(tag.target_kind().unwrap(), ObjectKind::Tree);
        assert_eq!(tag.name(), "empty-root");
        assert_eq!(tag.tagger().expect("tagger").email, "rel@example.com");
    }

    #[test]
    fn roundtrip_is_byte_exact() {
        let tag = Tag::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(tag.serialize(), SAMPLE.as_bytes());
    }

    #[test]
    fn builder_roundtrips() {
        let tagger = Envelope {
            name: "R".into(),
            email: "r@x".into(),
            timestamp: 5,
            zone: "+0000".into(),
        };
        let tag = Tag::new(
            HashKind::Sha1.empty_tree(),
            ObjectKind::Tree,
            "v0",
            &tagger,
            "msg\n",
        );
        assert_eq!(Tag::parse(&tag.serialize()).unwrap(), tag);
    }

    #[test]
    fn missing_object_header_is_corrupt() {
        let bad = "type commit\ntag x\n\nmsg\n";
        assert!(Tag::parse(bad.as_bytes()).is_err());
    }
}
