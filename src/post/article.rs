//! Article model: header, payload and segment identity
//!
//! An article is one posted unit. The payload is held as cheap-to-clone
//! `Bytes` chunks so a retried article is re-sent without copying, and a
//! re-minted article shares its payload with the original.

use bytes::Bytes;

/// Length of the per-run nonce embedded in every message-id.
pub const NONCE_LENGTH: usize = 16;

/// Stable identity of a logical piece: `(file index, piece index)`.
///
/// The key survives message-id re-mints; it is recoverable from any
/// message-id this crate generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentKey {
    pub file_index: u32,
    pub piece_index: u32,
}

impl SegmentKey {
    pub fn new(file_index: u32, piece_index: u32) -> Self {
        Self {
            file_index,
            piece_index,
        }
    }

    /// Mint the message-id `<{nonce}.{file}.{piece}@{domain}>`.
    pub fn message_id(&self, nonce: &str, domain: &str) -> String {
        format!(
            "<{}.{}.{}@{}>",
            nonce, self.file_index, self.piece_index, domain
        )
    }

    /// Recover the key from a message-id of the form this crate mints.
    ///
    /// The two dotted integers between the first `<` and the `@` are the
    /// file and piece indices; the nonce itself never contains a dot.
    pub fn from_message_id(message_id: &str) -> Option<Self> {
        let local = message_id.strip_prefix('<')?.split('@').next()?;
        let mut parts = local.rsplitn(3, '.');
        let piece_index = parts.next()?.parse().ok()?;
        let file_index = parts.next()?.parse().ok()?;
        parts.next()?;
        Some(Self {
            file_index,
            piece_index,
        })
    }
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.file_index, self.piece_index)
    }
}

/// RFC 5536-style header block of one article.
#[derive(Debug, Clone)]
pub struct ArticleHeader {
    pub from: String,
    pub subject: String,
    pub message_id: String,
    pub newsgroups: Vec<String>,
    pub extra: Vec<(String, String)>,
}

impl ArticleHeader {
    /// Serialize the header block, one CRLF-terminated line per field.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"From: ");
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(b"\r\nNewsgroups: ");
        out.extend_from_slice(self.newsgroups.join(",").as_bytes());
        out.extend_from_slice(b"\r\nSubject: ");
        out.extend_from_slice(self.subject.as_bytes());
        out.extend_from_slice(b"\r\nMessage-ID: ");
        out.extend_from_slice(self.message_id.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (field, value) in &self.extra {
            out.extend_from_slice(field.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// One posted unit: a header and an ordered list of payload chunks.
#[derive(Debug, Clone)]
pub struct Article {
    header: ArticleHeader,
    payload: Vec<Bytes>,
}

impl Article {
    pub fn new(header: ArticleHeader) -> Self {
        Self {
            header,
            payload: Vec::new(),
        }
    }

    pub fn push_payload(&mut self, chunk: Bytes) {
        self.payload.push(chunk);
    }

    pub fn header(&self) -> &ArticleHeader {
        &self.header
    }

    pub fn payload(&self) -> &[Bytes] {
        &self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.iter().map(|c| c.len()).sum()
    }

    pub fn message_id(&self) -> &str {
        &self.header.message_id
    }

    pub fn subject(&self) -> &str {
        &self.header.subject
    }

    pub fn segment_key(&self) -> Option<SegmentKey> {
        SegmentKey::from_message_id(&self.header.message_id)
    }

    /// Copy of this article carrying a fresh message-id; the payload
    /// chunks are shared, not duplicated.
    pub fn with_message_id(&self, message_id: String) -> Self {
        let mut header = self.header.clone();
        header.message_id = message_id;
        Self {
            header,
            payload: self.payload.clone(),
        }
    }
}
