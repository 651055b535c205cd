//! Content addressing for conversation records.
//!
//! The hash is SHA-256 over a canonical byte form of the record's identifying
//! fields: the title followed by the ordered `(role, content)` pairs. The
//! canonical form is independent of how the record was serialized upstream:
//!
//! - line endings are normalized to `\n`
//! - trailing whitespace on every line is dropped
//! - leading/trailing whitespace of each field is trimmed
//! - roles are lowercased
//! - every field is length-prefixed, so field boundaries cannot be forged by
//!   content
//!
//! Ids, timestamps and metadata are deliberately excluded.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DomainError;
use crate::record::ConversationRecord;

const CANONICAL_HEADER: &[u8] = b"vaultline.canonical.v1\n";

/// Lowercase hex SHA-256 digest of a record's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a record through [`canonical_bytes`].
    pub fn of(record: &ConversationRecord) -> Self {
        let digest = Sha256::digest(canonical_bytes(record));
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DomainError::invalid_hash(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

/// Canonical, order-preserving byte form of a record's identifying fields.
pub fn canonical_bytes(record: &ConversationRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(CANONICAL_HEADER.len() + 64 * (record.messages.len() + 1));
    out.extend_from_slice(CANONICAL_HEADER);

    push_field(&mut out, b't', &normalize_text(&record.title));
    push_field(&mut out, b'n', &record.messages.len().to_string());
    for message in &record.messages {
        push_field(&mut out, b'r', &message.role.trim().to_lowercase());
        push_field(&mut out, b'c', &normalize_text(&message.content));
    }
    out
}

fn push_field(out: &mut Vec<u8>, tag: u8, value: &str) {
    out.push(tag);
    out.push(b':');
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    lines.join("\n").trim().to_string()
}
