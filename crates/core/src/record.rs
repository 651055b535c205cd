//! Conversation records as delivered by the extraction collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::hash::ContentHash;

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Raw conversation record: `{id, title, messages, metadata}`.
///
/// Only `title` and the ordered `(role, content)` pairs identify a record for
/// deduplication; `id`, timestamps and metadata are carried along but never
/// hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_message(mut self, role: impl Into<String>, content: impl Into<String>) -> Self {
        self.messages.push(Message::new(role, content));
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Structural checks that no amount of retrying would fix.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::validation("record id must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(DomainError::validation(format!(
                "record {} has no messages",
                self.id
            )));
        }
        if let Some(idx) = self.messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(DomainError::validation(format!(
                "record {} message {} has an empty role",
                self.id, idx
            )));
        }
        Ok(())
    }

    /// Canonical content hash of this record.
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(self)
    }

    /// Number of distinct roles that spoke in the conversation.
    pub fn participant_count(&self) -> usize {
        let mut roles: Vec<&str> = self.messages.iter().map(|m| m.role.as_str()).collect();
        roles.sort_unstable();
        roles.dedup();
        roles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_without_messages_is_invalid() {
        let record = ConversationRecord::new("c-1", "Empty");
        assert!(matches!(record.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn record_with_blank_role_is_invalid() {
        let record = ConversationRecord::new("c-1", "Blank role")
            .with_message("user", "hello")
            .with_message("  ", "who said this?");
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("message 1"));
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let record: ConversationRecord = serde_json::from_str(
            r#"{"id":"c-9","messages":[{"role":"user","content":"hi","timestamp":"2024-05-01T10:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(record.title, "");
        assert!(record.metadata.is_null());
        assert!(record.messages[0].timestamp.is_some());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn participant_count_counts_distinct_roles() {
        let record = ConversationRecord::new("c-2", "t")
            .with_message("user", "a")
            .with_message("assistant", "b")
            .with_message("user", "c");
        assert_eq!(record.participant_count(), 2);
    }
}
