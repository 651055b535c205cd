//! Fixed-schema output artifact of the summarize stage.
//!
//! Downstream collaborators (embedding, indexing, training export) consume
//! this shape; embed and index pass it through unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::StageError;

pub const SUMMARY_SCHEMA_VERSION: &str = "1.0";
pub const MIN_SUMMARY_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub conversation_id: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
    pub sentiment: Sentiment,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    pub metadata: SummaryMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
    pub confidence: f64,
    #[serde(default)]
    pub mentions: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub overall: SentimentLabel,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub version: String,
    pub processed_at: DateTime<Utc>,
    pub message_count: usize,
    pub participant_count: usize,
    /// Content hash of the source record.
    pub hash: String,
    /// Upstream model that produced the summary.
    pub model: String,
}

impl Summary {
    /// Parse a raw model response and check it against the schema.
    pub fn from_json(value: JsonValue) -> Result<Self, StageError> {
        let summary: Summary = serde_json::from_value(value)?;
        summary.validate()?;
        Ok(summary)
    }

    /// Schema checks that serde's typing does not already enforce.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.conversation_id.trim().is_empty() {
            return Err(StageError::validation("summary.conversation_id is empty"));
        }
        if self.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
            return Err(StageError::validation(format!(
                "summary.summary shorter than {MIN_SUMMARY_CHARS} characters"
            )));
        }

        check_unit("sentiment.confidence", self.sentiment.confidence)?;
        for (i, topic) in self.topics.iter().enumerate() {
            non_empty(&format!("topics[{i}].topic"), &topic.topic)?;
            check_unit(&format!("topics[{i}].confidence"), topic.confidence)?;
        }
        for (i, entity) in self.entities.iter().enumerate() {
            non_empty(&format!("entities[{i}].name"), &entity.name)?;
            non_empty(&format!("entities[{i}].type"), &entity.kind)?;
            if let Some(c) = entity.confidence {
                check_unit(&format!("entities[{i}].confidence"), c)?;
            }
        }
        for (i, item) in self.action_items.iter().enumerate() {
            non_empty(&format!("action_items[{i}].action"), &item.action)?;
        }
        for (i, decision) in self.decisions.iter().enumerate() {
            non_empty(&format!("decisions[{i}].decision"), &decision.decision)?;
            if let Some(c) = decision.confidence {
                check_unit(&format!("decisions[{i}].confidence"), c)?;
            }
        }

        if self.metadata.version.trim().is_empty() {
            return Err(StageError::validation("metadata.version is empty"));
        }
        if self.metadata.participant_count == 0 {
            return Err(StageError::validation(
                "metadata.participant_count must be at least 1",
            ));
        }
        Ok(())
    }

    /// Text used for embedding: summary, tags and topics.
    pub fn embedding_text(&self) -> String {
        let mut text = self.summary.clone();
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        for topic in &self.topics {
            text.push(' ');
            text.push_str(&topic.topic);
        }
        text
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), StageError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(StageError::validation(format!(
            "{field} = {value} is outside [0, 1]"
        )))
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), StageError> {
    if value.trim().is_empty() {
        Err(StageError::validation(format!("{field} is empty")))
    } else {
        Ok(())
    }
}
