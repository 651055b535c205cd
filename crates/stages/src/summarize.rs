//! Summarization stage.
//!
//! This is the only stage that spends upstream model budget. The model is
//! chosen by the runner (after the rate limiter granted it) and handed in via
//! [`StageData::model`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use vaultline_core::{ContentHash, ConversationRecord};

use crate::artifact::{
    ActionItem, Decision, Entity, Priority, SUMMARY_SCHEMA_VERSION, Sentiment, SentimentLabel,
    Summary, SummaryMetadata, Topic,
};
use crate::error::StageError;
use crate::stage::{Stage, StageData, StageKind};

/// Produces a [`Summary`] for a (redacted) record.
#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    async fn summarize(
        &self,
        model: &str,
        hash: &ContentHash,
        record: &ConversationRecord,
    ) -> Result<Summary, StageError>;
}

/// Runs the configured [`Summarizer`] and checks its output against the
/// summary schema.
#[derive(Clone)]
pub struct SummarizeStage {
    summarizer: Arc<dyn Summarizer>,
}

impl SummarizeStage {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self { summarizer }
    }
}

#[async_trait]
impl Stage for SummarizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Summarize
    }

    fn calls_model(&self) -> bool {
        true
    }

    async fn transform(&self, mut input: StageData) -> Result<StageData, StageError> {
        let model = input.model.as_deref().unwrap_or(ExtractiveSummarizer::MODEL);
        let summary = self
            .summarizer
            .summarize(model, &input.hash, &input.record)
            .await?;
        summary.validate()?;
        input.summary = Some(summary);
        Ok(input)
    }
}

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "been", "before", "being", "could", "does", "from", "have", "here",
    "into", "just", "like", "more", "most", "much", "need", "only", "other", "over", "please",
    "should", "some", "such", "than", "that", "their", "them", "then", "there", "these", "they",
    "this", "those", "very", "want", "what", "when", "where", "which", "while", "will", "with",
    "would", "your", "you're", "it's", "don't", "can't",
];

const POSITIVE: &[&str] = &[
    "good", "great", "thanks", "thank", "helpful", "perfect", "excellent", "works", "love",
    "nice", "awesome", "solved",
];

const NEGATIVE: &[&str] = &[
    "bad", "broken", "error", "fails", "failed", "failing", "wrong", "issue", "problem", "bug",
    "crash", "slow", "hate",
];

const ACTION_MARKERS: &[&str] = &["todo", "need to", "needs to", "should", "must", "follow up"];
const URGENT_MARKERS: &[&str] = &["urgent", "asap", "immediately"];
const DECISION_MARKERS: &[&str] = &["decided", "we will", "let's go with", "agreed", "going with"];

/// Deterministic local summarizer.
///
/// Keyword frequency for tags/topics, a small lexicon for sentiment and
/// marker phrases for action items and decisions. Used when no remote model
/// backend is wired in, and by the tests.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_tags: usize,
    max_topics: usize,
    max_summary_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_tags: 5,
            max_topics: 3,
            max_summary_chars: 280,
        }
    }
}

impl ExtractiveSummarizer {
    pub const MODEL: &'static str = "local-extractive";

    pub fn with_max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = max_tags;
        self
    }

    fn lead(&self, record: &ConversationRecord) -> String {
        let opener = record
            .messages
            .iter()
            .find(|m| m.role.eq_ignore_ascii_case("user"))
            .or_else(|| record.messages.first())
            .map(|m| first_sentence(&m.content))
            .unwrap_or_default();
        let title = if record.title.trim().is_empty() {
            "untitled"
        } else {
            record.title.trim()
        };
        let text = format!(
            "Conversation \"{title}\" ({} messages): {opener}",
            record.messages.len()
        );
        truncate_chars(&text, self.max_summary_chars)
    }

    fn keywords(record: &ConversationRecord) -> Vec<(String, u32)> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        let corpus = std::iter::once(record.title.as_str())
            .chain(record.messages.iter().map(|m| m.content.as_str()));
        for text in corpus {
            for word in words(text) {
                if word.len() >= 4
                    && !STOPWORDS.contains(&word.as_str())
                    && !word.starts_with('[')
                {
                    *counts.entry(word).or_default() += 1;
                }
            }
        }
        let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    fn sentiment(record: &ConversationRecord) -> Sentiment {
        let (mut pos, mut neg) = (0u32, 0u32);
        for message in &record.messages {
            for word in words(&message.content) {
                if POSITIVE.contains(&word.as_str()) {
                    pos += 1;
                } else if NEGATIVE.contains(&word.as_str()) {
                    neg += 1;
                }
            }
        }
        let total = pos + neg;
        if total == 0 {
            return Sentiment {
                overall: SentimentLabel::Neutral,
                confidence: 0.5,
            };
        }
        let dominant = pos.max(neg) as f64 / total as f64;
        let overall = if pos > 0 && neg > 0 && dominant < 0.7 {
            SentimentLabel::Mixed
        } else if pos >= neg {
            SentimentLabel::Positive
        } else {
            SentimentLabel::Negative
        };
        Sentiment {
            overall,
            confidence: (dominant * 100.0).round() / 100.0,
        }
    }

    fn entities(record: &ConversationRecord) -> Vec<Entity> {
        let mut seen = BTreeMap::new();
        for message in &record.messages {
            for sentence in sentences(&message.content) {
                for token in sentence.split_whitespace().skip(1) {
                    let token = token.trim_matches(|c: char| !c.is_alphanumeric());
                    let capitalized = token.chars().next().is_some_and(|c| c.is_uppercase())
                        && token.chars().any(|c| c.is_lowercase());
                    if capitalized && token.len() > 2 {
                        *seen.entry(token.to_string()).or_insert(0u32) += 1;
                    }
                }
            }
        }
        seen.into_iter()
            .take(10)
            .map(|(name, hits)| Entity {
                name,
                kind: "proper_noun".to_string(),
                confidence: Some(if hits > 1 { 0.8 } else { 0.5 }),
            })
            .collect()
    }

    fn action_items(record: &ConversationRecord) -> Vec<ActionItem> {
        let mut items = Vec::new();
        for message in &record.messages {
            for sentence in sentences(&message.content) {
                let lower = sentence.to_lowercase();
                if !ACTION_MARKERS.iter().any(|m| lower.contains(m)) {
                    continue;
                }
                let priority = if URGENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    Priority::Urgent
                } else {
                    Priority::Medium
                };
                items.push(ActionItem {
                    action: sentence.to_string(),
                    assignee: None,
                    priority: Some(priority),
                    deadline: None,
                });
            }
        }
        items
    }

    fn decisions(record: &ConversationRecord) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for message in &record.messages {
            for sentence in sentences(&message.content) {
                let lower = sentence.to_lowercase();
                if DECISION_MARKERS.iter().any(|m| lower.contains(m)) {
                    decisions.push(Decision {
                        decision: sentence.to_string(),
                        context: None,
                        participants: vec![message.role.clone()],
                        confidence: Some(0.6),
                    });
                }
            }
        }
        decisions
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        model: &str,
        hash: &ContentHash,
        record: &ConversationRecord,
    ) -> Result<Summary, StageError> {
        let keywords = Self::keywords(record);
        let top = keywords.first().map(|(_, n)| *n).unwrap_or(1).max(1);

        let tags = keywords
            .iter()
            .take(self.max_tags)
            .map(|(w, _)| w.clone())
            .collect();
        let topics = keywords
            .iter()
            .take(self.max_topics)
            .map(|(w, n)| Topic {
                topic: w.clone(),
                confidence: (*n as f64 / top as f64 * 100.0).round() / 100.0,
                mentions: *n,
            })
            .collect();

        Ok(Summary {
            conversation_id: record.id.clone(),
            summary: self.lead(record),
            tags,
            topics,
            sentiment: Self::sentiment(record),
            entities: Self::entities(record),
            action_items: Self::action_items(record),
            decisions: Self::decisions(record),
            metadata: SummaryMetadata {
                version: SUMMARY_SCHEMA_VERSION.to_string(),
                processed_at: Utc::now(),
                message_count: record.messages.len(),
                participant_count: record.participant_count().max(1),
                hash: hash.to_string(),
                model: model.to_string(),
            },
        })
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '[' || c == ']'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn first_sentence(text: &str) -> String {
    sentences(text).next().unwrap_or_default().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
