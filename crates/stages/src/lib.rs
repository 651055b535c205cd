//! `vaultline-stages`
//!
//! **Responsibility:** the ordered processing stages a job passes through:
//! redact → summarize → embed → index.
//!
//! Stages are pure transforms over [`StageData`]; they never touch the queue
//! or the ledger. Anything that talks to an upstream model sits behind a trait
//! (`Summarizer`, `Embedder`, `IndexSink`) so callers can plug in real
//! backends while tests use the deterministic local ones shipped here.

pub mod artifact;
pub mod embed;
pub mod error;
pub mod index;
pub mod redact;
pub mod stage;
pub mod summarize;

pub use artifact::{
    ActionItem, Decision, Entity, Priority, Sentiment, SentimentLabel, Summary, SummaryMetadata,
    Topic,
};
pub use embed::{EmbedStage, Embedder, HashingEmbedder};
pub use error::StageError;
pub use index::{DirectoryIndex, IndexEntry, IndexSink, IndexStage, MemoryIndex};
pub use redact::{RedactStage, RedactionRule, Redactor};
pub use stage::{Stage, StageData, StageKind, StageSet};
pub use summarize::{ExtractiveSummarizer, SummarizeStage, Summarizer};
