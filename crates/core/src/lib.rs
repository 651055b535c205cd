//! `vaultline-core`: domain building blocks for the ingestion pipeline.
//!
//! This crate contains **pure domain** primitives (no storage or runtime
//! concerns): conversation records, their canonical content hash, and the
//! identifiers shared by the queue and the workers.

pub mod error;
pub mod hash;
pub mod id;
pub mod record;

pub use error::{DomainError, DomainResult};
pub use hash::{ContentHash, canonical_bytes};
pub use id::{JobId, WorkerId};
pub use record::{ConversationRecord, Message};
