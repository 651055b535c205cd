//! Resumable processing state: the progress store and the dedup ledger
//! built on top of it.

pub mod ledger;
pub mod store;

pub use ledger::{EntryMeta, Ledger, LedgerStats, Outcome};
pub use store::{FileProgressStore, InMemoryProgressStore, ProgressRecord, ProgressStore, ProgressStoreError};
