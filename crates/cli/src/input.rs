//! JSONL conversation input, parsed lazily as the runner pulls records.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use tracing::{error, warn};

use vaultline_core::ConversationRecord;

/// One conversation per non-blank line of `path`, or stdin for `-`.
pub fn read_records(path: &Path) -> Result<Records> {
    if path == Path::new("-") {
        Ok(Records::new(Box::new(io::stdin().lock()), "<stdin>"))
    } else {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Records::new(
            Box::new(BufReader::new(file)),
            &path.display().to_string(),
        ))
    }
}

/// Iterator over the records of a JSONL stream.
///
/// A line that does not parse is logged and skipped; a read error ends the
/// stream. Only the current line is held in memory.
pub struct Records {
    lines: Lines<Box<dyn BufRead>>,
    source: String,
    line_no: usize,
    malformed: Arc<AtomicUsize>,
}

impl Records {
    pub fn new(reader: Box<dyn BufRead>, source: &str) -> Self {
        Self {
            lines: reader.lines(),
            source: source.to_string(),
            line_no: 0,
            malformed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count of skipped lines, readable after the iterator has been consumed.
    pub fn malformed(&self) -> Arc<AtomicUsize> {
        self.malformed.clone()
    }
}

impl Iterator for Records {
    type Item = ConversationRecord;

    fn next(&mut self) -> Option<ConversationRecord> {
        loop {
            self.line_no += 1;
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    error!(source = %self.source, line = self.line_no, error = %e, "input read failed; stopping");
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => return Some(record),
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %self.source, line = self.line_no, error = %e, "skipping malformed record");
                }
            }
        }
    }
}
