//! Document-number sequences (movement numbers, lot numbers).
//!
//! Allocation contract:
//! - numbers are **monotonic** per prefix within one `SequenceService`
//! - numbers are **gap-tolerant**: a number handed out to an operation that
//!   later fails is never reused
//! - the service is explicitly constructed and shared (`Arc`), never global

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct SequenceService {
    counters: Mutex<HashMap<String, u64>>,
}

impl SequenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume numbering after restart: the next number for `prefix` will be
    /// `last + 1`. Never moves a counter backwards.
    pub fn resume_from(&self, prefix: impl Into<String>, last: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let entry = counters.entry(prefix.into()).or_insert(0);
        *entry = (*entry).max(last);
    }

    /// Allocate the next number for `prefix` (starting at 1).
    pub fn next(&self, prefix: &str) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let entry = counters.entry(prefix.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Allocate and format as `PREFIX-000042` (`width` zero-padded digits).
    pub fn next_formatted(&self, prefix: &str, width: usize) -> String {
        let n = self.next(prefix);
        format!("{prefix}-{n:0width$}")
    }
}
