//! The in-memory log: an entry ring anchored by the latest snapshot.
//!
//! Entries are shared as `Arc`s with in-flight I/O (outbound sends, durable writes).
//! Truncation is refused while any entry in the truncated range is still referenced
//! outside the log, which keeps buffer reclamation ordered after outstanding I/O.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::RaftError;
use crate::membership::Configuration;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::LogId;

pub(crate) struct RaftLog<D: AppData> {
    /// In-memory entries, contiguous starting at `first_index`.
    entries: VecDeque<Arc<Entry<D>>>,
    /// The index of the first in-memory entry.
    first_index: u64,
    /// The identity of the last entry covered by the latest snapshot.
    snapshot_last: LogId,
}

impl<D: AppData> RaftLog<D> {
    /// Create an empty log anchored at the given snapshot identity (zero for a pristine node).
    pub fn new(snapshot_last: LogId) -> Self {
        RaftLog {
            entries: VecDeque::new(),
            first_index: snapshot_last.index + 1,
            snapshot_last,
        }
    }

    /// The index of the last entry, or of the snapshot anchor when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    /// The term of the last entry, falling back to the snapshot anchor.
    pub fn last_term(&self) -> u64 {
        match self.entries.back() {
            Some(entry) => entry.log_id.term,
            None => self.snapshot_last.term,
        }
    }

    /// The last index covered by the latest snapshot, 0 when none was taken.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_last.index
    }

    /// The identity of the snapshot anchor.
    pub fn snapshot_last(&self) -> LogId {
        self.snapshot_last
    }

    /// The number of in-memory entries.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// The index of the first in-memory entry.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    fn slot(&self, index: u64) -> Option<&Arc<Entry<D>>> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Get the entry at the given index, if still in memory.
    pub fn get(&self, index: u64) -> Option<Arc<Entry<D>>> {
        self.slot(index).cloned()
    }

    /// The term of the entry at the given index, or of the snapshot anchor; 0 when unknown.
    pub fn term_of(&self, index: u64) -> u64 {
        if index == self.snapshot_last.index {
            return self.snapshot_last.term;
        }
        self.slot(index).map(|e| e.log_id.term).unwrap_or(0)
    }

    /// Append a single entry with the given term and payload, returning its index.
    pub fn append(&mut self, term: u64, payload: EntryPayload<D>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push_back(Arc::new(Entry {
            log_id: LogId { term, index },
            payload,
        }));
        index
    }

    /// Append a configuration change entry, returning its index.
    pub fn append_configuration(&mut self, term: u64, conf: Configuration) -> u64 {
        self.append(term, EntryPayload::config_change(conf))
    }

    /// Append entries received from a leader as-is.
    pub fn append_entry(&mut self, entry: Entry<D>) {
        debug_assert_eq!(entry.log_id.index, self.last_index() + 1);
        self.entries.push_back(Arc::new(entry));
    }

    /// Acquire shared references to the entries in `[from, to]`.
    ///
    /// The returned `Arc`s keep the corresponding slots referenced until dropped, which
    /// defers truncation of the range.
    pub fn acquire(&self, from: u64, to: u64) -> Vec<Arc<Entry<D>>> {
        if from > to {
            return Vec::new();
        }
        let mut out = Vec::with_capacity((to - from + 1) as usize);
        for index in from..=to {
            match self.slot(index) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
        }
        out
    }

    /// Check whether the entry at the given index is referenced by in-flight I/O.
    pub fn is_referenced(&self, index: u64) -> bool {
        self.slot(index).map(|entry| Arc::strong_count(entry) > 1).unwrap_or(false)
    }

    /// Delete all entries from the given index on.
    ///
    /// Refused with `LogBusy` while any entry in `[from, last_index]` is referenced by
    /// in-flight I/O.
    pub fn truncate(&mut self, from: u64) -> Result<(), RaftError> {
        if from > self.last_index() {
            return Ok(());
        }
        for index in from..=self.last_index() {
            if self.is_referenced(index) {
                return Err(RaftError::LogBusy);
            }
        }
        self.discard(from);
        Ok(())
    }

    /// Delete all entries from the given index on without checking references.
    ///
    /// Used to roll back entries that were appended in memory but never handed to I/O.
    pub fn discard(&mut self, from: u64) {
        let from = from.max(self.first_index);
        if from > self.last_index() {
            return;
        }
        self.entries.truncate((from - self.first_index) as usize);
    }

    /// Record a snapshot at `index`, dropping entries below the trailing window.
    ///
    /// Entries before `max(first_index, index.saturating_sub(trailing))` are released;
    /// the anchor moves to `{index, term_of(index)}`.
    pub fn snapshot(&mut self, index: u64, trailing: u64) {
        debug_assert!(index <= self.last_index());
        let term = self.term_of(index);
        debug_assert!(term != 0 || index == self.snapshot_last.index);

        let new_first = std::cmp::max(self.first_index, index.saturating_sub(trailing) + 1);
        while self.first_index < new_first {
            self.entries.pop_front();
            self.first_index += 1;
        }
        if index > self.snapshot_last.index {
            self.snapshot_last = LogId { term, index };
        }
    }

    /// Replace the whole log with a snapshot anchor, as part of a snapshot installation.
    pub fn restore(&mut self, last_index: u64, last_term: u64) {
        self.entries.clear();
        self.first_index = last_index + 1;
        self.snapshot_last = LogId {
            term: last_term,
            index: last_index,
        };
    }
}
