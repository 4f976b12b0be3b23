use std::time::Instant;

use ahash::AHashMap;
use thiserror::Error;

use crate::entry::Entry;

/// Non-fatal data quality problems found while matching.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    #[error("unknown entry: {0}")]
    UnknownEntry(Entry),
    #[error("Memory freed twice: {current} {previous}")]
    FreedTwice { current: Entry, previous: Entry },
}

/// An allocation with no matching free yet, tagged with its arrival order.
#[derive(Debug, Clone)]
pub struct Outstanding {
    pub seq: u64,
    pub entry: Entry,
}

/// Everything accumulated over one analysis session.
#[derive(Debug, Default)]
pub struct MatcherState {
    outstanding: AHashMap<String, Outstanding>,
    /// Frees whose allocation was never seen, keeping only the last one per address.
    prior_frees: AHashMap<String, Entry>,
    balance: i128,
    prior_freed_bytes: i128,
    prior_freed_count: u64,
    matched_pair_count: u64,
    matched_pair_bytes: i128,
    session_start: Option<Instant>,
    next_seq: u64,
}

impl MatcherState {
    pub fn outstanding(&self) -> impl Iterator<Item = &Outstanding> {
        self.outstanding.values()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    #[cfg(test)]
    pub fn is_outstanding(&self, address: &str) -> bool {
        self.outstanding.contains_key(address)
    }

    #[cfg(test)]
    pub fn prior_free(&self, address: &str) -> Option<&Entry> {
        self.prior_frees.get(address)
    }

    pub fn prior_free_addresses(&self) -> usize {
        self.prior_frees.len()
    }

    /// Bytes allocated minus bytes freed; negative means leak.
    pub fn balance(&self) -> i128 {
        self.balance
    }

    pub fn prior_freed_bytes(&self) -> i128 {
        self.prior_freed_bytes
    }

    pub fn prior_freed_count(&self) -> u64 {
        self.prior_freed_count
    }

    pub fn matched_pair_count(&self) -> u64 {
        self.matched_pair_count
    }

    pub fn matched_pair_bytes(&self) -> i128 {
        self.matched_pair_bytes
    }

    pub fn session_start(&self) -> Option<Instant> {
        self.session_start
    }
}

/// Pairs allocations with frees by address.
#[derive(Debug, Default)]
pub struct EntryMatcher {
    state: MatcherState,
}

impl EntryMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MatcherState {
        &self.state
    }

    /// Folds one entry into the session state.
    ///
    /// Anomalies never stop processing; they are handed back for the caller to report.
    /// An allocation at an address that is already outstanding replaces the old record
    /// without a diagnostic.
    pub fn process_entry(&mut self, entry: Entry) -> Option<Diagnostic> {
        let state = &mut self.state;
        state.session_start.get_or_insert_with(Instant::now);
        tracing::trace!(pid = ?entry.pid, tid = ?entry.tid, "{} {} {}", entry.method, entry.size, entry.address);

        // Sizes span all of u64, so the accumulators are wide enough to never overflow.
        let size = i128::from(entry.size);

        if !entry.known() {
            if entry.filled {
                return Some(Diagnostic::UnknownEntry(entry));
            }
            tracing::trace!("dropping malformed entry: {entry}");
            return None;
        }

        if entry.is_allocation() {
            state.balance -= size;
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .outstanding
                .insert(entry.address.clone(), Outstanding { seq, entry });
            return None;
        }

        if !entry.is_free() {
            return None;
        }

        if state.outstanding.remove(&entry.address).is_some() {
            state.balance += size;
            state.matched_pair_count += 1;
            state.matched_pair_bytes += size;
            return None;
        }

        state.prior_freed_bytes += size;
        state.prior_freed_count += 1;
        let previous = state
            .prior_frees
            .insert(entry.address.clone(), entry.clone());
        previous.map(|previous| Diagnostic::FreedTwice {
            current: entry,
            previous,
        })
    }
}
