//! The local metadata log replica.
//!
//! Holds the contiguous prefix of committed entries this node has applied,
//! plus a buffer of entries received out of order (a push that arrived before
//! the epochs preceding it). The buffer never feeds the state machine until
//! the gap in front of it is filled by the fetch protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use meridian_core::transform::Transformation;
use meridian_core::Epoch;

/// One committed transformation at its assigned epoch.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub epoch: Epoch,
    pub transform: Transformation,
}

/// Contiguous applied log plus pending out-of-order entries.
#[derive(Debug, Default)]
pub struct LocalLog {
    /// Applied entries, keyed by epoch. Contiguous from [`Epoch::FIRST`].
    entries: BTreeMap<Epoch, LogEntry>,
    /// Received but not yet applicable: every key here is beyond
    /// `applied.next()`.
    pending: BTreeMap<Epoch, LogEntry>,
    applied: Epoch,
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguously applied epoch.
    pub fn applied(&self) -> Epoch {
        self.applied
    }

    /// Record a locally committed entry. The commit path assigns epochs
    /// sequentially, so the entry is always the immediate successor.
    pub fn append_committed(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.epoch, self.applied.next());
        self.applied = entry.epoch;
        self.entries.insert(entry.epoch, entry);
    }

    /// Accept an entry received from a peer. Stale duplicates are dropped;
    /// anything beyond the applied prefix is buffered until it becomes
    /// applicable.
    pub fn insert(&mut self, entry: LogEntry) {
        if entry.epoch <= self.applied {
            debug!(epoch = %entry.epoch, "dropping already-applied log entry");
            return;
        }
        self.pending.insert(entry.epoch, entry);
    }

    /// The next buffered entry, if it directly extends the applied prefix.
    pub fn next_ready(&self) -> Option<&LogEntry> {
        self.pending.get(&self.applied.next())
    }

    /// Move a ready entry into the applied prefix. Called only after the
    /// state machine applied it successfully.
    pub fn mark_applied(&mut self, epoch: Epoch) {
        debug_assert_eq!(epoch, self.applied.next());
        if let Some(entry) = self.pending.remove(&epoch) {
            self.entries.insert(epoch, entry);
        }
        self.applied = epoch;
    }

    /// True when buffered entries exist that cannot be applied yet — the
    /// signal that a catch-up fetch is needed.
    pub fn has_gap(&self) -> bool {
        !self.pending.is_empty() && self.next_ready().is_none()
    }

    /// All applied entries after `since`, in epoch order. This is what a
    /// fetch responder serves to a lagging peer.
    pub fn entries_since(&self, since: Epoch) -> Vec<LogEntry> {
        self.entries
            .range(since.next()..)
            .map(|(_, e)| e.clone())
            .collect()
    }
}
