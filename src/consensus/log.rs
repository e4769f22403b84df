//! Replicated log with idempotency-key deduplication
//!
//! Indices are 1-based. Applied entries are periodically folded into a
//! snapshot: only `(snapshot_index, snapshot_term)` is kept for them, and the
//! retained entries start at `snapshot_index + 1`. Index 0 is the empty
//! snapshot with term 0.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::governance::GovernanceOp;
use crate::types::RecoveryAction;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EntryPayload {
    /// Appended by a new leader so entries from earlier terms can commit
    Noop,
    Action(RecoveryAction),
    Governance(GovernanceOp),
}

impl EntryPayload {
    /// Idempotency key a submitted payload is deduplicated by. Noops have none.
    pub fn key(&self) -> Option<Uuid> {
        match self {
            EntryPayload::Noop => None,
            EntryPayload::Action(a) => Some(a.id),
            EntryPayload::Governance(op) => Some(op.key()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    /// Idempotency key; the action id for `Action` payloads
    pub key: Uuid,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn action(&self) -> Option<&RecoveryAction> {
        match &self.payload {
            EntryPayload::Action(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    snapshot_index: u64,
    snapshot_term: u64,
    entries: Vec<LogEntry>,
    commit_index: u64,
    /// Positions of retained entries only
    keys: HashMap<Uuid, u64>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot point and the entries after it.
    /// Entries are trusted to be contiguous from `snapshot_index + 1`.
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>, commit_index: u64) -> Self {
        let keys = entries.iter().map(|e| (e.key, e.index)).collect();
        let last_index = snapshot_index + entries.len() as u64;
        Self {
            snapshot_index,
            snapshot_term,
            entries,
            commit_index: commit_index.clamp(snapshot_index, last_index),
            keys,
        }
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Term at `index`; `None` past the end or inside the snapshot.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Entries retained after the snapshot
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Retained entries from `index` (inclusive) to the end.
    pub fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(self.snapshot_index + 1) - self.snapshot_index - 1;
        self.entries
            .get(start as usize..)
            .map(<[LogEntry]>::to_vec)
            .unwrap_or_default()
    }

    pub fn position_of(&self, key: &Uuid) -> Option<u64> {
        self.keys.get(key).copied()
    }

    /// Leader-side append. A key already retained returns its existing index.
    pub fn append(&mut self, term: u64, key: Uuid, payload: EntryPayload) -> u64 {
        if let Some(index) = self.position_of(&key) {
            return index;
        }
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            key,
            payload,
        });
        self.keys.insert(key, index);
        index
    }

    /// Follower-side AppendEntries consistency check and merge.
    ///
    /// Returns `false` when the log has no entry at `prev_index` with
    /// `prev_term`. Conflicting suffixes are truncated, but never below the
    /// commit index. Entries already inside the snapshot are committed here
    /// and skipped.
    pub fn try_append(&mut self, prev_index: u64, prev_term: u64, entries: &[LogEntry]) -> bool {
        if prev_index < self.snapshot_index {
            let skip = (self.snapshot_index - prev_index) as usize;
            if skip > entries.len() {
                return true;
            }
            let (covered, rest) = entries.split_at(skip);
            let boundary_term = covered.last().map_or(prev_term, |e| e.term);
            return self.try_append(self.snapshot_index, boundary_term, rest);
        }
        if self.term_at(prev_index) != Some(prev_term) {
            return false;
        }
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return false;
                    }
                    self.truncate_from(entry.index);
                }
                None => {}
            }
            if entry.index != self.last_index() + 1 {
                return false;
            }
            self.keys.insert(entry.key, entry.index);
            self.entries.push(entry.clone());
        }
        true
    }

    fn truncate_from(&mut self, index: u64) {
        let start = index.saturating_sub(self.snapshot_index + 1) as usize;
        for removed in self.entries.drain(start..) {
            self.keys.remove(&removed.key);
        }
    }

    /// Move the commit index forward, never past the last entry and never back.
    pub fn commit_to(&mut self, index: u64) -> bool {
        let target = index.min(self.last_index());
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Fold committed entries up to `index` into the snapshot. Returns how
    /// many entries were dropped.
    pub fn compact_to(&mut self, index: u64) -> usize {
        let upto = index.min(self.commit_index);
        if upto <= self.snapshot_index {
            return 0;
        }
        let Some(term) = self.term_at(upto) else {
            return 0;
        };
        let count = (upto - self.snapshot_index) as usize;
        for removed in self.entries.drain(..count) {
            self.keys.remove(&removed.key);
        }
        self.snapshot_index = upto;
        self.snapshot_term = term;
        count
    }

    /// Follower-side snapshot install. A retained suffix that agrees with the
    /// snapshot point is kept; otherwise the log restarts at the snapshot.
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        if self.term_at(index) == Some(term) {
            let count = (index - self.snapshot_index) as usize;
            for removed in self.entries.drain(..count) {
                self.keys.remove(&removed.key);
            }
        } else {
            self.entries.clear();
            self.keys.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.commit_index = self.commit_index.max(index);
    }

    /// Raft's up-to-date rule: is a log ending at (`last_term`, `last_index`)
    /// at least as current as this one?
    pub fn is_up_to_date(&self, last_term: u64, last_index: u64) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            key: Uuid::new_v4(),
            payload: EntryPayload::Noop,
        }
    }

    #[test]
    fn test_append_dedupes_by_key() {
        let mut log = ReplicatedLog::new();
        let key = Uuid::new_v4();
        assert_eq!(log.append(1, key, EntryPayload::Noop), 1);
        assert_eq!(log.append(1, Uuid::new_v4(), EntryPayload::Noop), 2);
        assert_eq!(log.append(2, key, EntryPayload::Noop), 1);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_consistency_check_rejects_gap_and_term_mismatch() {
        let mut log = ReplicatedLog::new();
        assert!(log.try_append(0, 0, &[entry(1, 1)]));
        assert!(!log.try_append(3, 1, &[entry(4, 1)]));
        assert!(!log.try_append(1, 2, &[entry(2, 2)]));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_conflicting_suffix_is_truncated() {
        let mut log = ReplicatedLog::new();
        assert!(log.try_append(0, 0, &[entry(1, 1), entry(2, 1), entry(3, 1)]));
        let stale_key = log.entry(3).unwrap().key;
        assert!(log.try_append(1, 1, &[entry(2, 1), entry(3, 2)]));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.position_of(&stale_key), None);
    }

    #[test]
    fn test_committed_entries_are_never_truncated() {
        let mut log = ReplicatedLog::new();
        assert!(log.try_append(0, 0, &[entry(1, 1), entry(2, 1)]));
        log.commit_to(2);
        assert!(!log.try_append(1, 1, &[entry(2, 3)]));
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn test_replayed_append_is_idempotent() {
        let mut log = ReplicatedLog::new();
        let batch = vec![entry(1, 1), entry(2, 1)];
        assert!(log.try_append(0, 0, &batch));
        assert!(log.try_append(0, 0, &batch));
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_up_to_date_rule() {
        let mut log = ReplicatedLog::new();
        log.append(2, Uuid::new_v4(), EntryPayload::Noop);
        log.append(2, Uuid::new_v4(), EntryPayload::Noop);
        assert!(log.is_up_to_date(2, 2));
        assert!(log.is_up_to_date(3, 1));
        assert!(!log.is_up_to_date(2, 1));
        assert!(!log.is_up_to_date(1, 10));
    }

    #[test]
    fn test_compaction_keeps_indices_and_drops_prefix() {
        let mut log = ReplicatedLog::new();
        for term in [1, 1, 2, 2, 2] {
            log.append(term, Uuid::new_v4(), EntryPayload::Noop);
        }
        let early = log.entry(2).unwrap().key;
        // never past the commit index
        assert_eq!(log.compact_to(3), 0);
        log.commit_to(4);
        assert_eq!(log.compact_to(3), 3);

        assert_eq!((log.snapshot_index(), log.snapshot_term()), (3, 2));
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.position_of(&early), None);
        assert_eq!(log.entries_from(1).first().map(|e| e.index), Some(4));
        assert_eq!(log.append(3, Uuid::new_v4(), EntryPayload::Noop), 6);
    }

    #[test]
    fn test_append_below_snapshot_skips_covered_entries() {
        let mut log = ReplicatedLog::new();
        let batch = vec![entry(1, 1), entry(2, 1), entry(3, 1)];
        assert!(log.try_append(0, 0, &batch));
        log.commit_to(2);
        log.compact_to(2);

        // the leader resends from the start plus one new entry
        let mut resend = batch.clone();
        resend.push(entry(4, 1));
        assert!(log.try_append(0, 0, &resend));
        assert_eq!(log.last_index(), 4);
        // wholly covered batches are accepted without change
        assert!(log.try_append(0, 0, &batch[..1]));
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_install_snapshot_keeps_agreeing_suffix() {
        let mut log = ReplicatedLog::new();
        assert!(log.try_append(0, 0, &[entry(1, 1), entry(2, 1), entry(3, 1)]));
        log.install_snapshot(2, 1);
        assert_eq!((log.snapshot_index(), log.commit_index(), log.last_index()), (2, 2, 3));

        let mut behind = ReplicatedLog::new();
        assert!(behind.try_append(0, 0, &[entry(1, 1)]));
        behind.install_snapshot(10, 3);
        assert_eq!((behind.snapshot_index(), behind.last_index(), behind.last_term()), (10, 10, 3));
        assert!(behind.entries().is_empty());
        assert!(behind.try_append(10, 3, &[entry(11, 3)]));
    }

    #[test]
    fn test_restore_from_snapshot_point() {
        let log = ReplicatedLog::restore(5, 2, vec![entry(6, 2), entry(7, 3)], 9);
        assert_eq!(log.last_index(), 7);
        assert_eq!(log.commit_index(), 7);
        assert_eq!(log.term_at(5), Some(2));
        assert_eq!(log.entry(7).map(|e| e.term), Some(3));
    }

    #[test]
    fn test_commit_never_moves_back_or_past_end() {
        let mut log = ReplicatedLog::new();
        log.append(1, Uuid::new_v4(), EntryPayload::Noop);
        assert!(log.commit_to(5));
        assert_eq!(log.commit_index(), 1);
        assert!(!log.commit_to(0));
        assert_eq!(log.commit_index(), 1);
    }
}
