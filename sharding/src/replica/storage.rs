#![allow(clippy::field_reassign_with_default)]

//! Volatile raft log storage.
//!
//! In-memory append-only log with a snapshot slot, kept behind the raft
//! `Storage` trait so a durable implementation can be slotted in later.

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};

/// In-memory storage for one replica's raft log.
///
/// Clones share the same underlying state, so the raft loop can own one
/// handle inside the driver while apply/append go through another.
#[derive(Clone)]
pub struct VolatileStore {
    mem_storage: MemStorage,
}

impl VolatileStore {
    /// Create a store bootstrapped with the full voter set (static membership).
    pub fn new(voters: Vec<u64>) -> Self {
        let mem_storage = MemStorage::new_with_conf_state(ConfState::from((voters, vec![])));
        VolatileStore { mem_storage }
    }

    /// Append entries to the log.
    pub fn append_entries(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)
    }

    /// Set the configuration state
    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state)
    }

    /// Set the hard state
    pub fn set_hardstate(&self, hs: HardState) {
        self.mem_storage.wl().set_hardstate(hs);
    }

    /// Set the commit index
    pub fn set_commit(&self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }

    /// Apply a snapshot, replacing the log prefix it covers.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.mem_storage.wl().apply_snapshot(snapshot)
    }

    /// Get the current commit index
    pub fn commit(&self) -> u64 {
        self.mem_storage.rl().hard_state().commit
    }
}

impl Storage for VolatileStore {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn test_append_and_read_back() {
        let store = VolatileStore::new(vec![1]);
        let first = store.last_index().unwrap() + 1;

        store
            .append_entries(&[entry(first, 1, b"a"), entry(first + 1, 1, b"b")])
            .unwrap();

        assert_eq!(store.last_index().unwrap(), first + 1);
        let got = store
            .entries(first, first + 2, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.as_ref(), b"a");
        assert_eq!(got[1].data.as_ref(), b"b");
    }

    #[test]
    fn test_clones_share_state() {
        let store = VolatileStore::new(vec![1, 2, 3]);
        let other = store.clone();
        let first = store.last_index().unwrap() + 1;

        store.append_entries(&[entry(first, 1, b"x")]).unwrap();
        assert_eq!(other.last_index().unwrap(), first);

        store.set_commit(first);
        assert_eq!(other.commit(), first);
    }

    #[test]
    fn test_apply_snapshot_advances_log() {
        let store = VolatileStore::new(vec![1]);

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 10;
        snapshot.mut_metadata().term = 3;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1];

        store.apply_snapshot(snapshot).unwrap();
        assert_eq!(store.first_index().unwrap(), 11);
        assert_eq!(store.term(10).unwrap(), 3);
    }
}
