// # Transaction Manager
//
// Owns the global commit counter, transaction ids, and the
// active-transaction table. Commit orchestration (journal, validation,
// apply) lives in the engine; this type provides the ordered primitives it
// builds on. The commit lock serializes validation and timestamp
// assignment so that commit timestamps are dense and file order equals
// timestamp order.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::common::{Timestamp, TxnId};
use crate::txn::transaction::Transaction;

pub struct TxnManager {
    /// Timestamp of the newest visible commit.
    commit_ts: AtomicU64,
    next_txn_id: AtomicU64,
    /// Active transactions and their read timestamps; read by checkpoint
    /// (active set) and pruning (horizon).
    active: DashMap<TxnId, Timestamp>,
    commit_lock: Mutex<()>,
}

impl TxnManager {
    pub fn new(start_ts: Timestamp, start_txn_id: TxnId) -> TxnManager {
        TxnManager {
            commit_ts: AtomicU64::new(start_ts),
            next_txn_id: AtomicU64::new(start_txn_id),
            active: DashMap::new(),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn begin(&self) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let read_ts = self.commit_ts.load(Ordering::SeqCst);
        self.active.insert(id, read_ts);
        Transaction::new(id, read_ts)
    }

    pub fn current_ts(&self) -> Timestamp {
        self.commit_ts.load(Ordering::SeqCst)
    }

    /// Serialize commit validation, timestamp assignment, journal append,
    /// and apply.
    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// The next commit timestamp. Call under the commit lock; publish with
    /// `publish_commit` after the writes are applied.
    pub fn next_commit_ts(&self) -> Timestamp {
        self.commit_ts.load(Ordering::SeqCst) + 1
    }

    /// Make `ts` visible to new snapshots.
    pub fn publish_commit(&self, ts: Timestamp) {
        debug_assert_eq!(self.commit_ts.load(Ordering::SeqCst) + 1, ts);
        self.commit_ts.store(ts, Ordering::SeqCst);
    }

    /// Recovery: jump both counters past everything replayed so new
    /// transactions and commits continue above the journal's history.
    pub fn publish_range(&self, ts: Timestamp, next_txn_id: TxnId) {
        self.commit_ts.fetch_max(ts, Ordering::SeqCst);
        self.next_txn_id.fetch_max(next_txn_id, Ordering::SeqCst);
    }

    pub fn deregister(&self, id: TxnId) {
        self.active.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Pruning horizon: the oldest read timestamp any live transaction
    /// holds, or the current commit timestamp when none are active.
    pub fn oldest_active_read_ts(&self) -> Timestamp {
        self.active
            .iter()
            .map(|e| *e.value())
            .min()
            .unwrap_or_else(|| self.current_ts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_snapshots_current_commit_ts() {
        let mgr = TxnManager::new(5, 1);
        let txn = mgr.begin();
        assert_eq!(txn.read_timestamp(), 5);
        assert_eq!(mgr.active_count(), 1);
        mgr.deregister(txn.id());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn commit_timestamps_are_dense() {
        let mgr = TxnManager::new(0, 1);
        let _guard = mgr.commit_lock();
        let ts = mgr.next_commit_ts();
        assert_eq!(ts, 1);
        mgr.publish_commit(ts);
        assert_eq!(mgr.current_ts(), 1);
        assert_eq!(mgr.next_commit_ts(), 2);
    }

    #[test]
    fn horizon_tracks_oldest_active() {
        let mgr = TxnManager::new(10, 1);
        let a = mgr.begin();
        {
            let _guard = mgr.commit_lock();
            let ts = mgr.next_commit_ts();
            mgr.publish_commit(ts);
        }
        let b = mgr.begin();
        assert_eq!(mgr.oldest_active_read_ts(), 10);
        mgr.deregister(a.id());
        assert_eq!(mgr.oldest_active_read_ts(), 11);
        mgr.deregister(b.id());
        assert_eq!(mgr.oldest_active_read_ts(), 11);
    }
}
