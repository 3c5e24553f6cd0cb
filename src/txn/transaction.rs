// # Transaction Handle
//
// Owned by one thread for its lifetime. Carries the read snapshot, the
// private write set, the read set used for optimistic validation, and
// buffered accumulator updates. The engine's commit path consumes these;
// the handle itself never touches storage.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::accumulator::AccumulatorKind;
use crate::common::{Timestamp, TreeId, TxnId};
use crate::config::CommitPolicy;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

/// One buffered write: a value or a tombstone.
pub type PendingWrite = Option<Bytes>;

/// Buffered accumulator effects of one (tree, slot).
#[derive(Debug, Clone, Copy)]
pub struct AccumDelta {
    pub kind: AccumulatorKind,
    pub sum: i64,
    pub min_seen: i64,
    pub max_seen: i64,
    pub count: i64,
}

impl AccumDelta {
    fn new(kind: AccumulatorKind) -> AccumDelta {
        AccumDelta {
            kind,
            sum: 0,
            min_seen: i64::MAX,
            max_seen: i64::MIN,
            count: 0,
        }
    }

    /// The argument journaled and published at commit.
    pub fn commit_arg(&self) -> i64 {
        match self.kind {
            AccumulatorKind::Sum => self.sum,
            AccumulatorKind::Min => self.min_seen,
            AccumulatorKind::Max => self.max_seen,
            AccumulatorKind::Seq => self.count,
        }
    }

    /// Fold this delta onto a committed snapshot value, for reads inside
    /// the owning transaction.
    pub fn apply_to(&self, snapshot: i64) -> i64 {
        match self.kind {
            AccumulatorKind::Sum => snapshot.wrapping_add(self.sum),
            AccumulatorKind::Min => snapshot.min(self.min_seen),
            AccumulatorKind::Max => snapshot.max(self.max_seen),
            AccumulatorKind::Seq => snapshot.wrapping_add(self.count),
        }
    }

    pub fn is_noop(&self) -> bool {
        match self.kind {
            AccumulatorKind::Sum => self.sum == 0,
            AccumulatorKind::Min => self.min_seen == i64::MAX,
            AccumulatorKind::Max => self.max_seen == i64::MIN,
            AccumulatorKind::Seq => self.count == 0,
        }
    }
}

pub struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) read_ts: Timestamp,
    pub(crate) status: TxnStatus,
    /// (tree, key) -> value-or-tombstone; a later write to the same key
    /// replaces the earlier one. Ordered so commit applies
    /// deterministically.
    pub(crate) writes: BTreeMap<(TreeId, Vec<u8>), PendingWrite>,
    /// (tree, key) -> newest committed version timestamp observed (None:
    /// the key was absent). Validated at commit.
    pub(crate) reads: HashMap<(TreeId, Vec<u8>), Option<Timestamp>>,
    pub(crate) accums: HashMap<(TreeId, u8), AccumDelta>,
    /// Per-transaction durability override; the engine default otherwise.
    pub(crate) commit_policy: Option<CommitPolicy>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, read_ts: Timestamp) -> Transaction {
        Transaction {
            id,
            read_ts,
            status: TxnStatus::Active,
            writes: BTreeMap::new(),
            reads: HashMap::new(),
            accums: HashMap::new(),
            commit_policy: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Override the engine-wide durability policy for this transaction.
    pub fn set_commit_policy(&mut self, policy: CommitPolicy) {
        self.commit_policy = Some(policy);
    }

    pub fn commit_policy(&self) -> Option<CommitPolicy> {
        self.commit_policy
    }

    pub fn read_timestamp(&self) -> Timestamp {
        self.read_ts
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(EngineError::InvariantViolation(
                "operation on a finished transaction".to_string(),
            ))
        }
    }

    /// Buffer a write. Returns an error after commit/rollback.
    pub(crate) fn record_write(
        &mut self,
        tree: TreeId,
        key: Vec<u8>,
        value: PendingWrite,
    ) -> Result<()> {
        self.check_active()?;
        self.writes.insert((tree, key), value);
        Ok(())
    }

    /// The transaction's own pending write for a key, if any.
    pub(crate) fn pending_write(&self, tree: TreeId, key: &[u8]) -> Option<&PendingWrite> {
        self.writes.get(&(tree, key.to_vec()))
    }

    /// Record what a snapshot read observed, for commit validation. The
    /// first observation wins: validation compares against the state seen
    /// earliest.
    pub(crate) fn record_read(&mut self, tree: TreeId, key: Vec<u8>, latest: Option<Timestamp>) {
        self.reads.entry((tree, key)).or_insert(latest);
    }

    pub(crate) fn accum_delta(&mut self, tree: TreeId, slot: u8, kind: AccumulatorKind) -> &mut AccumDelta {
        self.accums
            .entry((tree, slot))
            .or_insert_with(|| AccumDelta::new(kind))
    }

    pub(crate) fn accum_view(&self, tree: TreeId, slot: u8) -> Option<&AccumDelta> {
        self.accums.get(&(tree, slot))
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.accums.values().all(|d| d.is_noop())
    }
}
