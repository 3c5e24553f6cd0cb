// # Accumulators
//
// Per-tree transactional aggregates, 64 numbered slots per tree. Updates
// buffer inside a transaction and become visible at its commit timestamp;
// snapshot reads fold only updates at or before the reader's timestamp, so
// accumulators obey the same isolation as ordinary keys.
//
// The live state of a slot is a base value (the fold as of some timestamp,
// advanced by pruning and seeded by checkpoints at recovery) plus an
// ordered list of committed updates newer than the base. SEQ additionally
// keeps an allocation high water that hands out unique increasing values
// even before the allocating transaction commits.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::common::{Timestamp, ACCUMULATOR_SLOTS};
use crate::error::{EngineError, Result};

/// Aggregate kind: identity, combine, and commit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccumulatorKind {
    /// Identity 0, combine +, commit applies the net delta.
    Sum = 0,
    /// Identity +inf, combine min, commit applies the minimum observed.
    Min = 1,
    /// Identity -inf, combine max, commit applies the maximum observed.
    Max = 2,
    /// Unique increasing allocator; the snapshot value is the count of
    /// committed allocations.
    Seq = 3,
}

impl AccumulatorKind {
    pub fn from_u8(raw: u8) -> Option<AccumulatorKind> {
        match raw {
            0 => Some(AccumulatorKind::Sum),
            1 => Some(AccumulatorKind::Min),
            2 => Some(AccumulatorKind::Max),
            3 => Some(AccumulatorKind::Seq),
            _ => None,
        }
    }

    pub fn identity(self) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => 0,
            AccumulatorKind::Min => i64::MAX,
            AccumulatorKind::Max => i64::MIN,
        }
    }

    pub fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => a.wrapping_add(b),
            AccumulatorKind::Min => a.min(b),
            AccumulatorKind::Max => a.max(b),
        }
    }
}

struct SlotState {
    kind: AccumulatorKind,
    /// Fold of every committed update with ts <= base_ts.
    base_value: i64,
    base_ts: Timestamp,
    /// Committed updates with ts > base_ts, ascending.
    updates: VecDeque<(Timestamp, i64)>,
    /// SEQ only: highest value ever handed out by `allocate`.
    high_water: i64,
}

impl SlotState {
    fn fold_at(&self, at: Timestamp) -> i64 {
        let mut acc = self.base_value;
        for &(ts, arg) in &self.updates {
            if ts > at {
                break;
            }
            acc = self.kind.combine(acc, arg);
        }
        acc
    }
}

/// The 64 accumulator slots of one tree.
pub struct AccumulatorSet {
    slots: Vec<RwLock<Option<SlotState>>>,
}

impl AccumulatorSet {
    pub fn new() -> Self {
        Self {
            slots: (0..ACCUMULATOR_SLOTS).map(|_| RwLock::new(None)).collect(),
        }
    }

    fn slot(&self, index: u8) -> Result<&RwLock<Option<SlotState>>> {
        self.slots.get(index as usize).ok_or_else(|| {
            EngineError::Config(format!(
                "accumulator slot {index} out of range 0..{ACCUMULATOR_SLOTS}"
            ))
        })
    }

    /// Bind a slot to a kind. The first binding wins; a later binding with a
    /// different kind is a caller error.
    pub fn ensure(&self, index: u8, kind: AccumulatorKind) -> Result<()> {
        let slot = self.slot(index)?;
        let mut guard = slot.write();
        match guard.as_ref() {
            Some(state) if state.kind != kind => Err(EngineError::Config(format!(
                "accumulator slot {index} already bound to {:?}",
                state.kind
            ))),
            Some(_) => Ok(()),
            None => {
                *guard = Some(SlotState {
                    kind,
                    base_value: kind.identity(),
                    base_ts: 0,
                    updates: VecDeque::new(),
                    high_water: 0,
                });
                Ok(())
            }
        }
    }

    pub fn kind_of(&self, index: u8) -> Option<AccumulatorKind> {
        self.slots
            .get(index as usize)
            .and_then(|s| s.read().as_ref().map(|st| st.kind))
    }

    /// Committed value visible at `at`.
    pub fn snapshot_value(&self, index: u8, at: Timestamp) -> Result<i64> {
        let slot = self.slot(index)?;
        let guard = slot.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| EngineError::Config(format!("accumulator slot {index} unbound")))?;
        Ok(state.fold_at(at))
    }

    /// Record one committed update at `ts`. Commits publish in timestamp
    /// order, so appends stay sorted.
    pub fn publish(&self, index: u8, kind: AccumulatorKind, ts: Timestamp, arg: i64) -> Result<()> {
        self.ensure(index, kind)?;
        let slot = self.slot(index)?;
        let mut guard = slot.write();
        let state = guard.as_mut().expect("slot bound above");
        debug_assert!(state.updates.back().map_or(true, |&(t, _)| t <= ts));
        state.updates.push_back((ts, arg));
        if kind == AccumulatorKind::Seq {
            state.high_water = state.high_water.max(state.fold_at(u64::MAX));
        }
        Ok(())
    }

    /// SEQ: hand out the next unique value. Unique across restarts because
    /// recovery reseeds the high water from the checkpoint and replayed
    /// allocation counts.
    pub fn allocate_seq(&self, index: u8) -> Result<i64> {
        self.ensure(index, AccumulatorKind::Seq)?;
        let slot = self.slot(index)?;
        let mut guard = slot.write();
        let state = guard.as_mut().expect("slot bound above");
        state.high_water += 1;
        Ok(state.high_water)
    }

    /// Fold updates at or below `horizon` (the oldest active read
    /// timestamp) into the base so the update lists stay short.
    pub fn prune(&self, horizon: Timestamp) {
        for slot in &self.slots {
            let mut guard = slot.write();
            if let Some(state) = guard.as_mut() {
                while let Some(&(ts, arg)) = state.updates.front() {
                    if ts > horizon {
                        break;
                    }
                    state.base_value = state.kind.combine(state.base_value, arg);
                    state.base_ts = ts;
                    state.updates.pop_front();
                }
            }
        }
    }

    /// Capture every bound slot for a checkpoint at `base_ts`.
    pub fn checkpoint_snapshot(
        &self,
        tree: crate::common::TreeId,
        base_ts: Timestamp,
    ) -> Vec<crate::journal::AccumulatorSnapshot> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let guard = slot.read();
            if let Some(state) = guard.as_ref() {
                out.push(crate::journal::AccumulatorSnapshot {
                    tree,
                    slot: index as u8,
                    kind: state.kind,
                    value: state.fold_at(base_ts),
                    high_water: state.high_water,
                });
            }
        }
        out
    }

    /// Seed a slot from a checkpoint snapshot during recovery.
    pub fn restore(&self, snap: &crate::journal::AccumulatorSnapshot, base_ts: Timestamp) {
        if let Ok(slot) = self.slot(snap.slot) {
            *slot.write() = Some(SlotState {
                kind: snap.kind,
                base_value: snap.value,
                base_ts,
                updates: VecDeque::new(),
                high_water: snap.high_water,
            });
        }
    }
}

impl Default for AccumulatorSet {
    fn default() -> Self {
        Self::new()
    }
}
