// # Exchange
//
// The engine's sole public access surface: a key buffer, a value buffer,
// and a tree reference, with point and range operations that read through
// the owning transaction's snapshot and buffer writes into it. Every
// operation has two forms: `*_in(txn)` runs inside a caller-managed
// transaction; the bare form runs an implicit auto-commit transaction
// (reads simply take the current snapshot).
//
// An Exchange belongs to one thread at a time. It may move between
// threads, never be shared by two.
//
// ```rust,ignore
// let mut ex = engine.exchange("main", "people")?;
// ex.key_mut().clear().append_str("bob")?;
// ex.set_value(b"builder");
// ex.store()?;
// ```

use std::sync::Arc;

use bytes::Bytes;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::key::Key;
use crate::tree::btree::LeafHint;
use crate::tree::Tree;
use crate::txn::transaction::Transaction;
use crate::value::Value;
use crate::AccumulatorKind;

/// Traversal direction for `traverse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

pub struct Exchange {
    engine: Engine,
    tree: Arc<Tree>,
    key: Key,
    value: Value,
    /// Remembered leaf position; validated by version stamp on reuse.
    hint: Option<LeafHint>,
}

impl Exchange {
    pub(crate) fn new(engine: Engine, tree: Arc<Tree>) -> Exchange {
        let max_key = engine.max_key_len();
        Exchange {
            engine,
            tree,
            key: Key::new(max_key),
            value: Value::new(),
            hint: None,
        }
    }

    pub fn tree_name(&self) -> &str {
        &self.tree.name
    }

    // ------------------------------------------------------------------
    // Key and value buffers
    // ------------------------------------------------------------------

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, bytes: &[u8]) {
        self.value.set(bytes);
    }

    pub fn get_value(&self) -> &[u8] {
        self.value.as_slice()
    }

    fn require_key(&self) -> Result<&[u8]> {
        if self.key.is_empty() {
            return Err(EngineError::Config("operation requires a key".to_string()));
        }
        Ok(self.key.encoded())
    }

    // ------------------------------------------------------------------
    // Point operations
    // ------------------------------------------------------------------

    /// Fetch into the value buffer. False leaves the buffer empty.
    pub fn fetch_in(&mut self, txn: &mut Transaction) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        let found = self.engine.snapshot_fetch(Some(txn), &self.tree, &key)?;
        Ok(self.fill_value(found))
    }

    /// Fetch at the engine's current snapshot, outside any transaction.
    pub fn fetch(&mut self) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        let found = self.engine.snapshot_fetch(None, &self.tree, &key)?;
        Ok(self.fill_value(found))
    }

    fn fill_value(&mut self, found: Option<Bytes>) -> bool {
        match found {
            Some(bytes) => {
                self.value.set_from(bytes);
                true
            }
            None => {
                self.value.clear();
                false
            }
        }
    }

    /// Buffer a write of the value buffer under the current key.
    pub fn store_in(&mut self, txn: &mut Transaction) -> Result<()> {
        let key = self.require_key()?.to_vec();
        let value = Bytes::copy_from_slice(self.value.as_slice());
        self.engine.buffer_write(txn, &self.tree, &key, Some(value))
    }

    /// Auto-commit store. A blind write: it cannot conflict.
    pub fn store(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        engine.transact(|txn| self.store_in(txn))
    }

    /// Buffer a tombstone. Returns whether the key was visible first.
    pub fn remove_in(&mut self, txn: &mut Transaction) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        let existed = self
            .engine
            .snapshot_fetch(Some(&mut *txn), &self.tree, &key)?
            .is_some();
        self.engine.buffer_write(txn, &self.tree, &key, None)?;
        Ok(existed)
    }

    pub fn remove(&mut self) -> Result<bool> {
        let engine = self.engine.clone();
        engine.transact(|txn| self.remove_in(txn))
    }

    /// Fetch the old value into the buffer and buffer a tombstone.
    pub fn fetch_and_remove_in(&mut self, txn: &mut Transaction) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        let found = self
            .engine
            .snapshot_fetch(Some(&mut *txn), &self.tree, &key)?;
        self.engine.buffer_write(txn, &self.tree, &key, None)?;
        Ok(self.fill_value(found))
    }

    pub fn fetch_and_remove(&mut self) -> Result<bool> {
        let engine = self.engine.clone();
        engine.transact(|txn| self.fetch_and_remove_in(txn))
    }

    /// Existence check without copying the value.
    pub fn exists_in(&mut self, txn: &mut Transaction) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        Ok(self.engine.snapshot_fetch(Some(txn), &self.tree, &key)?.is_some())
    }

    pub fn exists(&mut self) -> Result<bool> {
        let key = self.require_key()?.to_vec();
        Ok(self.engine.snapshot_fetch(None, &self.tree, &key)?.is_some())
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Step to the next key in order. With `deep`, every stored key is
    /// visited; without it, results are truncated to the current key's
    /// segment depth and whole subtrees beneath the current key are
    /// skipped, which makes repeated calls iterate siblings at one level.
    /// Returns false at the end; the key buffer is unchanged then.
    pub fn next_in(&mut self, txn: &mut Transaction, deep: bool) -> Result<bool> {
        self.step_forward(Some(txn), deep)
    }

    pub fn next(&mut self, deep: bool) -> Result<bool> {
        self.step_forward(None, deep)
    }

    /// Step to the previous key in order; the mirror of `next`.
    pub fn previous_in(&mut self, txn: &mut Transaction, deep: bool) -> Result<bool> {
        self.step_backward(Some(txn), deep)
    }

    pub fn previous(&mut self, deep: bool) -> Result<bool> {
        self.step_backward(None, deep)
    }

    pub fn traverse_in(
        &mut self,
        txn: &mut Transaction,
        direction: Direction,
        deep: bool,
    ) -> Result<bool> {
        match direction {
            Direction::Forward => self.next_in(txn, deep),
            Direction::Backward => self.previous_in(txn, deep),
        }
    }

    pub fn traverse(&mut self, direction: Direction, deep: bool) -> Result<bool> {
        match direction {
            Direction::Forward => self.next(deep),
            Direction::Backward => self.previous(deep),
        }
    }

    fn step_forward(&mut self, mut txn: Option<&mut Transaction>, deep: bool) -> Result<bool> {
        let depth = self.key.depth();
        let mut bound = self.key.encoded().to_vec();
        let mut inclusive = false;
        loop {
            let (found, hint) = self.engine.snapshot_next(
                txn.as_deref_mut(),
                &self.tree,
                &bound,
                inclusive,
                self.hint,
            )?;
            self.hint = hint;
            let Some((key_bytes, value)) = found else {
                self.value.clear();
                return Ok(false);
            };
            if deep || depth == 0 {
                self.key.set_encoded(&key_bytes)?;
                self.value.set_from(value);
                return Ok(true);
            }
            let mut truncated = Key::new(self.engine.max_key_len().max(key_bytes.len()));
            truncated.set_encoded(&key_bytes)?;
            truncated.truncate_segments(depth);
            if truncated.encoded() == self.key.encoded() {
                // A descendant of the current key: skip its whole subtree.
                // No real key can start with 0xFF, so prefix+0xFF bounds it.
                bound = self.key.encoded().to_vec();
                bound.push(0xFF);
                inclusive = true;
                continue;
            }
            let exact = truncated.encoded() == key_bytes.as_slice();
            self.key = truncated;
            if exact {
                self.value.set_from(value);
            } else {
                self.value.clear();
            }
            return Ok(true);
        }
    }

    fn step_backward(&mut self, mut txn: Option<&mut Transaction>, deep: bool) -> Result<bool> {
        let depth = self.key.depth();
        let bound = self.key.encoded().to_vec();
        let found = self
            .engine
            .snapshot_prev(txn.as_deref_mut(), &self.tree, &bound, false)?;
        let Some((key_bytes, value)) = found else {
            self.value.clear();
            return Ok(false);
        };
        if deep || depth == 0 {
            self.key.set_encoded(&key_bytes)?;
            self.value.set_from(value);
            return Ok(true);
        }
        let mut truncated = Key::new(self.engine.max_key_len().max(key_bytes.len()));
        truncated.set_encoded(&key_bytes)?;
        truncated.truncate_segments(depth);
        let exact = truncated.encoded() == key_bytes.as_slice();
        self.key = truncated;
        if exact {
            self.value.set_from(value);
        } else {
            self.value.clear();
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Range removal
    // ------------------------------------------------------------------

    /// Remove every visible key in [current key, `end`). Returns the
    /// number of keys removed. The key buffer is left at the last removed
    /// key.
    pub fn remove_range_in(&mut self, txn: &mut Transaction, end: &Key) -> Result<u64> {
        let mut removed = 0u64;
        let mut bound = self.require_key()?.to_vec();
        let mut inclusive = true;
        loop {
            let (found, hint) = self.engine.snapshot_next(
                Some(&mut *txn),
                &self.tree,
                &bound,
                inclusive,
                self.hint,
            )?;
            self.hint = hint;
            let Some((key_bytes, _)) = found else { break };
            if key_bytes.as_slice() >= end.encoded() {
                break;
            }
            self.engine
                .buffer_write(&mut *txn, &self.tree, &key_bytes, None)?;
            removed += 1;
            self.key.set_encoded(&key_bytes)?;
            bound = key_bytes;
            inclusive = false;
        }
        Ok(removed)
    }

    pub fn remove_range(&mut self, end: &Key) -> Result<u64> {
        let engine = self.engine.clone();
        let end = end.clone();
        // A conflict retry must restart from the original range start, not
        // from wherever the failed attempt left the key buffer.
        let start = self.key.clone();
        engine.transact(|txn| {
            self.key = start.clone();
            self.remove_range_in(txn, &end)
        })
    }

    // ------------------------------------------------------------------
    // Accumulators
    // ------------------------------------------------------------------

    /// Propose a value to a SUM, MIN, or MAX accumulator slot of this
    /// tree, buffered until commit.
    pub fn accumulator_update(
        &self,
        txn: &mut Transaction,
        slot: u8,
        kind: AccumulatorKind,
        value: i64,
    ) -> Result<()> {
        self.engine
            .accumulator_update(txn, &self.tree, slot, kind, value)
    }

    /// Draw the next unique value from a SEQ slot.
    pub fn accumulator_allocate(&self, txn: &mut Transaction, slot: u8) -> Result<i64> {
        self.engine.accumulator_allocate(txn, &self.tree, slot)
    }

    /// Committed value visible at the snapshot, plus this transaction's
    /// own buffered effect when a transaction is supplied.
    pub fn accumulator_snapshot(
        &self,
        txn: Option<&Transaction>,
        slot: u8,
        kind: AccumulatorKind,
    ) -> Result<i64> {
        self.engine.accumulator_snapshot(txn, &self.tree, slot, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::key::Segment;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> Engine {
        let mut config = EngineConfig::in_dir(dir);
        config.page_size = 1024;
        Engine::open(config).unwrap()
    }

    #[test]
    fn store_fetch_remove_auto() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ex = engine.exchange("main", "t").unwrap();
        ex.key_mut().clear().append_int(42).unwrap();
        ex.set_value(b"hello");
        ex.store().unwrap();

        ex.set_value(b"junk");
        assert!(ex.fetch().unwrap());
        assert_eq!(ex.get_value(), b"hello");

        assert!(ex.remove().unwrap());
        assert!(!ex.fetch().unwrap());
        assert!(ex.get_value().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn transactional_visibility() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ex = engine.exchange("main", "t").unwrap();
        let mut txn = engine.begin_transaction();
        ex.key_mut().clear().append_str("pending").unwrap();
        ex.set_value(b"v");
        ex.store_in(&mut txn).unwrap();
        // Visible inside the transaction, invisible outside.
        assert!(ex.exists_in(&mut txn).unwrap());
        let mut other = engine.exchange("main", "t").unwrap();
        other.key_mut().clear().append_str("pending").unwrap();
        assert!(!other.exists().unwrap());
        engine.commit(txn).unwrap();
        assert!(other.exists().unwrap());
        engine.close().unwrap();
    }

    #[test]
    fn deep_traversal_visits_everything() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ex = engine.exchange("main", "t").unwrap();
        for i in 0..50i64 {
            ex.key_mut().clear();
            ex.key_mut().append_str("g").unwrap();
            ex.key_mut().append_int(i).unwrap();
            ex.set_value(&i.to_le_bytes());
            ex.store().unwrap();
        }
        ex.key_mut().clear();
        let mut seen = 0i64;
        while ex.next(true).unwrap() {
            let segments = ex.key().decode().unwrap();
            assert_eq!(segments[1], Segment::Int(seen));
            seen += 1;
        }
        assert_eq!(seen, 50);
        engine.close().unwrap();
    }

    #[test]
    fn shallow_traversal_iterates_one_level() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ex = engine.exchange("main", "t").unwrap();
        for group in ["a", "b", "c"] {
            for i in 0..5i64 {
                ex.key_mut().clear();
                ex.key_mut().append_str(group).unwrap();
                ex.key_mut().append_int(i).unwrap();
                ex.set_value(b"x");
                ex.store().unwrap();
            }
        }
        // Seed below the first top-level segment, then iterate siblings.
        ex.key_mut().clear();
        ex.key_mut().append_before();
        let mut groups = Vec::new();
        while ex.next(false).unwrap() {
            match &ex.key().decode().unwrap()[0] {
                Segment::Str(s) => groups.push(s.clone()),
                other => panic!("unexpected segment {other:?}"),
            }
        }
        assert_eq!(groups, vec!["a", "b", "c"]);
        engine.close().unwrap();
    }

    #[test]
    fn remove_range_clears_span() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut ex = engine.exchange("main", "t").unwrap();
        for i in 0..20i64 {
            ex.key_mut().clear().append_int(i).unwrap();
            ex.set_value(b"x");
            ex.store().unwrap();
        }
        ex.key_mut().clear().append_int(5).unwrap();
        let mut end = Key::new(engine.max_key_len());
        end.append_int(15).unwrap();
        let removed = ex.remove_range(&end).unwrap();
        assert_eq!(removed, 10);
        for i in 0..20i64 {
            ex.key_mut().clear().append_int(i).unwrap();
            assert_eq!(ex.exists().unwrap(), !(5..15).contains(&i), "key {i}");
        }
        engine.close().unwrap();
    }

    #[test]
    fn accumulator_round_trip() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let ex = engine.exchange("main", "t").unwrap();
        engine
            .transact(|txn| {
                ex.accumulator_update(txn, 0, AccumulatorKind::Sum, 7)?;
                ex.accumulator_update(txn, 0, AccumulatorKind::Sum, 3)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            ex.accumulator_snapshot(None, 0, AccumulatorKind::Sum).unwrap(),
            10
        );
        engine.close().unwrap();
    }
}
