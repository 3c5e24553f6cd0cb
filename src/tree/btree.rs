// # B-Tree Operations
//
// Descent and mutation over the node codec. Concurrency contract:
//
// - every operation holds the tree latch: shared for reads and in-place
//   leaf updates, exclusive for anything structural (split, join, clear);
// - page pins order parent before child, and any tree page before the
//   volume header page (taken inside the allocator), so pin waits cannot
//   cycle;
// - a shared-latch update that discovers it needs structure drops
//   everything and re-runs the operation under the exclusive latch.
//
// Payloads are opaque bytes. Anything longer than the long-record
// threshold is spilled to a chain and the leaf stores the reference.

use bytes::Bytes;
use tracing::trace;

use crate::buffer::{BufferPool, PageMut};
use crate::common::{PageId, Timestamp, VolumeId};
use crate::error::{EngineError, Result};
use crate::storage::alloc;
use crate::storage::volume::Volume;
use std::sync::Arc;

use super::node::{LongRef, Node, NodeEntry, Payload};
use super::{body_capacity, long_record_threshold, longrec, Tree};

/// Everything a tree operation needs.
pub struct TreeCtx<'a> {
    pub pool: &'a BufferPool,
    pub volume: &'a Arc<Volume>,
    pub tree: &'a Tree,
}

/// A leaf position remembered by an Exchange between traversal calls.
/// Valid only while the page's version stamp is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHint {
    pub page_id: PageId,
    pub version_stamp: Timestamp,
}

impl<'a> TreeCtx<'a> {
    fn vid(&self) -> VolumeId {
        self.tree.volume
    }

    fn capacity(&self) -> usize {
        body_capacity(self.pool.page_size())
    }

    /// Resolve a leaf payload to full value bytes.
    fn resolve(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Value(v) => Ok(v.clone()),
            Payload::Long(long_ref) => longrec::read_chain(self.pool, self.volume, *long_ref),
            Payload::Child(_) => Err(EngineError::Corrupt(
                "leaf search landed on an index payload".to_string(),
            )),
        }
    }

    /// Descend to the leaf that owns `key`. Caller holds the tree latch.
    fn find_leaf(&self, key: &[u8]) -> Result<PageId> {
        let mut pid = self.tree.root;
        loop {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            let node = Node::decode(pin.bytes())?;
            if node.is_leaf() {
                return Ok(pid);
            }
            pid = node.child_at(node.child_index(key))?;
        }
    }

    // ------------------------------------------------------------------
    // Point reads
    // ------------------------------------------------------------------

    /// Fetch the stored payload for `key`, fully resolved.
    pub fn fetch_raw(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let _latch = self.tree.latch.read();
        let leaf_pid = self.find_leaf(key)?;
        let pin = self.pool.pin_read(self.vid(), leaf_pid)?;
        let node = Node::decode(pin.bytes())?;
        match node.search(key) {
            Ok(pos) => Ok(Some(self.resolve(&node.entries[pos].payload)?)),
            Err(_) => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Store (`Some`) or physically remove (`None`) the payload for `key`.
    /// The write is applied in place when the leaf keeps fitting; otherwise
    /// the operation re-runs under the exclusive latch with splits, and a
    /// shrunken leaf triggers a rebalance pass.
    pub fn store_raw(&self, key: &[u8], value: Option<&[u8]>, ts: Timestamp) -> Result<()> {
        // Spill oversized payloads first so both paths insert a small
        // record. The chain is kept on the abandon path: the structural
        // retry reuses it.
        let payload = match value {
            None => None,
            Some(v) if v.len() > long_record_threshold(self.pool.page_size()) => {
                let latch = self.tree.latch.read();
                let long_ref = longrec::write_chain(self.pool, self.volume, v, ts)?;
                drop(latch);
                Some(Payload::Long(long_ref))
            }
            Some(v) => Some(Payload::Value(Bytes::copy_from_slice(v))),
        };

        let outcome = {
            let _latch = self.tree.latch.read();
            let leaf_pid = self.find_leaf(key)?;
            let mut pin = self.pool.pin_write(self.vid(), leaf_pid)?;
            let mut node = Node::decode(pin.bytes())?;
            let freed = apply_to_leaf(&mut node, key, payload.clone());
            if node.fits(self.pool.page_size()) {
                node.encode_into(pin.bytes_mut(), leaf_pid)?;
                pin.mark_dirty(ts);
                drop(pin);
                self.free_replaced(freed, ts)?;
                let underfull = {
                    let pin = self.pool.pin_read(self.vid(), leaf_pid)?;
                    let node = Node::decode(pin.bytes())?;
                    node.encoded_size() < self.capacity() / 2
                };
                if underfull && leaf_pid != self.tree.root {
                    StoreOutcome::Rebalance
                } else {
                    StoreOutcome::Done
                }
            } else {
                StoreOutcome::Split
            }
        };

        match outcome {
            StoreOutcome::Done => Ok(()),
            StoreOutcome::Split => self.store_structural(key, payload, ts),
            StoreOutcome::Rebalance => self.rebalance(key, ts),
        }
    }

    fn free_replaced(&self, freed: Option<LongRef>, ts: Timestamp) -> Result<()> {
        if let Some(old) = freed {
            longrec::free_chain(self.pool, self.volume, old.head, ts)?;
        }
        Ok(())
    }

    /// Exclusive-latch path: apply the mutation with recursive splits.
    fn store_structural(&self, key: &[u8], payload: Option<Payload>, ts: Timestamp) -> Result<()> {
        let _latch = self.tree.latch.write();
        trace!(tree = %self.tree.id, "structural store");
        let (split, freed) = self.insert_recursive(self.tree.root, key, payload, ts)?;
        if let Some((separator, right_pid)) = split {
            self.grow_root(separator, right_pid, ts)?;
        }
        self.free_replaced(freed, ts)
    }

    /// Returns the (separator, new right page) when `pid` split, plus any
    /// replaced long-record chain to free.
    #[allow(clippy::type_complexity)]
    fn insert_recursive(
        &self,
        pid: PageId,
        key: &[u8],
        payload: Option<Payload>,
        ts: Timestamp,
    ) -> Result<(Option<(Vec<u8>, PageId)>, Option<LongRef>)> {
        let mut pin = self.pool.pin_write(self.vid(), pid)?;
        let mut node = Node::decode(pin.bytes())?;
        if node.is_leaf() {
            let freed = apply_to_leaf(&mut node, key, payload);
            let split = self.write_maybe_split(&mut pin, pid, &mut node, ts)?;
            return Ok((split, freed));
        }
        let child = node.child_at(node.child_index(key))?;
        let (child_split, freed) = self.insert_recursive(child, key, payload, ts)?;
        if let Some((separator, new_child)) = child_split {
            let pos = match node.search(&separator) {
                Ok(_) => {
                    return Err(EngineError::Corrupt(
                        "separator already present in parent".to_string(),
                    ))
                }
                Err(pos) => pos,
            };
            node.entries.insert(
                pos,
                NodeEntry {
                    key: separator,
                    payload: Payload::Child(new_child),
                },
            );
            let split = self.write_maybe_split(&mut pin, pid, &mut node, ts)?;
            return Ok((split, freed));
        }
        Ok((None, freed))
    }

    /// Encode `node` into `pin`, splitting first when it no longer fits.
    fn write_maybe_split(
        &self,
        pin: &mut PageMut<'_>,
        pid: PageId,
        node: &mut Node,
        ts: Timestamp,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        if node.fits(self.pool.page_size()) {
            node.encode_into(pin.bytes_mut(), pid)?;
            pin.mark_dirty(ts);
            return Ok(None);
        }
        let (separator, right) = node.split();
        let mut right_pin =
            alloc::allocate_page(self.pool, self.volume, right.kind, right.level, ts)?;
        let right_pid = right_pin.page_id();
        right.encode_into(right_pin.bytes_mut(), right_pid)?;
        right_pin.mark_dirty(ts);
        drop(right_pin);
        node.right_sibling = right_pid;
        node.encode_into(pin.bytes_mut(), pid)?;
        pin.mark_dirty(ts);
        trace!(tree = %self.tree.id, page = %pid, new_page = %right_pid, "page split");
        Ok(Some((separator, right_pid)))
    }

    /// The root just split in place. Move its left half to a fresh page and
    /// turn the root page into a one-level-higher index over both halves,
    /// keeping the root's page id fixed.
    fn grow_root(&self, separator: Vec<u8>, right_pid: PageId, ts: Timestamp) -> Result<()> {
        let root_pid = self.tree.root;
        let mut root_pin = self.pool.pin_write(self.vid(), root_pid)?;
        let left = Node::decode(root_pin.bytes())?;
        let mut left_pin = alloc::allocate_page(self.pool, self.volume, left.kind, left.level, ts)?;
        let left_pid = left_pin.page_id();
        left.encode_into(left_pin.bytes_mut(), left_pid)?;
        left_pin.mark_dirty(ts);
        drop(left_pin);

        let mut new_root = Node::new_index(left.level + 1);
        new_root.entries.push(NodeEntry {
            key: Vec::new(),
            payload: Payload::Child(left_pid),
        });
        new_root.entries.push(NodeEntry {
            key: separator,
            payload: Payload::Child(right_pid),
        });
        new_root.encode_into(root_pin.bytes_mut(), root_pid)?;
        root_pin.mark_dirty(ts);
        trace!(tree = %self.tree.id, level = new_root.level, "root grew a level");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebalance
    // ------------------------------------------------------------------

    /// Join or redistribute underfull pages along the path to `key`, then
    /// collapse single-child root levels.
    fn rebalance(&self, key: &[u8], ts: Timestamp) -> Result<()> {
        let _latch = self.tree.latch.write();
        self.rebalance_level(self.tree.root, key, ts)?;
        self.collapse_root(ts)
    }

    fn rebalance_level(&self, pid: PageId, key: &[u8], ts: Timestamp) -> Result<()> {
        let child_pid = {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            let node = Node::decode(pin.bytes())?;
            if node.is_leaf() {
                return Ok(());
            }
            node.child_at(node.child_index(key))?
        };
        self.rebalance_level(child_pid, key, ts)?;

        let mut parent_pin = self.pool.pin_write(self.vid(), pid)?;
        let mut parent = Node::decode(parent_pin.bytes())?;
        let ci = parent.child_index(key);
        let child = parent.child_at(ci)?;
        let child_size = {
            let pin = self.pool.pin_read(self.vid(), child)?;
            Node::decode(pin.bytes())?.encoded_size()
        };
        if child_size * 2 >= self.capacity() {
            return Ok(());
        }
        let pair_left = if ci + 1 < parent.entries.len() {
            ci
        } else if ci > 0 {
            ci - 1
        } else {
            // Single child; the collapse pass deals with it.
            return Ok(());
        };
        self.merge_or_redistribute(&mut parent, pair_left, ts)?;
        parent.encode_into(parent_pin.bytes_mut(), pid)?;
        parent_pin.mark_dirty(ts);
        Ok(())
    }

    /// Combine children `li` and `li+1` of `parent`: into one page when the
    /// union fits, otherwise re-split evenly. The caller re-encodes parent.
    fn merge_or_redistribute(&self, parent: &mut Node, li: usize, ts: Timestamp) -> Result<()> {
        let l_pid = parent.child_at(li)?;
        let r_pid = parent.child_at(li + 1)?;
        let mut l_pin = self.pool.pin_write(self.vid(), l_pid)?;
        let mut left = Node::decode(l_pin.bytes())?;
        let mut r_pin = self.pool.pin_write(self.vid(), r_pid)?;
        let mut right = Node::decode(r_pin.bytes())?;
        let right_tail = right.right_sibling;
        if !right.is_leaf() {
            // Restore the separator over the right node's low sentinel so
            // the combined entry list carries real keys.
            right.entries[0].key = parent.entries[li + 1].key.clone();
        }
        left.entries.append(&mut right.entries);
        left.right_sibling = right_tail;

        // Merge outright when the union fits comfortably.
        if left.encoded_size() <= self.capacity() * 9 / 10 {
            left.encode_into(l_pin.bytes_mut(), l_pid)?;
            l_pin.mark_dirty(ts);
            drop(r_pin);
            drop(l_pin);
            alloc::free_page(self.pool, self.volume, r_pid, ts)?;
            parent.entries.remove(li + 1);
            trace!(tree = %self.tree.id, left = %l_pid, right = %r_pid, "pages joined");
            return Ok(());
        }

        // Redistribute: split the union evenly across both pages. The new
        // separator may be longer than the old one, so bail out before
        // touching any page if the parent would stop fitting; an underfull
        // child is a space nuisance, not a correctness problem.
        let (separator, new_right) = left.split();
        let old_separator = std::mem::replace(&mut parent.entries[li + 1].key, separator);
        if !parent.fits(self.pool.page_size()) {
            parent.entries[li + 1].key = old_separator;
            return Ok(());
        }
        left.right_sibling = r_pid;
        left.encode_into(l_pin.bytes_mut(), l_pid)?;
        l_pin.mark_dirty(ts);
        new_right.encode_into(r_pin.bytes_mut(), r_pid)?;
        r_pin.mark_dirty(ts);
        trace!(tree = %self.tree.id, left = %l_pid, right = %r_pid, "pages redistributed");
        Ok(())
    }

    /// While the root is an index with a single child, pull that child's
    /// content up into the root page and free the child.
    fn collapse_root(&self, ts: Timestamp) -> Result<()> {
        loop {
            let mut root_pin = self.pool.pin_write(self.vid(), self.tree.root)?;
            let root = Node::decode(root_pin.bytes())?;
            if root.is_leaf() || root.entries.len() > 1 {
                return Ok(());
            }
            let child_pid = root.child_at(0)?;
            let child = {
                let child_pin = self.pool.pin_read(self.vid(), child_pid)?;
                Node::decode(child_pin.bytes())?
            };
            child.encode_into(root_pin.bytes_mut(), self.tree.root)?;
            root_pin.mark_dirty(ts);
            drop(root_pin);
            alloc::free_page(self.pool, self.volume, child_pid, ts)?;
            trace!(tree = %self.tree.id, "root collapsed a level");
        }
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// First key strictly after (or at, when `inclusive`) `bound`, with its
    /// resolved payload and a leaf hint for the next call.
    #[allow(clippy::type_complexity)]
    pub fn next_entry(
        &self,
        bound: &[u8],
        inclusive: bool,
        hint: Option<LeafHint>,
    ) -> Result<(Option<(Vec<u8>, Bytes)>, Option<LeafHint>)> {
        let _latch = self.tree.latch.read();
        let mut pid = match self.hinted_leaf(bound, hint) {
            Some(pid) => pid,
            None => self.find_leaf(bound)?,
        };
        loop {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            let node = Node::decode(pin.bytes())?;
            let start = match node.search(bound) {
                Ok(pos) if inclusive => pos,
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            };
            if let Some(entry) = node.entries.get(start) {
                let hint = LeafHint {
                    page_id: pid,
                    version_stamp: node.version_stamp,
                };
                let value = self.resolve(&entry.payload)?;
                return Ok((Some((entry.key.clone(), value)), Some(hint)));
            }
            if node.right_sibling.is_none() {
                return Ok((None, None));
            }
            pid = node.right_sibling;
        }
    }

    /// Check a remembered leaf: still a leaf, same version, and its low key
    /// at or below the bound. Any mismatch falls back to a root descent.
    fn hinted_leaf(&self, bound: &[u8], hint: Option<LeafHint>) -> Option<PageId> {
        let hint = hint?;
        let pin = self.pool.pin_read(self.vid(), hint.page_id).ok()?;
        let node = Node::decode(pin.bytes()).ok()?;
        if !node.is_leaf() || node.version_stamp != hint.version_stamp {
            return None;
        }
        let first = node.entries.first()?;
        if first.key.as_slice() <= bound {
            Some(hint.page_id)
        } else {
            None
        }
    }

    /// Last key strictly before (or at, when `inclusive`) `bound`.
    pub fn prev_entry(
        &self,
        bound: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        let _latch = self.tree.latch.read();
        self.prev_in_subtree(self.tree.root, bound, inclusive)
    }

    fn prev_in_subtree(
        &self,
        pid: PageId,
        bound: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        let pin = self.pool.pin_read(self.vid(), pid)?;
        let node = Node::decode(pin.bytes())?;
        if node.is_leaf() {
            for entry in node.entries.iter().rev() {
                let ok = match entry.key.as_slice().cmp(bound) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => inclusive,
                    std::cmp::Ordering::Greater => false,
                };
                if ok {
                    let value = self.resolve(&entry.payload)?;
                    return Ok(Some((entry.key.clone(), value)));
                }
            }
            return Ok(None);
        }
        let start = node.child_index(bound);
        for ci in (0..=start).rev() {
            let child = node.child_at(ci)?;
            if let Some(found) = self.prev_in_subtree(child, bound, inclusive)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Every entry in key order, resolved. Directory scans and tests.
    pub fn scan_all(&self) -> Result<Vec<(Vec<u8>, Bytes)>> {
        let _latch = self.tree.latch.read();
        let mut out = Vec::new();
        let mut pid = self.leftmost_leaf()?;
        loop {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            let node = Node::decode(pin.bytes())?;
            for entry in &node.entries {
                out.push((entry.key.clone(), self.resolve(&entry.payload)?));
            }
            if node.right_sibling.is_none() {
                return Ok(out);
            }
            pid = node.right_sibling;
        }
    }

    fn leftmost_leaf(&self) -> Result<PageId> {
        let mut pid = self.tree.root;
        loop {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            let node = Node::decode(pin.bytes())?;
            if node.is_leaf() {
                return Ok(pid);
            }
            pid = node.child_at(0)?;
        }
    }

    // ------------------------------------------------------------------
    // Whole-tree maintenance
    // ------------------------------------------------------------------

    /// Free every page except the root and reset the root to an empty
    /// leaf. Tree removal then frees the root separately.
    pub fn clear(&self, ts: Timestamp) -> Result<()> {
        let _latch = self.tree.latch.write();
        let root = {
            let pin = self.pool.pin_read(self.vid(), self.tree.root)?;
            Node::decode(pin.bytes())?
        };
        self.free_entries(&root, ts)?;
        let mut pin = self.pool.pin_write(self.vid(), self.tree.root)?;
        let empty = Node::new_leaf();
        empty.encode_into(pin.bytes_mut(), self.tree.root)?;
        pin.mark_dirty(ts);
        Ok(())
    }

    fn free_subtree(&self, pid: PageId, ts: Timestamp) -> Result<()> {
        let node = {
            let pin = self.pool.pin_read(self.vid(), pid)?;
            Node::decode(pin.bytes())?
        };
        self.free_entries(&node, ts)?;
        alloc::free_page(self.pool, self.volume, pid, ts)
    }

    fn free_entries(&self, node: &Node, ts: Timestamp) -> Result<()> {
        for entry in &node.entries {
            match &entry.payload {
                Payload::Child(child) => self.free_subtree(*child, ts)?,
                Payload::Long(long_ref) => {
                    longrec::free_chain(self.pool, self.volume, long_ref.head, ts)?
                }
                Payload::Value(_) => {}
            }
        }
        Ok(())
    }
}

enum StoreOutcome {
    Done,
    Split,
    Rebalance,
}

/// Insert, replace, or remove `key` in a decoded leaf. Returns a replaced
/// or removed long-record reference for the caller to free.
fn apply_to_leaf(node: &mut Node, key: &[u8], payload: Option<Payload>) -> Option<LongRef> {
    match (node.search(key), payload) {
        (Ok(pos), Some(payload)) => {
            let old = take_long_ref(&node.entries[pos].payload);
            node.entries[pos].payload = payload;
            old
        }
        (Ok(pos), None) => {
            let old = take_long_ref(&node.entries[pos].payload);
            node.entries.remove(pos);
            old
        }
        (Err(pos), Some(payload)) => {
            node.entries.insert(
                pos,
                NodeEntry {
                    key: key.to_vec(),
                    payload,
                },
            );
            None
        }
        (Err(_), None) => None,
    }
}

fn take_long_ref(payload: &Payload) -> Option<LongRef> {
    match payload {
        Payload::Long(long_ref) => Some(*long_ref),
        _ => None,
    }
}
