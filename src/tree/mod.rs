// # B-Tree
//
// A tree is a named ordered map of byte keys to byte payloads inside one
// volume. The tree layer is value-agnostic: multi-version blobs are
// composed above it and stored here as opaque bytes, inline or chained
// through long-record pages.
//
// A tree's root page id never changes: when the root splits, its halves
// move to two fresh pages and the root grows a level in place. Root ids
// can therefore be recorded once (in the tree directory and TREE_META
// journal records) and never maintained.

pub mod btree;
pub mod longrec;
pub mod node;

use parking_lot::RwLock;

use crate::accumulator::AccumulatorSet;
use crate::common::{PageId, TreeId, VolumeId, MAX_KEY_LEN};
use crate::storage::page::PAGE_HEADER_LEN;

pub use btree::TreeCtx;
pub use node::{LongRef, Node, NodeEntry, Payload};

/// Usable bytes per page.
pub fn body_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_LEN
}

/// Payloads larger than this move to a long-record chain.
pub fn long_record_threshold(page_size: usize) -> usize {
    body_capacity(page_size) / 4
}

/// Encoded key ceiling for a page size. Bounded both by the global limit
/// and by the page geometry, so a handful of worst-case records always
/// share a page.
pub fn max_key_len(page_size: usize) -> usize {
    MAX_KEY_LEN.min(body_capacity(page_size) / 4)
}

/// One named tree. The latch is the tree-level concurrency gate: shared
/// for descents and leaf-local updates, exclusive for structural changes
/// (split, join, clear).
pub struct Tree {
    pub id: TreeId,
    pub name: String,
    pub volume: VolumeId,
    pub root: PageId,
    pub latch: RwLock<()>,
    pub accumulators: AccumulatorSet,
}

impl Tree {
    pub fn new(id: TreeId, name: String, volume: VolumeId, root: PageId) -> Tree {
        Tree {
            id,
            name,
            volume,
            root,
            latch: RwLock::new(()),
            accumulators: AccumulatorSet::new(),
        }
    }
}

/// Directory entry payload: the tree's id and fixed root page.
pub fn encode_dir_value(id: TreeId, root: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&id.0.to_le_bytes());
    out.extend_from_slice(&root.0.to_le_bytes());
    out
}

pub fn decode_dir_value(bytes: &[u8]) -> crate::error::Result<(TreeId, PageId)> {
    if bytes.len() != 12 {
        return Err(crate::error::EngineError::Corrupt(
            "malformed tree directory entry".to_string(),
        ));
    }
    let id = TreeId(u32::from_le_bytes(bytes[0..4].try_into().unwrap()));
    let root = PageId(u64::from_le_bytes(bytes[4..12].try_into().unwrap()));
    Ok((id, root))
}

/// All user trees known to the engine, addressable by global id (the form
/// journal records use) and by (volume, name) (the form the API uses).
/// Per-volume directory trees are not registered here; they are reached
/// through the engine directly.
pub struct TreeRegistry {
    by_id: dashmap::DashMap<TreeId, std::sync::Arc<Tree>>,
    by_name: dashmap::DashMap<(VolumeId, String), TreeId>,
    next_id: std::sync::atomic::AtomicU32,
}

impl TreeRegistry {
    pub fn new() -> TreeRegistry {
        TreeRegistry {
            by_id: dashmap::DashMap::new(),
            by_name: dashmap::DashMap::new(),
            next_id: std::sync::atomic::AtomicU32::new(1),
        }
    }

    pub fn register(&self, tree: std::sync::Arc<Tree>) {
        // Ids are never reused, even across restarts.
        self.next_id
            .fetch_max(tree.id.0 + 1, std::sync::atomic::Ordering::SeqCst);
        self.by_name
            .insert((tree.volume, tree.name.clone()), tree.id);
        self.by_id.insert(tree.id, tree);
    }

    pub fn allocate_id(&self) -> TreeId {
        TreeId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }

    pub fn get(&self, id: TreeId) -> Option<std::sync::Arc<Tree>> {
        self.by_id.get(&id).map(|e| std::sync::Arc::clone(e.value()))
    }

    pub fn by_name(&self, volume: VolumeId, name: &str) -> Option<std::sync::Arc<Tree>> {
        let id = *self.by_name.get(&(volume, name.to_string()))?;
        self.get(id)
    }

    pub fn remove(&self, id: TreeId) {
        if let Some((_, tree)) = self.by_id.remove(&id) {
            self.by_name.remove(&(tree.volume, tree.name.clone()));
        }
    }

    pub fn all(&self) -> Vec<std::sync::Arc<Tree>> {
        self.by_id
            .iter()
            .map(|e| std::sync::Arc::clone(e.value()))
            .collect()
    }
}

impl Default for TreeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_bounds() {
        assert_eq!(body_capacity(1024), 992);
        assert_eq!(long_record_threshold(1024), 248);
        assert_eq!(max_key_len(1024), 248);
        assert_eq!(max_key_len(16384), MAX_KEY_LEN);
    }
}
