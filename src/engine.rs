// # Engine
//
// The one process-wide handle. Owns the volume set, the buffer pool, the
// journal, the transaction manager, and the tree registry; every subsystem
// hangs off it and background maintenance (checkpoints, journal copy-back,
// accumulator pruning) runs on threads it spawns at open and joins at
// close.
//
// Open sequence: validate configuration, scan the journal for the newest
// checkpoint, open volumes (refusing any whose header stamp is ahead of
// the journal), build the pool with the WAL gate off, rebuild the tree
// registry from the volume directories, seed accumulators from the
// checkpoint, replay the journal, start the writer on a fresh generation,
// write a recovery checkpoint, and finally start background threads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::accumulator::AccumulatorKind;
use crate::buffer::BufferPool;
use crate::common::{CancelToken, PageId, Timestamp, TreeId, TxnId, VolumeId};
use crate::config::{CommitPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::journal::record::{AccumulatorSnapshot, CheckpointRecord, JournalRecord};
use crate::journal::{copyback, recovery, Journal};
use crate::key::{Key, Segment};
use crate::storage::alloc;
use crate::storage::page::PageKind;
use crate::storage::volume::{Volume, VolumeHeader, VolumeSet};
use crate::tree::btree::LeafHint;
use crate::tree::{self, Tree, TreeCtx, TreeRegistry};
use crate::txn::retry::RetryPolicy;
use crate::txn::transaction::{Transaction, TxnStatus};
use crate::txn::{mvv, TxnManager};

struct Shutdown {
    stop: Mutex<bool>,
    cv: Condvar,
}

impl Shutdown {
    fn new() -> Shutdown {
        Shutdown {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Wait up to `timeout`; true once shutdown has been signalled.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stop = self.stop.lock();
        if *stop {
            return true;
        }
        self.cv.wait_for(&mut stop, timeout);
        *stop
    }

    fn signal(&self) {
        *self.stop.lock() = true;
        self.cv.notify_all();
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    cancel: CancelToken,
    fatal: Arc<AtomicBool>,
    closed: AtomicBool,
    volumes: Arc<VolumeSet>,
    pool: Arc<BufferPool>,
    journal: Arc<Journal>,
    txns: TxnManager,
    registry: TreeRegistry,
    dir_trees: DashMap<VolumeId, Arc<Tree>>,
    tree_admin_lock: Mutex<()>,
    checkpoint_lock: Mutex<()>,
    checkpoint_seq: AtomicU64,
    retry: RetryPolicy,
    shutdown: Shutdown,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// The public engine handle. Cheap to clone; the engine closes when
/// `close` is called, not when handles drop.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    // ------------------------------------------------------------------
    // Open / recovery
    // ------------------------------------------------------------------

    pub fn open(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        std::fs::create_dir_all(&config.journal_path)?;

        let cancel = CancelToken::new();
        let fatal = Arc::new(AtomicBool::new(false));

        // 1. Journal scan: newest checkpoint and the generation to
        //    continue at.
        let scan = recovery::scan(&config.journal_path, &config.journal_prefix)?;
        let base_ts = scan
            .last_checkpoint
            .as_ref()
            .map(|cp| cp.base_timestamp)
            .unwrap_or(0);

        // 2. Volumes, with the stamp check against the checkpoint.
        let volumes = Arc::new(VolumeSet::new());
        for (index, spec) in config.volumes.iter().enumerate() {
            let id = VolumeId(index as u16);
            let (volume, created) = Volume::open_or_create(id, spec, config.page_size)?;
            if !created {
                let header = volume.read_header()?;
                let recorded = scan
                    .last_checkpoint
                    .as_ref()
                    .and_then(|cp| {
                        cp.volume_stamps
                            .iter()
                            .find(|(v, _)| *v == id)
                            .map(|(_, stamp)| *stamp)
                    })
                    .unwrap_or(0);
                if header.version_stamp > recorded {
                    return Err(EngineError::Corrupt(format!(
                        "volume {} has stamp {} but the journal records {recorded}; \
                         the journal for this volume is missing or stale",
                        spec.name, header.version_stamp
                    )));
                }
            }
            volumes.add(volume);
        }

        let journal = Journal::new(
            config.journal_path.clone(),
            config.journal_prefix.clone(),
            config.page_size,
            config.journal_file_max_size,
            config.soft_flush_interval,
            config.append_only,
            cancel.clone(),
            Arc::clone(&fatal),
        );
        if let Some(cp) = scan.last_checkpoint.clone() {
            journal.set_last_checkpoint(cp);
        }

        // 3. Pool with the WAL gate off: recovery writebacks go straight
        //    to the volumes, their records being durable by definition.
        let pool = BufferPool::new(
            config.page_size,
            config.pool_size.frames(config.page_size),
            Arc::clone(&journal),
            Arc::clone(&volumes),
            Arc::clone(&fatal),
            cancel.clone(),
        );

        let retry = RetryPolicy::new(config.txn_retry_cap);
        let inner = Arc::new(EngineInner {
            config,
            cancel,
            fatal,
            closed: AtomicBool::new(false),
            volumes,
            pool,
            journal,
            txns: TxnManager::new(base_ts, 1),
            registry: TreeRegistry::new(),
            dir_trees: DashMap::new(),
            tree_admin_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            checkpoint_seq: AtomicU64::new(
                scan.last_checkpoint
                    .as_ref()
                    .map(|cp| cp.checkpoint_id + 1)
                    .unwrap_or(1),
            ),
            retry,
            shutdown: Shutdown::new(),
            background: Mutex::new(Vec::new()),
        });
        let engine = Engine { inner };

        // 4. Directory trees and registry from the pre-replay volume
        //    state.
        for volume in engine.inner.volumes.all() {
            let dir_tree = Arc::new(Tree::new(
                TreeId::DIRECTORY,
                "_directory".to_string(),
                volume.id(),
                PageId::DIRECTORY_ROOT,
            ));
            engine.inner.dir_trees.insert(volume.id(), dir_tree);
            engine.load_directory(volume.id())?;
        }

        // 5. Accumulator bases from the checkpoint.
        if let Some(cp) = &scan.last_checkpoint {
            for snap in &cp.accumulators {
                match engine.inner.registry.get(snap.tree) {
                    Some(t) => t.accumulators.restore(snap, cp.base_timestamp),
                    None => warn!(tree = %snap.tree, "checkpoint accumulator for unknown tree"),
                }
            }
        }

        // 6. Replay everything after the checkpoint.
        if scan.journal_present {
            engine.replay_journal(base_ts)?;
        }

        // 7. Normal operation: writer on, WAL gate on, recovery
        //    checkpoint, background threads.
        engine.inner.journal.start(scan.next_generation)?;
        engine.inner.pool.set_wal_enabled(true);
        engine.checkpoint()?;
        if engine.inner.config.buffer_preload_enabled {
            engine.preload_inventory();
        }
        engine.spawn_background();
        info!(ts = engine.inner.txns.current_ts(), "engine open");
        Ok(engine)
    }

    /// Read every directory entry of a volume into the registry.
    fn load_directory(&self, volume_id: VolumeId) -> Result<()> {
        let volume = self.inner.volumes.get(volume_id)?;
        let dir_tree = self.dir_tree(volume_id)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree: &dir_tree,
        };
        for (key_bytes, value) in ctx.scan_all()? {
            let (id, root) = tree::decode_dir_value(&value)?;
            let name = directory_entry_name(&key_bytes)?;
            self.inner
                .registry
                .register(Arc::new(Tree::new(id, name, volume_id, root)));
        }
        Ok(())
    }

    fn replay_journal(&self, base_ts: Timestamp) -> Result<()> {
        struct PendingTxn {
            writes: Vec<(TreeId, Bytes, Option<Bytes>)>,
            accums: Vec<(TreeId, u8, AccumulatorKind, i64)>,
        }
        let mut pending: HashMap<TxnId, PendingTxn> = HashMap::new();
        let mut max_ct = base_ts;
        let mut max_txn_id = 0u64;
        let mut max_page: HashMap<VolumeId, u64> = HashMap::new();
        let mut committed = 0u64;

        recovery::replay_after(
            &self.inner.config.journal_path,
            &self.inner.config.journal_prefix,
            base_ts,
            |scanned| {
                let ts = scanned.timestamp;
                match scanned.record {
                    JournalRecord::PageImage {
                        volume,
                        page_id,
                        image,
                    } => {
                        let vol = self.inner.volumes.get(volume).map_err(|_| {
                            EngineError::Recovery(format!(
                                "page image references unknown volume {volume}"
                            ))
                        })?;
                        vol.ensure_capacity(page_id)?;
                        self.inner.pool.restore_page(volume, page_id, ts, &image)?;
                        let entry = max_page.entry(volume).or_insert(0);
                        *entry = (*entry).max(page_id.0);
                    }
                    JournalRecord::TxnBegin { txn_id } => {
                        max_txn_id = max_txn_id.max(txn_id);
                    }
                    JournalRecord::TxnUpdate {
                        txn_id,
                        tree,
                        key,
                        value,
                    } => {
                        max_txn_id = max_txn_id.max(txn_id);
                        pending
                            .entry(txn_id)
                            .or_insert_with(|| PendingTxn {
                                writes: Vec::new(),
                                accums: Vec::new(),
                            })
                            .writes
                            .push((tree, key, value));
                    }
                    JournalRecord::AccumulatorUpdate {
                        txn_id,
                        tree,
                        slot,
                        kind,
                        arg,
                    } => {
                        max_txn_id = max_txn_id.max(txn_id);
                        pending
                            .entry(txn_id)
                            .or_insert_with(|| PendingTxn {
                                writes: Vec::new(),
                                accums: Vec::new(),
                            })
                            .accums
                            .push((tree, slot, kind, arg));
                    }
                    JournalRecord::TxnRollback { txn_id } => {
                        max_txn_id = max_txn_id.max(txn_id);
                        pending.remove(&txn_id);
                    }
                    JournalRecord::TxnCommit { txn_id } => {
                        // A TXN_BEGIN carries the read timestamp and may
                        // fall below the replay cutoff even though the
                        // commit lands above it, so every record type that
                        // names a transaction feeds the id watermark.
                        max_txn_id = max_txn_id.max(txn_id);
                        if let Some(txn) = pending.remove(&txn_id) {
                            for (tree_id, key, value) in txn.writes {
                                self.replay_write(tree_id, &key, value.as_deref(), ts)?;
                            }
                            for (tree_id, slot, kind, arg) in txn.accums {
                                let tree = self.inner.registry.get(tree_id).ok_or_else(|| {
                                    EngineError::Recovery(format!(
                                        "committed transaction {txn_id} references unknown tree {tree_id}"
                                    ))
                                })?;
                                tree.accumulators.publish(slot, kind, ts, arg)?;
                            }
                            committed += 1;
                        }
                        max_ct = max_ct.max(ts);
                    }
                    JournalRecord::TreeMeta {
                        volume,
                        tree,
                        name,
                        root,
                        accumulators,
                    } => {
                        self.replay_tree_meta(volume, tree, &name, root, &accumulators, ts)?;
                    }
                    JournalRecord::Checkpoint(_) => {}
                }
                Ok(())
            },
        )?;

        if !pending.is_empty() {
            debug!(
                discarded = pending.len(),
                "recovery discarded transactions without commit records"
            );
        }

        // Allocation watermarks may lag the newest page images.
        for (volume_id, max_pid) in max_page {
            let volume = self.inner.volumes.get(volume_id)?;
            let mut header = self.inner.pool.pin_write(volume_id, PageId::HEADER)?;
            let mut vh = VolumeHeader::decode(volume.page_size(), header.bytes())?;
            if vh.next_page_id <= max_pid {
                vh.next_page_id = max_pid + 1;
                vh.encode(volume.page_size(), header.bytes_mut());
                header.mark_dirty(max_ct);
            }
        }

        // Timestamps and transaction ids continue above everything seen.
        self.inner.txns.publish_range(max_ct, max_txn_id + 1);
        info!(committed, ts = max_ct, "journal replay finished");
        Ok(())
    }

    /// Redo one committed write at its original commit timestamp.
    /// Idempotent: the multi-version insert replaces on an equal stamp.
    fn replay_write(
        &self,
        tree_id: TreeId,
        key: &[u8],
        value: Option<&[u8]>,
        ct: Timestamp,
    ) -> Result<()> {
        let tree = self.inner.registry.get(tree_id).ok_or_else(|| {
            EngineError::Recovery(format!("committed write references unknown tree {tree_id}"))
        })?;
        self.apply_version(&tree, key, value, ct)
    }

    fn replay_tree_meta(
        &self,
        volume_id: VolumeId,
        tree_id: TreeId,
        name: &str,
        root: PageId,
        accumulators: &[AccumulatorSnapshot],
        ts: Timestamp,
    ) -> Result<()> {
        let volume = self.inner.volumes.get(volume_id)?;
        let dir_tree = self.dir_tree(volume_id)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree: &dir_tree,
        };
        let dkey = directory_key(name, self.max_key_len())?;
        if root.is_none() {
            ctx.store_raw(&dkey, None, ts)?;
            self.inner.registry.remove(tree_id);
        } else {
            ctx.store_raw(&dkey, Some(&tree::encode_dir_value(tree_id, root)), ts)?;
            if self.inner.registry.get(tree_id).is_none() {
                self.inner.registry.register(Arc::new(Tree::new(
                    tree_id,
                    name.to_string(),
                    volume_id,
                    root,
                )));
            }
            if let Some(tree) = self.inner.registry.get(tree_id) {
                for snap in accumulators {
                    tree.accumulators.restore(snap, ts);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handles and trees
    // ------------------------------------------------------------------

    pub fn max_key_len(&self) -> usize {
        tree::max_key_len(self.inner.config.page_size)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn is_writable(&self) -> bool {
        !self.inner.fatal.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(EngineError::EngineClosed)
        }
    }

    fn dir_tree(&self, volume: VolumeId) -> Result<Arc<Tree>> {
        self.inner
            .dir_trees
            .get(&volume)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::Config(format!("unknown volume {volume}")))
    }

    /// An Exchange over `tree_name` in `volume_name`, creating the tree on
    /// first use.
    pub fn exchange(&self, volume_name: &str, tree_name: &str) -> Result<crate::exchange::Exchange> {
        let volume = self
            .inner
            .volumes
            .by_name(volume_name)
            .ok_or_else(|| EngineError::Config(format!("unknown volume \"{volume_name}\"")))?;
        let tree = self.create_tree(volume.id(), tree_name)?;
        Ok(crate::exchange::Exchange::new(self.clone(), tree))
    }

    pub(crate) fn create_tree(&self, volume_id: VolumeId, name: &str) -> Result<Arc<Tree>> {
        if name.starts_with('_') {
            return Err(EngineError::Config(format!(
                "tree name \"{name}\" is reserved"
            )));
        }
        if let Some(tree) = self.inner.registry.by_name(volume_id, name) {
            return Ok(tree);
        }
        self.check_writable()?;
        let _admin = self.inner.tree_admin_lock.lock();
        if let Some(tree) = self.inner.registry.by_name(volume_id, name) {
            return Ok(tree);
        }
        let volume = self.inner.volumes.get(volume_id)?;
        let ts = self.inner.txns.current_ts();
        let id = self.inner.registry.allocate_id();
        let root = alloc::allocate_page(&self.inner.pool, &volume, PageKind::Data, 0, ts)?.page_id();
        let dir_tree = self.dir_tree(volume_id)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree: &dir_tree,
        };
        let dkey = directory_key(name, self.max_key_len())?;
        ctx.store_raw(&dkey, Some(&tree::encode_dir_value(id, root)), ts)?;
        let tree = Arc::new(Tree::new(id, name.to_string(), volume_id, root));
        if !volume.is_temporary() {
            self.inner.journal.append_and_wait(
                &JournalRecord::TreeMeta {
                    volume: volume_id,
                    tree: id,
                    name: name.to_string(),
                    root,
                    // No slots are bound yet; the seed list records that.
                    accumulators: tree.accumulators.checkpoint_snapshot(id, ts),
                },
                ts,
            )?;
        }
        self.inner.registry.register(Arc::clone(&tree));
        info!(volume = %volume_id, tree = %id, name, "tree created");
        Ok(tree)
    }

    /// Remove a tree and schedule all its pages to the free list.
    pub fn remove_tree(&self, volume_name: &str, name: &str) -> Result<bool> {
        self.check_writable()?;
        let volume = self
            .inner
            .volumes
            .by_name(volume_name)
            .ok_or_else(|| EngineError::Config(format!("unknown volume \"{volume_name}\"")))?;
        let _admin = self.inner.tree_admin_lock.lock();
        let Some(tree) = self.inner.registry.by_name(volume.id(), name) else {
            return Ok(false);
        };
        let ts = self.inner.txns.current_ts();
        {
            let ctx = TreeCtx {
                pool: &self.inner.pool,
                volume: &volume,
                tree: &tree,
            };
            ctx.clear(ts)?;
        }
        alloc::free_page(&self.inner.pool, &volume, tree.root, ts)?;
        let dir_tree = self.dir_tree(volume.id())?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree: &dir_tree,
        };
        let dkey = directory_key(name, self.max_key_len())?;
        ctx.store_raw(&dkey, None, ts)?;
        if !volume.is_temporary() {
            self.inner.journal.append_and_wait(
                &JournalRecord::TreeMeta {
                    volume: volume.id(),
                    tree: tree.id,
                    name: name.to_string(),
                    root: PageId::NONE,
                    accumulators: tree.accumulators.checkpoint_snapshot(tree.id, ts),
                },
                ts,
            )?;
        }
        self.inner.registry.remove(tree.id);
        info!(volume = %volume.id(), tree = %tree.id, name, "tree removed");
        Ok(true)
    }

    /// Names of the trees in a volume, sorted.
    pub fn tree_names(&self, volume_name: &str) -> Result<Vec<String>> {
        let volume = self
            .inner
            .volumes
            .by_name(volume_name)
            .ok_or_else(|| EngineError::Config(format!("unknown volume \"{volume_name}\"")))?;
        let mut names: Vec<String> = self
            .inner
            .registry
            .all()
            .into_iter()
            .filter(|t| t.volume == volume.id())
            .map(|t| t.name.clone())
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Create an ephemeral volume. Its trees bypass the journal and the
    /// whole file is deleted at close.
    pub fn create_temporary_volume(&self, name: &str) -> Result<String> {
        self.check_writable()?;
        let _admin = self.inner.tree_admin_lock.lock();
        if self.inner.volumes.by_name(name).is_some() {
            return Err(EngineError::Config(format!(
                "volume \"{name}\" already exists"
            )));
        }
        let dir = self
            .inner
            .config
            .tmp_vol_dir
            .clone()
            .unwrap_or_else(|| self.inner.config.journal_path.clone());
        let id = self.inner.volumes.next_id();
        let volume = Volume::create_temporary(
            id,
            name,
            &dir,
            self.inner.config.page_size,
            self.inner.config.tmp_vol_max_pages,
        )?;
        self.inner.volumes.add(Arc::clone(&volume));
        let dir_tree = Arc::new(Tree::new(
            TreeId::DIRECTORY,
            "_directory".to_string(),
            id,
            PageId::DIRECTORY_ROOT,
        ));
        self.inner.dir_trees.insert(id, dir_tree);
        Ok(name.to_string())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&self) -> Transaction {
        self.inner.txns.begin()
    }

    /// Run `body` with begin/commit and automatic retry on write
    /// conflicts, up to the configured cap.
    pub fn transact<T>(&self, mut body: impl FnMut(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            self.inner.cancel.check()?;
            let mut txn = self.begin_transaction();
            let outcome = body(&mut txn);
            match outcome {
                Ok(value) => match self.commit(txn) {
                    Ok(()) => return Ok(value),
                    Err(e) if e.is_retryable() => {
                        attempt += 1;
                        if self.inner.retry.exhausted(attempt) {
                            return Err(EngineError::TransactionFailed(attempt));
                        }
                        std::thread::sleep(self.inner.retry.backoff(attempt));
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    let _ = self.rollback(txn);
                    if e.is_retryable() {
                        attempt += 1;
                        if self.inner.retry.exhausted(attempt) {
                            return Err(EngineError::TransactionFailed(attempt));
                        }
                        std::thread::sleep(self.inner.retry.backoff(attempt));
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Optimistic commit: validate the read set, journal, apply, publish.
    pub fn commit(&self, mut txn: Transaction) -> Result<()> {
        txn.check_active()?;
        if txn.is_read_only() {
            txn.status = TxnStatus::Committed;
            self.inner.txns.deregister(txn.id);
            return Ok(());
        }
        self.check_writable()?;

        let guard = self.inner.txns.commit_lock();

        // Validation: any key this transaction read that now has a newer
        // committed version means it acted on a stale snapshot.
        let mut conflicted = false;
        for ((tree_id, key), _observed) in txn.reads.iter() {
            if let Some(latest) = self.latest_version_ts(*tree_id, key)? {
                if latest > txn.read_ts {
                    conflicted = true;
                    break;
                }
            }
        }
        if conflicted {
            drop(guard);
            let read_ts = txn.read_ts;
            self.rollback_for_conflict(txn)?;
            return Err(EngineError::Rollback { read_ts });
        }

        let ct = self.inner.txns.next_commit_ts();
        let policy = txn.commit_policy.unwrap_or(self.inner.config.commit_policy);
        let sync = policy != CommitPolicy::Soft;

        // Journal first. All records of one commit enter the queue under
        // the commit lock, so commit order in the file equals timestamp
        // order.
        let journaled = (|| -> Result<u64> {
            self.inner
                .journal
                .append(&JournalRecord::TxnBegin { txn_id: txn.id }, txn.read_ts)?;
            for ((tree_id, key), value) in txn.writes.iter() {
                if self.tree_is_temporary(*tree_id)? {
                    continue;
                }
                self.inner.journal.append(
                    &JournalRecord::TxnUpdate {
                        txn_id: txn.id,
                        tree: *tree_id,
                        key: Bytes::copy_from_slice(key),
                        value: value.clone(),
                    },
                    ct,
                )?;
            }
            for ((tree_id, slot), delta) in txn.accums.iter() {
                if delta.is_noop() || self.tree_is_temporary(*tree_id)? {
                    continue;
                }
                self.inner.journal.append(
                    &JournalRecord::AccumulatorUpdate {
                        txn_id: txn.id,
                        tree: *tree_id,
                        slot: *slot,
                        kind: delta.kind,
                        arg: delta.commit_arg(),
                    },
                    ct,
                )?;
            }
            if sync {
                self.inner
                    .journal
                    .append_sync(&JournalRecord::TxnCommit { txn_id: txn.id }, ct)
            } else {
                self.inner
                    .journal
                    .append(&JournalRecord::TxnCommit { txn_id: txn.id }, ct)
            }
        })();
        let commit_seq = match journaled {
            Ok(seq) => seq,
            Err(e) => {
                self.inner.txns.deregister(txn.id);
                return Err(e);
            }
        };

        // Apply. A failure here means a journaled commit cannot take
        // effect; the engine is no longer trustworthy for writes.
        let apply = || -> Result<()> {
            for ((tree_id, key), value) in txn.writes.iter() {
                let tree = self.inner.registry.get(*tree_id).ok_or_else(|| {
                    EngineError::InvariantViolation(format!("commit against removed tree {tree_id}"))
                })?;
                self.apply_version(&tree, key, value.as_deref(), ct)?;
            }
            for ((tree_id, slot), delta) in txn.accums.iter() {
                if delta.is_noop() {
                    continue;
                }
                let tree = self.inner.registry.get(*tree_id).ok_or_else(|| {
                    EngineError::InvariantViolation(format!("commit against removed tree {tree_id}"))
                })?;
                tree.accumulators
                    .publish(*slot, delta.kind, ct, delta.commit_arg())?;
            }
            Ok(())
        };
        if let Err(e) = apply() {
            self.inner.fatal.store(true, Ordering::SeqCst);
            self.inner.txns.deregister(txn.id);
            return Err(e);
        }

        self.inner.txns.publish_commit(ct);
        txn.status = TxnStatus::Committed;
        self.inner.txns.deregister(txn.id);
        drop(guard);

        // Durability contract. SOFT returns now and the writer flushes
        // within its bounded delay; HARD and GROUP wait for the fsync
        // covering this commit.
        if sync {
            self.inner.journal.wait_durable(commit_seq)?;
        }
        Ok(())
    }

    pub fn rollback(&self, mut txn: Transaction) -> Result<()> {
        if txn.status != TxnStatus::Active {
            return Ok(());
        }
        if !txn.is_read_only() && self.is_writable() {
            let _ = self.inner.journal.append(
                &JournalRecord::TxnRollback { txn_id: txn.id },
                self.inner.txns.current_ts(),
            );
        }
        txn.status = TxnStatus::RolledBack;
        self.inner.txns.deregister(txn.id);
        Ok(())
    }

    fn rollback_for_conflict(&self, mut txn: Transaction) -> Result<()> {
        let _ = self.inner.journal.append(
            &JournalRecord::TxnRollback { txn_id: txn.id },
            self.inner.txns.current_ts(),
        );
        txn.status = TxnStatus::RolledBack;
        self.inner.txns.deregister(txn.id);
        Ok(())
    }

    fn tree_is_temporary(&self, tree_id: TreeId) -> Result<bool> {
        let tree = self.inner.registry.get(tree_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("operation on removed tree {tree_id}"))
        })?;
        Ok(self.inner.volumes.get(tree.volume)?.is_temporary())
    }

    // ------------------------------------------------------------------
    // Reads and writes on behalf of Exchanges
    // ------------------------------------------------------------------

    fn tree_ctx_parts(&self, tree: &Arc<Tree>) -> Result<Arc<Volume>> {
        if self.inner.registry.get(tree.id).is_none() {
            return Err(EngineError::Config(format!(
                "tree \"{}\" was removed",
                tree.name
            )));
        }
        self.inner.volumes.get(tree.volume)
    }

    fn latest_version_ts(&self, tree_id: TreeId, key: &[u8]) -> Result<Option<Timestamp>> {
        let tree = self.inner.registry.get(tree_id).ok_or_else(|| {
            EngineError::InvariantViolation(format!("validation against removed tree {tree_id}"))
        })?;
        let volume = self.inner.volumes.get(tree.volume)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree: &tree,
        };
        match ctx.fetch_raw(key)? {
            Some(blob) => mvv::latest_ts(&blob),
            None => Ok(None),
        }
    }

    /// Apply one committed write as a multi-version insert at `ct`,
    /// pruning what no live snapshot can still see.
    fn apply_version(
        &self,
        tree: &Arc<Tree>,
        key: &[u8],
        value: Option<&[u8]>,
        ct: Timestamp,
    ) -> Result<()> {
        let volume = self.inner.volumes.get(tree.volume)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree,
        };
        let existing = ctx.fetch_raw(key)?;
        let horizon = self
            .inner
            .txns
            .oldest_active_read_ts()
            .min(ct.saturating_sub(1));
        let blob = mvv::updated_blob(existing.as_ref(), ct, value, horizon)?;
        match blob {
            Some(blob) => ctx.store_raw(key, Some(&blob), ct),
            None => ctx.store_raw(key, None, ct),
        }
    }

    /// Snapshot fetch: the transaction's own pending write, else the
    /// committed version at the read timestamp.
    pub(crate) fn snapshot_fetch(
        &self,
        txn: Option<&mut Transaction>,
        tree: &Arc<Tree>,
        key: &[u8],
    ) -> Result<Option<Bytes>> {
        let volume = self.tree_ctx_parts(tree)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree,
        };
        match txn {
            Some(txn) => {
                txn.check_active()?;
                if let Some(pending) = txn.pending_write(tree.id, key) {
                    return Ok(pending.clone());
                }
                let blob = ctx.fetch_raw(key)?;
                let latest = match &blob {
                    Some(blob) => mvv::latest_ts(blob)?,
                    None => None,
                };
                txn.record_read(tree.id, key.to_vec(), latest);
                match blob {
                    Some(blob) => mvv::resolve_at(&blob, txn.read_ts),
                    None => Ok(None),
                }
            }
            None => {
                let at = self.inner.txns.current_ts();
                match ctx.fetch_raw(key)? {
                    Some(blob) => mvv::resolve_at(&blob, at),
                    None => Ok(None),
                }
            }
        }
    }

    /// Buffer a write into `txn`.
    pub(crate) fn buffer_write(
        &self,
        txn: &mut Transaction,
        tree: &Arc<Tree>,
        key: &[u8],
        value: Option<Bytes>,
    ) -> Result<()> {
        self.tree_ctx_parts(tree)?;
        if let Some(v) = &value {
            if v.len() > crate::common::MAX_VALUE_LEN {
                return Err(EngineError::ValueTooLarge(v.len()));
            }
        }
        txn.record_write(tree.id, key.to_vec(), value)
    }

    /// Next visible entry after `bound`, merging the tree's committed
    /// state at the snapshot with the transaction's pending writes.
    #[allow(clippy::type_complexity)]
    pub(crate) fn snapshot_next(
        &self,
        mut txn: Option<&mut Transaction>,
        tree: &Arc<Tree>,
        bound: &[u8],
        inclusive: bool,
        mut hint: Option<LeafHint>,
    ) -> Result<(Option<(Vec<u8>, Bytes)>, Option<LeafHint>)> {
        let volume = self.tree_ctx_parts(tree)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree,
        };
        let read_ts = match &txn {
            Some(t) => t.read_ts,
            None => self.inner.txns.current_ts(),
        };
        let mut bound = bound.to_vec();
        let mut inclusive = inclusive;
        loop {
            self.inner.cancel.check()?;
            // Committed-state candidate visible at the snapshot.
            let mut tree_candidate: Option<(Vec<u8>, Bytes)> = None;
            {
                let mut scan_bound = bound.clone();
                let mut scan_inclusive = inclusive;
                loop {
                    let (raw, new_hint) = ctx.next_entry(&scan_bound, scan_inclusive, hint)?;
                    hint = new_hint;
                    match raw {
                        None => break,
                        Some((key, blob)) => match mvv::resolve_at(&blob, read_ts)? {
                            Some(value) => {
                                tree_candidate = Some((key, value));
                                break;
                            }
                            None => {
                                scan_bound = key;
                                scan_inclusive = false;
                            }
                        },
                    }
                }
            }
            // Pending-write candidate from the transaction.
            let ws_candidate: Option<(Vec<u8>, Option<Bytes>)> = txn.as_ref().and_then(|t| {
                t.writes
                    .range((tree.id, bound.clone())..)
                    .take_while(|((tid, _), _)| *tid == tree.id)
                    .find(|((_, k), _)| inclusive || k.as_slice() > bound.as_slice())
                    .map(|((_, k), v)| (k.clone(), v.clone()))
            });

            match (tree_candidate, ws_candidate) {
                (None, None) => return Ok((None, hint)),
                (Some((tk, tv)), None) => {
                    self.note_traversal_read(&mut txn, tree.id, &tk);
                    return Ok((Some((tk, tv)), hint));
                }
                (None, Some((wk, wv))) => match wv {
                    Some(value) => return Ok((Some((wk, value)), hint)),
                    None => {
                        bound = wk;
                        inclusive = false;
                    }
                },
                (Some((tk, tv)), Some((wk, wv))) => {
                    if wk <= tk {
                        // The pending write shadows the committed state at
                        // and below its key.
                        match wv {
                            Some(value) => return Ok((Some((wk, value)), hint)),
                            None => {
                                bound = wk;
                                inclusive = false;
                            }
                        }
                    } else {
                        self.note_traversal_read(&mut txn, tree.id, &tk);
                        return Ok((Some((tk, tv)), hint));
                    }
                }
            }
        }
    }

    /// Previous visible entry before `bound`; the backward counterpart of
    /// `snapshot_next`, without hints.
    pub(crate) fn snapshot_prev(
        &self,
        mut txn: Option<&mut Transaction>,
        tree: &Arc<Tree>,
        bound: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Bytes)>> {
        let volume = self.tree_ctx_parts(tree)?;
        let ctx = TreeCtx {
            pool: &self.inner.pool,
            volume: &volume,
            tree,
        };
        let read_ts = match &txn {
            Some(t) => t.read_ts,
            None => self.inner.txns.current_ts(),
        };
        let mut bound = bound.to_vec();
        let mut inclusive = inclusive;
        loop {
            self.inner.cancel.check()?;
            let mut tree_candidate: Option<(Vec<u8>, Bytes)> = None;
            {
                let mut scan_bound = bound.clone();
                let mut scan_inclusive = inclusive;
                loop {
                    match ctx.prev_entry(&scan_bound, scan_inclusive)? {
                        None => break,
                        Some((key, blob)) => match mvv::resolve_at(&blob, read_ts)? {
                            Some(value) => {
                                tree_candidate = Some((key, value));
                                break;
                            }
                            None => {
                                scan_bound = key;
                                scan_inclusive = false;
                            }
                        },
                    }
                }
            }
            let ws_candidate: Option<(Vec<u8>, Option<Bytes>)> = txn.as_ref().and_then(|t| {
                t.writes
                    .range(..=(tree.id, bound.clone()))
                    .rev()
                    .take_while(|((tid, _), _)| *tid == tree.id)
                    .find(|((_, k), _)| inclusive || k.as_slice() < bound.as_slice())
                    .map(|((_, k), v)| (k.clone(), v.clone()))
            });

            match (tree_candidate, ws_candidate) {
                (None, None) => return Ok(None),
                (Some((tk, tv)), None) => {
                    self.note_traversal_read(&mut txn, tree.id, &tk);
                    return Ok(Some((tk, tv)));
                }
                (None, Some((wk, wv))) => match wv {
                    Some(value) => return Ok(Some((wk, value))),
                    None => {
                        bound = wk;
                        inclusive = false;
                    }
                },
                (Some((tk, tv)), Some((wk, wv))) => {
                    if wk >= tk {
                        match wv {
                            Some(value) => return Ok(Some((wk, value))),
                            None => {
                                bound = wk;
                                inclusive = false;
                            }
                        }
                    } else {
                        self.note_traversal_read(&mut txn, tree.id, &tk);
                        return Ok(Some((tk, tv)));
                    }
                }
            }
        }
    }

    fn note_traversal_read(&self, txn: &mut Option<&mut Transaction>, tree: TreeId, key: &[u8]) {
        if let Some(t) = txn.as_mut() {
            // Conservative: the observed stamp does not matter for
            // validation, only that the key is re-checked at commit.
            t.record_read(tree, key.to_vec(), Some(t.read_ts));
        }
    }

    // ------------------------------------------------------------------
    // Accumulators
    // ------------------------------------------------------------------

    pub(crate) fn accumulator_update(
        &self,
        txn: &mut Transaction,
        tree: &Arc<Tree>,
        slot: u8,
        kind: AccumulatorKind,
        value: i64,
    ) -> Result<()> {
        txn.check_active()?;
        if kind == AccumulatorKind::Seq {
            return Err(EngineError::Config(
                "SEQ accumulators update through allocate".to_string(),
            ));
        }
        tree.accumulators.ensure(slot, kind)?;
        let delta = txn.accum_delta(tree.id, slot, kind);
        if delta.kind != kind {
            return Err(EngineError::Config(format!(
                "accumulator slot {slot} already used as {:?} in this transaction",
                delta.kind
            )));
        }
        match kind {
            AccumulatorKind::Sum => delta.sum = delta.sum.wrapping_add(value),
            AccumulatorKind::Min => delta.min_seen = delta.min_seen.min(value),
            AccumulatorKind::Max => delta.max_seen = delta.max_seen.max(value),
            AccumulatorKind::Seq => unreachable!(),
        }
        Ok(())
    }

    pub(crate) fn accumulator_allocate(
        &self,
        txn: &mut Transaction,
        tree: &Arc<Tree>,
        slot: u8,
    ) -> Result<i64> {
        txn.check_active()?;
        let value = tree.accumulators.allocate_seq(slot)?;
        let delta = txn.accum_delta(tree.id, slot, AccumulatorKind::Seq);
        delta.count += 1;
        Ok(value)
    }

    pub(crate) fn accumulator_snapshot(
        &self,
        txn: Option<&Transaction>,
        tree: &Arc<Tree>,
        slot: u8,
        kind: AccumulatorKind,
    ) -> Result<i64> {
        tree.accumulators.ensure(slot, kind)?;
        let at = match txn {
            Some(t) => t.read_ts,
            None => self.inner.txns.current_ts(),
        };
        let mut value = tree.accumulators.snapshot_value(slot, at)?;
        if let Some(t) = txn {
            if let Some(delta) = t.accum_view(tree.id, slot) {
                value = delta.apply_to(value);
            }
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Checkpoint and maintenance
    // ------------------------------------------------------------------

    /// Flush dirty pages up to the current timestamp and write a
    /// CHECKPOINT record. Recovery replays only past the newest of these.
    pub fn checkpoint(&self) -> Result<Timestamp> {
        let _guard = self.inner.checkpoint_lock.lock();
        let base = self.inner.txns.current_ts();
        self.inner.pool.flush_dirty(base)?;

        let mut accumulators = Vec::new();
        let mut volume_stamps = Vec::new();
        for tree in self.inner.registry.all() {
            if self.inner.volumes.get(tree.volume)?.is_temporary() {
                continue;
            }
            accumulators.extend(tree.accumulators.checkpoint_snapshot(tree.id, base));
        }
        for volume in self.inner.volumes.all() {
            if !volume.is_temporary() {
                volume_stamps.push((volume.id(), base));
            }
        }
        let checkpoint = CheckpointRecord {
            checkpoint_id: self.inner.checkpoint_seq.fetch_add(1, Ordering::SeqCst),
            base_timestamp: base,
            active_txns: self.inner.txns.active_ids(),
            volume_stamps,
            accumulators,
        };
        self.inner
            .journal
            .append_and_wait(&JournalRecord::Checkpoint(checkpoint.clone()), base)?;
        self.inner.journal.set_last_checkpoint(checkpoint);

        // Advance the persisted volume stamps; they reach disk with the
        // next flush and always trail the journal's recorded stamp.
        for volume in self.inner.volumes.all() {
            if volume.is_temporary() {
                continue;
            }
            let mut header = self.inner.pool.pin_write(volume.id(), PageId::HEADER)?;
            let mut vh = VolumeHeader::decode(volume.page_size(), header.bytes())?;
            if vh.version_stamp < base {
                vh.version_stamp = base;
                vh.encode(volume.page_size(), header.bytes_mut());
                header.mark_dirty(base);
            }
        }
        if self.inner.config.buffer_inventory_enabled {
            self.write_inventory();
        }
        debug!(base, "checkpoint complete");
        Ok(base)
    }

    fn inventory_path(&self) -> PathBuf {
        self.inner
            .config
            .journal_path
            .join(format!("{}.inventory", self.inner.config.journal_prefix))
    }

    fn write_inventory(&self) {
        let mut out = String::new();
        for (volume, page) in self.inner.pool.inventory() {
            out.push_str(&format!("{} {}\n", volume.0, page.0));
        }
        if let Err(e) = std::fs::write(self.inventory_path(), out) {
            warn!(error = %e, "buffer inventory write failed");
        }
    }

    fn preload_inventory(&self) {
        let Ok(raw) = std::fs::read_to_string(self.inventory_path()) else {
            return;
        };
        let mut pages = Vec::new();
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(v), Some(p)) = (parts.next(), parts.next()) {
                if let (Ok(v), Ok(p)) = (v.parse::<u16>(), p.parse::<u64>()) {
                    pages.push((VolumeId(v), PageId(p)));
                }
            }
        }
        info!(pages = pages.len(), "preloading buffer inventory");
        self.inner.pool.preload(&pages);
    }

    fn spawn_background(&self) {
        let mut handles = self.inner.background.lock();

        let engine = self.clone();
        let interval = engine.inner.config.checkpoint_interval;
        handles.push(
            std::thread::Builder::new()
                .name("cellardb-checkpoint".to_string())
                .spawn(move || loop {
                    if engine.inner.shutdown.wait(interval) {
                        return;
                    }
                    if let Err(e) = engine.checkpoint() {
                        warn!(error = %e, "periodic checkpoint failed");
                        if !engine.is_writable() {
                            return;
                        }
                    }
                })
                .expect("spawn checkpoint thread"),
        );

        let engine = self.clone();
        let sweep = (engine.inner.config.checkpoint_interval / 4).max(Duration::from_secs(1));
        handles.push(
            std::thread::Builder::new()
                .name("cellardb-copyback".to_string())
                .spawn(move || loop {
                    if engine.inner.shutdown.wait(sweep) {
                        return;
                    }
                    match copyback::run_once(&engine.inner.journal) {
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "copy-back pass failed"),
                    }
                    let horizon = engine.inner.txns.oldest_active_read_ts();
                    for tree in engine.inner.registry.all() {
                        tree.accumulators.prune(horizon);
                    }
                })
                .expect("spawn copyback thread"),
        );
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Clean close: final checkpoint, full flush, journal shutdown,
    /// temporary volume teardown. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.signal();
        for handle in self.inner.background.lock().drain(..) {
            let _ = handle.join();
        }
        let mut result = Ok(());
        if !self.inner.fatal.load(Ordering::SeqCst) {
            result = self.final_flush();
        }
        if let Err(e) = self.inner.journal.shutdown() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        for volume in self.inner.volumes.all() {
            if volume.is_temporary() {
                self.inner.pool.forget_volume(volume.id());
                let _ = volume.discard();
            } else {
                let _ = volume.sync();
            }
        }
        info!("engine closed");
        result
    }

    fn final_flush(&self) -> Result<()> {
        self.checkpoint()?;
        self.inner.pool.flush_all()?;
        for volume in self.inner.volumes.all() {
            if !volume.is_temporary() {
                volume.sync()?;
            }
        }
        Ok(())
    }

    /// Simulated crash for recovery testing: stop everything without
    /// flushing anything. Durable state is whatever the journal writer
    /// already pushed to the OS; dirty pages and queued records die with
    /// the handle, exactly as in a process kill.
    pub fn crash(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.shutdown.signal();
        for handle in self.inner.background.lock().drain(..) {
            let _ = handle.join();
        }
        self.inner.journal.abort();
        info!("engine crashed (simulated)");
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn current_timestamp(&self) -> Timestamp {
        self.inner.txns.current_ts()
    }

    pub fn active_transaction_count(&self) -> usize {
        self.inner.txns.active_count()
    }

    pub fn buffer_pool_stats(&self) -> crate::buffer::BufferPoolStats {
        self.inner.pool.stats()
    }

    pub fn journal_stats(&self) -> crate::journal::JournalStats {
        self.inner.journal.stats()
    }
}

/// Directory key for a tree name: a single string segment.
fn directory_key(name: &str, max_len: usize) -> Result<Vec<u8>> {
    let mut key = Key::new(max_len);
    key.append(Segment::Str(name.to_string()))?;
    Ok(key.encoded().to_vec())
}

/// Recover the tree name from a directory key.
fn directory_entry_name(key_bytes: &[u8]) -> Result<String> {
    let mut key = Key::new(crate::common::MAX_KEY_LEN);
    key.set_encoded(key_bytes)?;
    match key.decode()?.first() {
        Some(Segment::Str(name)) => Ok(name.clone()),
        _ => Err(EngineError::Corrupt(
            "directory key is not a string segment".to_string(),
        )),
    }
}
