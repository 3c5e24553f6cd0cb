// # Buffer Pool Manager
//
// Architecture follows the usual frame-array design: a preallocated frame
// array, a partitioned page table mapping (volume, page) to a frame, and a
// clock hand over the frames for eviction.
//
// Pin/eviction protocol. A pinner increments the pin count while holding
// its shard's read lock; an evictor that has write-locked a candidate frame
// re-checks the pin count after taking the shard's write lock. The shard
// lock therefore totally orders the two: either the pinner got its pin in
// (evictor aborts), or the evictor unmapped the page first (pinner misses
// and reloads). Frames are never deallocated, so `&Frame` borrows stay
// valid for the pool's lifetime.
//
// WAL constraint. Writing a dirty frame to its volume first appends a page
// image to the journal and waits for durability. Recovery replays those
// images, so a volume page never contains effects whose journal records
// are not durable. Temporary volumes skip the journal entirely, and the
// pool's WAL gate is off while recovery itself repopulates frames.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::common::{CancelToken, PageId, Timestamp, VolumeId};
use crate::error::{EngineError, Result};
use crate::journal::{Journal, JournalRecord};
use crate::storage::page::{self, PageKind};
use crate::storage::volume::VolumeSet;

use super::frame::{Frame, FrameId, PageMut, PageRef};

const SHARD_COUNT: usize = 16;

/// How long a miss will wait for an evictable frame before giving up.
const EVICTION_WAIT_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

pub struct BufferPool {
    page_size: usize,
    frames: Box<[Frame]>,
    shards: Vec<RwLock<HashMap<(VolumeId, PageId), FrameId>>>,
    free: Mutex<Vec<FrameId>>,
    clock_hand: AtomicUsize,
    journal: Arc<Journal>,
    volumes: Arc<VolumeSet>,
    /// Off during recovery: frames restored from the journal may be written
    /// back to volumes directly, their records being durable by definition.
    wal_enabled: AtomicBool,
    fatal: Arc<AtomicBool>,
    cancel: CancelToken,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

impl BufferPool {
    pub fn new(
        page_size: usize,
        frame_count: usize,
        journal: Arc<Journal>,
        volumes: Arc<VolumeSet>,
        fatal: Arc<AtomicBool>,
        cancel: CancelToken,
    ) -> Arc<BufferPool> {
        let frames: Vec<Frame> = (0..frame_count).map(|_| Frame::new(page_size)).collect();
        let free = (0..frame_count).rev().collect();
        Arc::new(BufferPool {
            page_size,
            frames: frames.into_boxed_slice(),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            free: Mutex::new(free),
            clock_hand: AtomicUsize::new(0),
            journal,
            volumes,
            wal_enabled: AtomicBool::new(false),
            fatal,
            cancel,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn set_wal_enabled(&self, enabled: bool) {
        self.wal_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
        }
    }

    fn shard_for(&self, key: (VolumeId, PageId)) -> &RwLock<HashMap<(VolumeId, PageId), FrameId>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Shared pin. Loads the page on a miss.
    pub fn pin_read(&self, volume: VolumeId, page_id: PageId) -> Result<PageRef<'_>> {
        loop {
            if let Some(frame) = self.try_pin(volume, page_id) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let guard = frame.state.read();
                return Ok(PageRef { frame, guard });
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            if self.load_page(volume, page_id)? {
                continue;
            }
        }
    }

    /// Exclusive pin. Loads the page on a miss.
    pub fn pin_write(&self, volume: VolumeId, page_id: PageId) -> Result<PageMut<'_>> {
        loop {
            if let Some(frame) = self.try_pin(volume, page_id) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let guard = frame.state.write();
                return Ok(PageMut { frame, guard });
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            if self.load_page(volume, page_id)? {
                continue;
            }
        }
    }

    /// Pin the frame if the page is resident. The pin is taken under the
    /// shard read lock; see the protocol note at the top.
    fn try_pin(&self, volume: VolumeId, page_id: PageId) -> Option<&Frame> {
        let key = (volume, page_id);
        let map = self.shard_for(key).read();
        let &frame_id = map.get(&key)?;
        let frame = &self.frames[frame_id];
        frame.pins.fetch_add(1, Ordering::SeqCst);
        frame.touched.store(true, Ordering::Relaxed);
        Some(frame)
    }

    /// Read the page from its volume into a fresh frame and publish it.
    /// Returns true when the page is now (or concurrently became) resident.
    fn load_page(&self, volume: VolumeId, page_id: PageId) -> Result<bool> {
        let key = (volume, page_id);
        let frame_id = self.obtain_frame()?;
        let frame = &self.frames[frame_id];
        {
            let mut state = frame.state.write();
            let vol = match self.volumes.get(volume) {
                Ok(v) => v,
                Err(e) => {
                    drop(state);
                    self.release_frame(frame_id);
                    return Err(e);
                }
            };
            if let Err(e) = vol.read_page(page_id, &mut state.buf) {
                drop(state);
                self.release_frame(frame_id);
                return Err(e);
            }
            state.volume = volume;
            state.page_id = page_id;
            state.valid = true;
            state.dirty = false;
            state.first_dirty_ts = 0;
            state.last_mod_ts = 0;
        }
        let mut map = self.shard_for(key).write();
        if map.contains_key(&key) {
            // Lost the load race; the resident copy wins.
            drop(map);
            frame.state.write().valid = false;
            self.release_frame(frame_id);
            return Ok(true);
        }
        map.insert(key, frame_id);
        drop(map);
        self.release_frame(frame_id);
        Ok(true)
    }

    /// Materialize a brand-new page without reading the volume. The caller
    /// has already allocated `page_id` and extended the file.
    pub fn create_page(
        &self,
        volume: VolumeId,
        page_id: PageId,
        kind: PageKind,
        level: u8,
        ts: Timestamp,
    ) -> Result<PageMut<'_>> {
        let key = (volume, page_id);
        let frame_id = self.obtain_frame()?;
        let frame = &self.frames[frame_id];
        {
            let mut state = frame.state.write();
            page::init(&mut state.buf, kind, level, page_id);
            state.volume = volume;
            state.page_id = page_id;
            state.valid = true;
            state.dirty = true;
            state.first_dirty_ts = ts;
            state.last_mod_ts = ts;
        }
        {
            let mut map = self.shard_for(key).write();
            if map.get(&key).is_some() {
                drop(map);
                frame.state.write().valid = false;
                self.release_frame(frame_id);
                return Err(EngineError::InvariantViolation(format!(
                    "create of already-resident page {volume}/{page_id}"
                )));
            }
            map.insert(key, frame_id);
        }
        // Keep the reservation pin; hand the caller the exclusive guard.
        let mut guard = frame.state.write();
        page::set_version_stamp(&mut guard.buf, ts);
        page::seal(&mut guard.buf);
        Ok(PageMut { frame, guard })
    }

    /// Recovery path: overwrite (or create) the in-memory page with a
    /// journaled image and mark it dirty at the image's timestamp.
    pub fn restore_page(
        &self,
        volume: VolumeId,
        page_id: PageId,
        ts: Timestamp,
        image: &Bytes,
    ) -> Result<()> {
        if image.len() != self.page_size {
            return Err(EngineError::Recovery(format!(
                "page image for {volume}/{page_id} has length {}, page size is {}",
                image.len(),
                self.page_size
            )));
        }
        if let Some(frame) = self.try_pin(volume, page_id) {
            let mut state = frame.state.write();
            state.buf.copy_from_slice(image);
            if !state.dirty {
                state.first_dirty_ts = ts;
            }
            state.dirty = true;
            state.last_mod_ts = state.last_mod_ts.max(ts);
            drop(state);
            frame.pins.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }
        let key = (volume, page_id);
        let frame_id = self.obtain_frame()?;
        let frame = &self.frames[frame_id];
        {
            let mut state = frame.state.write();
            state.buf.copy_from_slice(image);
            state.volume = volume;
            state.page_id = page_id;
            state.valid = true;
            state.dirty = true;
            state.first_dirty_ts = ts;
            state.last_mod_ts = ts;
        }
        let mut map = self.shard_for(key).write();
        if map.contains_key(&key) {
            drop(map);
            frame.state.write().valid = false;
            self.release_frame(frame_id);
            // Raced with a concurrent restore of the same page; retry.
            return self.restore_page(volume, page_id, ts, image);
        }
        map.insert(key, frame_id);
        drop(map);
        self.release_frame(frame_id);
        Ok(())
    }

    /// Drop the reservation pin obtained through `obtain_frame` and put the
    /// frame back on the free list if it is no longer mapped.
    fn release_frame(&self, frame_id: FrameId) {
        let frame = &self.frames[frame_id];
        let remaining = frame.pins.fetch_sub(1, Ordering::SeqCst) - 1;
        let state = frame.state.read();
        if !state.valid && remaining == 0 {
            drop(state);
            self.free.lock().push(frame_id);
        }
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Reserve a frame for loading: from the free list, or by evicting a
    /// clock victim. The returned frame has one pin and is unmapped.
    fn obtain_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free.lock().pop() {
            self.frames[frame_id].pins.fetch_add(1, Ordering::SeqCst);
            return Ok(frame_id);
        }
        let n = self.frames.len();
        let started = Instant::now();
        let mut sweep = 0usize;
        loop {
            self.cancel.check()?;
            if sweep >= 2 * n {
                // Two full sweeps found nothing evictable: every frame is
                // pinned or mid-writeback. Wait for pins to drain.
                if started.elapsed() > EVICTION_WAIT_CAP {
                    warn!("buffer pool exhausted: all frames pinned");
                    return Err(EngineError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(1));
                sweep = 0;
                if let Some(frame_id) = self.free.lock().pop() {
                    self.frames[frame_id].pins.fetch_add(1, Ordering::SeqCst);
                    return Ok(frame_id);
                }
                continue;
            }
            sweep += 1;
            let frame_id = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
            let frame = &self.frames[frame_id];
            if frame.pin_count() != 0 {
                continue;
            }
            if frame.touched.swap(false, Ordering::Relaxed) {
                continue;
            }
            let Some(mut state) = frame.state.try_write() else {
                continue;
            };
            if frame.pin_count() != 0 || !state.valid {
                continue;
            }
            if state.page_id == PageId::HEADER {
                // Volume headers stay resident: they may reach the journal
                // and the volume only behind the pages they reference, and
                // checkpoint's ordered flush is what guarantees that.
                continue;
            }
            if state.dirty {
                self.writeback_locked(&mut state)?;
            }
            let key = (state.volume, state.page_id);
            {
                let mut map = self.shard_for(key).write();
                if frame.pin_count() != 0 {
                    // A pinner slipped in between our checks; leave it be.
                    continue;
                }
                map.remove(&key);
            }
            state.valid = false;
            frame.pins.store(1, Ordering::SeqCst);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(frame_id);
        }
    }

    // ------------------------------------------------------------------
    // Writeback
    // ------------------------------------------------------------------

    /// Write a dirty frame to its volume, journal-first. The frame's
    /// content lock is held by the caller.
    fn writeback_locked(&self, state: &mut super::frame::FrameState) -> Result<()> {
        let result = self.writeback_inner(state);
        if let Err(e) = &result {
            // Writeback failure poisons the pool: later commits fail fast
            // rather than risk breaking the WAL ordering.
            warn!(error = %e, "page writeback failed; marking engine non-writable");
            self.fatal.store(true, Ordering::SeqCst);
        }
        result
    }

    fn writeback_inner(&self, state: &mut super::frame::FrameState) -> Result<()> {
        let volume = self.volumes.get(state.volume)?;
        if self.wal_enabled.load(Ordering::SeqCst) && !volume.is_temporary() {
            let seq = self.journal.append_sync(
                &JournalRecord::PageImage {
                    volume: state.volume,
                    page_id: state.page_id,
                    image: Bytes::copy_from_slice(&state.buf),
                },
                state.last_mod_ts,
            )?;
            self.journal.wait_durable(seq)?;
        }
        volume.write_page(state.page_id, &state.buf)?;
        state.dirty = false;
        state.first_dirty_ts = 0;
        self.writebacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush every dirty frame whose oldest unwritten modification is at
    /// or below `upper`. Used by checkpoints (bounded) and close
    /// (unbounded).
    ///
    /// Volume header pages go last: their allocation state (free list,
    /// watermark) references other pages, and the journal is fsynced in
    /// append order, so a recovered header never points at pages whose
    /// images failed to become durable with it.
    pub fn flush_dirty(&self, upper: Timestamp) -> Result<()> {
        for headers in [false, true] {
            for frame in self.frames.iter() {
                let mut state = frame.state.write();
                if state.valid
                    && state.dirty
                    && state.first_dirty_ts <= upper
                    && (state.page_id == PageId::HEADER) == headers
                {
                    self.writeback_locked(&mut state)?;
                }
            }
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.flush_dirty(u64::MAX)
    }

    /// Drop every frame of a volume without writeback. Temporary volumes
    /// on close, and volume removal.
    pub fn forget_volume(&self, volume: VolumeId) {
        for (frame_id, frame) in self.frames.iter().enumerate() {
            let mut state = frame.state.write();
            if state.valid && state.volume == volume {
                let key = (state.volume, state.page_id);
                let mut map = self.shard_for(key).write();
                if frame.pin_count() != 0 {
                    debug!(volume = %volume, page = %state.page_id, "pinned page survives forget_volume");
                    continue;
                }
                map.remove(&key);
                drop(map);
                state.valid = false;
                state.dirty = false;
                drop(state);
                self.free.lock().push(frame_id);
            }
        }
    }

    /// Resident page set, for the warm-up inventory.
    pub fn inventory(&self) -> Vec<(VolumeId, PageId)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().keys().copied());
        }
        out.sort_unstable();
        out
    }

    /// Fault a previously captured inventory back in. Failures are ignored:
    /// the inventory is advisory and pages may have been freed since.
    pub fn preload(&self, pages: &[(VolumeId, PageId)]) {
        let budget = self.frames.len().saturating_sub(self.frames.len() / 8);
        for &(volume, page_id) in pages.iter().take(budget) {
            if let Ok(pin) = self.pin_read(volume, page_id) {
                drop(pin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSpec;
    use crate::storage::volume::Volume;
    use std::time::Duration;
    use tempfile::tempdir;

    const PS: usize = 1024;

    fn harness(dir: &std::path::Path, frames: usize) -> (Arc<BufferPool>, Arc<Journal>) {
        let fatal = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();
        let journal = Journal::new(
            dir.to_path_buf(),
            "j".to_string(),
            PS,
            1 << 30,
            Duration::from_millis(20),
            false,
            cancel.clone(),
            Arc::clone(&fatal),
        );
        journal.start(1).unwrap();
        let volumes = Arc::new(VolumeSet::new());
        let mut spec = VolumeSpec::new("main", dir.join("main.vol"));
        spec.initial_pages = 64;
        let (volume, _) = Volume::open_or_create(VolumeId(0), &spec, PS).unwrap();
        volumes.add(volume);
        let pool = BufferPool::new(PS, frames, Arc::clone(&journal), volumes, fatal, cancel);
        pool.set_wal_enabled(true);
        (pool, journal)
    }

    #[test]
    fn create_then_pin_read() {
        let dir = tempdir().unwrap();
        let (pool, journal) = harness(dir.path(), 32);
        {
            let mut page = pool
                .create_page(VolumeId(0), PageId(5), PageKind::Data, 0, 1)
                .unwrap();
            page.bytes_mut()[page::PAGE_HEADER_LEN] = 0xAA;
            page.mark_dirty(1);
        }
        let pin = pool.pin_read(VolumeId(0), PageId(5)).unwrap();
        assert_eq!(pin.bytes()[page::PAGE_HEADER_LEN], 0xAA);
        assert_eq!(pin.version_stamp(), 1);
        drop(pin);
        journal.shutdown().unwrap();
    }

    #[test]
    fn eviction_round_trips_through_volume() {
        let dir = tempdir().unwrap();
        let (pool, journal) = harness(dir.path(), 16);
        // More pages than frames: earlier pages must be evicted, written
        // back, and reloaded intact.
        for i in 2..40u64 {
            let mut page = pool
                .create_page(VolumeId(0), PageId(i), PageKind::Data, 0, i)
                .unwrap();
            let off = page::PAGE_HEADER_LEN;
            page.bytes_mut()[off..off + 8].copy_from_slice(&i.to_le_bytes());
            page.mark_dirty(i);
        }
        for i in 2..40u64 {
            let pin = pool.pin_read(VolumeId(0), PageId(i)).unwrap();
            let off = page::PAGE_HEADER_LEN;
            let got = u64::from_le_bytes(pin.bytes()[off..off + 8].try_into().unwrap());
            assert_eq!(got, i);
        }
        assert!(pool.stats().evictions > 0);
        journal.shutdown().unwrap();
    }

    #[test]
    fn flush_dirty_honors_upper_bound() {
        let dir = tempdir().unwrap();
        let (pool, journal) = harness(dir.path(), 32);
        for (pid, ts) in [(2u64, 5u64), (3, 10)] {
            let mut page = pool
                .create_page(VolumeId(0), PageId(pid), PageKind::Data, 0, ts)
                .unwrap();
            page.mark_dirty(ts);
        }
        pool.flush_dirty(5).unwrap();
        let mut dirty_left = 0;
        for frame in pool.frames.iter() {
            let state = frame.state.read();
            if state.valid && state.dirty {
                dirty_left += 1;
            }
        }
        assert_eq!(dirty_left, 1);
        pool.flush_all().unwrap();
        journal.shutdown().unwrap();
    }

    #[test]
    fn concurrent_readers_share_a_pin_target() {
        let dir = tempdir().unwrap();
        let (pool, journal) = harness(dir.path(), 32);
        {
            let mut page = pool
                .create_page(VolumeId(0), PageId(7), PageKind::Data, 0, 1)
                .unwrap();
            page.mark_dirty(1);
        }
        let a = pool.pin_read(VolumeId(0), PageId(7)).unwrap();
        let b = pool.pin_read(VolumeId(0), PageId(7)).unwrap();
        assert_eq!(a.bytes().len(), b.bytes().len());
        drop(a);
        drop(b);
        journal.shutdown().unwrap();
    }

    #[test]
    fn exhaustion_times_out_rather_than_hanging() {
        let dir = tempdir().unwrap();
        let (pool, journal) = harness(dir.path(), 16);
        let mut pins = Vec::new();
        for i in 2..18u64 {
            let mut page = pool
                .create_page(VolumeId(0), PageId(i), PageKind::Data, 0, 1)
                .unwrap();
            page.mark_dirty(1);
            drop(page);
            pins.push(pool.pin_read(VolumeId(0), PageId(i)).unwrap());
        }
        // All 16 frames pinned; the next miss cannot find a victim.
        let err = pool.pin_read(VolumeId(0), PageId(40));
        assert!(err.is_err());
        drop(pins);
        journal.shutdown().unwrap();
    }
}
