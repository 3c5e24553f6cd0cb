// # Buffer Frames
//
// A frame is one page-sized slot: content and identity under an RwLock,
// plus a pin count and a clock touch bit outside it. Pins keep a frame
// resident; the content lock arbitrates readers against the single writer.
// The eviction protocol in `pool` relies on the exact ordering of pin
// checks around the page-table locks; see the comments there.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, Timestamp, VolumeId};
use crate::storage::page;

pub type FrameId = usize;

pub struct FrameState {
    pub volume: VolumeId,
    pub page_id: PageId,
    pub valid: bool,
    pub dirty: bool,
    /// Timestamp of the oldest modification not yet written back. A
    /// checkpoint at base B must flush every frame whose first dirty
    /// timestamp is <= B, or effects from before B would exist only in
    /// journal records the next recovery no longer replays.
    pub first_dirty_ts: Timestamp,
    /// Timestamp of the newest modification; page version stamps and the
    /// WAL constraint use this.
    pub last_mod_ts: Timestamp,
    pub buf: Box<[u8]>,
}

pub struct Frame {
    pub(crate) state: RwLock<FrameState>,
    pub(crate) pins: AtomicU32,
    pub(crate) touched: AtomicBool,
}

impl Frame {
    pub(crate) fn new(page_size: usize) -> Frame {
        Frame {
            state: RwLock::new(FrameState {
                volume: VolumeId(0),
                page_id: PageId::NONE,
                valid: false,
                dirty: false,
                first_dirty_ts: 0,
                last_mod_ts: 0,
                buf: vec![0u8; page_size].into_boxed_slice(),
            }),
            pins: AtomicU32::new(0),
            touched: AtomicBool::new(false),
        }
    }

    pub(crate) fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::SeqCst)
    }
}

/// Shared pin: concurrent readers allowed, eviction excluded.
pub struct PageRef<'a> {
    pub(crate) frame: &'a Frame,
    pub(crate) guard: RwLockReadGuard<'a, FrameState>,
}

impl PageRef<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.guard.buf
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    /// The page's version stamp, read from its header. Level caches compare
    /// this to detect a page that changed underneath them.
    pub fn version_stamp(&self) -> Timestamp {
        if self.guard.page_id == PageId::HEADER {
            self.guard.last_mod_ts
        } else {
            page::version_stamp(&self.guard.buf)
        }
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive pin: sole access to the frame, eviction excluded.
pub struct PageMut<'a> {
    pub(crate) frame: &'a Frame,
    pub(crate) guard: RwLockWriteGuard<'a, FrameState>,
}

impl PageMut<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.guard.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard.buf
    }

    pub fn page_id(&self) -> PageId {
        self.guard.page_id
    }

    /// Finish a mutation: stamp the page's version with `ts`, reseal the
    /// checksum, and mark the frame dirty. Header pages have no page-level
    /// header or crc; they only pick up the dirty mark.
    pub fn mark_dirty(&mut self, ts: Timestamp) {
        if self.guard.page_id != PageId::HEADER {
            let buf = &mut self.guard.buf;
            page::set_version_stamp(buf, ts);
            page::seal(buf);
        }
        if !self.guard.dirty {
            self.guard.first_dirty_ts = ts;
        }
        self.guard.dirty = true;
        self.guard.last_mod_ts = self.guard.last_mod_ts.max(ts);
    }

    pub fn version_stamp(&self) -> Timestamp {
        if self.guard.page_id == PageId::HEADER {
            self.guard.last_mod_ts
        } else {
            page::version_stamp(&self.guard.buf)
        }
    }
}

impl Drop for PageMut<'_> {
    fn drop(&mut self) {
        self.frame.pins.fetch_sub(1, Ordering::SeqCst);
    }
}
