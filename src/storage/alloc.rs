// # Page Allocation
//
// The free list and the next-page watermark live in the volume header
// page, and free pages chain through their first 8 body bytes. Both are
// mutated through the buffer pool, so allocation state is journaled and
// recovered exactly like tree content.
//
// Lock order is always header page first, then the affected page; callers
// performing structural tree changes already hold the tree latch, so no
// two threads contend for the same non-header page here.

use std::sync::Arc;

use tracing::warn;

use crate::buffer::{BufferPool, PageMut};
use crate::common::{PageId, Timestamp};
use crate::error::{EngineError, Result};
use crate::storage::page::{self, PageKind};
use crate::storage::volume::{Volume, VolumeHeader};

/// Allocate a page and hand it back initialized, exclusively pinned.
pub fn allocate_page<'a>(
    pool: &'a BufferPool,
    volume: &Arc<Volume>,
    kind: PageKind,
    level: u8,
    ts: Timestamp,
) -> Result<PageMut<'a>> {
    let mut header = pool.pin_write(volume.id(), PageId::HEADER)?;
    let mut vh = VolumeHeader::decode(volume.page_size(), header.bytes())?;

    if !vh.free_list_head.is_none() {
        let page_id = vh.free_list_head;
        let next = {
            let free = pool.pin_read(volume.id(), page_id)?;
            let head = page::PageHeader::decode(free.bytes())?;
            if head.kind == PageKind::Free {
                Some(PageId(u64::from_le_bytes(
                    page::body(free.bytes())[0..8].try_into().unwrap(),
                )))
            } else {
                None
            }
        };
        if let Some(next) = next {
            vh.free_list_head = next;
            vh.encode(volume.page_size(), header.bytes_mut());
            header.mark_dirty(ts);
            drop(header);

            // The page exists on disk (or in cache) as a Free page;
            // repurpose it in place.
            let mut pg = pool.pin_write(volume.id(), page_id)?;
            page::init(pg.bytes_mut(), kind, level, page_id);
            pg.mark_dirty(ts);
            return Ok(pg);
        }
        // A crash can strand the free-list head one step behind the pages
        // it references. Abandon the chain: the stranded pages leak, the
        // volume stays sound.
        warn!(volume = %volume.id(), page = %page_id, "free list head is not a free page; abandoning chain");
        vh.free_list_head = PageId::NONE;
    }

    let page_id = PageId(vh.next_page_id);
    volume.ensure_capacity(page_id)?;
    vh.next_page_id += 1;
    vh.encode(volume.page_size(), header.bytes_mut());
    header.mark_dirty(ts);
    drop(header);

    pool.create_page(volume.id(), page_id, kind, level, ts)
}

/// Push a page onto the free list. The content is not zeroed beyond the
/// header and the chain pointer.
pub fn free_page(
    pool: &BufferPool,
    volume: &Arc<Volume>,
    page_id: PageId,
    ts: Timestamp,
) -> Result<()> {
    if page_id.0 <= PageId::DIRECTORY_ROOT.0 {
        return Err(EngineError::InvariantViolation(format!(
            "attempt to free reserved page {page_id}"
        )));
    }
    let mut header = pool.pin_write(volume.id(), PageId::HEADER)?;
    let mut vh = VolumeHeader::decode(volume.page_size(), header.bytes())?;
    {
        let mut pg = pool.pin_write(volume.id(), page_id)?;
        page::init(pg.bytes_mut(), PageKind::Free, 0, page_id);
        page::body_mut(pg.bytes_mut())[0..8].copy_from_slice(&vh.free_list_head.0.to_le_bytes());
        pg.mark_dirty(ts);
    }
    vh.free_list_head = page_id;
    vh.encode(volume.page_size(), header.bytes_mut());
    header.mark_dirty(ts);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::common::{CancelToken, VolumeId};
    use crate::config::VolumeSpec;
    use crate::journal::Journal;
    use crate::storage::volume::VolumeSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::tempdir;

    const PS: usize = 1024;

    fn harness(dir: &std::path::Path) -> (Arc<BufferPool>, Arc<Volume>, Arc<Journal>) {
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
        spec.initial_pages = 8;
        spec.extension_pages = 8;
        let (volume, _) = Volume::open_or_create(VolumeId(0), &spec, PS).unwrap();
        volumes.add(Arc::clone(&volume));
        let pool = BufferPool::new(PS, 64, Arc::clone(&journal), volumes, fatal, cancel);
        pool.set_wal_enabled(true);
        (pool, volume, journal)
    }

    #[test]
    fn allocate_extends_watermark() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        let a = allocate_page(&pool, &volume, PageKind::Data, 0, 1)
            .unwrap()
            .page_id();
        let b = allocate_page(&pool, &volume, PageKind::Data, 0, 1)
            .unwrap()
            .page_id();
        assert_eq!(a, PageId(2));
        assert_eq!(b, PageId(3));
        journal.shutdown().unwrap();
    }

    #[test]
    fn free_then_allocate_reuses() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        let a = allocate_page(&pool, &volume, PageKind::Data, 0, 1)
            .unwrap()
            .page_id();
        let b = allocate_page(&pool, &volume, PageKind::Data, 0, 1)
            .unwrap()
            .page_id();
        free_page(&pool, &volume, a, 2).unwrap();
        free_page(&pool, &volume, b, 2).unwrap();
        // LIFO: b comes back first.
        let c = allocate_page(&pool, &volume, PageKind::Index, 1, 3).unwrap();
        assert_eq!(c.page_id(), b);
        drop(c);
        let d = allocate_page(&pool, &volume, PageKind::Data, 0, 3).unwrap();
        assert_eq!(d.page_id(), a);
        journal.shutdown().unwrap();
    }

    #[test]
    fn reserved_pages_cannot_be_freed() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        assert!(free_page(&pool, &volume, PageId::HEADER, 1).is_err());
        assert!(free_page(&pool, &volume, PageId::DIRECTORY_ROOT, 1).is_err());
        journal.shutdown().unwrap();
    }

    #[test]
    fn allocation_grows_the_file() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        // Initial 8 pages, ids 2..8 available; allocating past that must
        // extend rather than fail.
        for _ in 0..20 {
            allocate_page(&pool, &volume, PageKind::Data, 0, 1).unwrap();
        }
        journal.shutdown().unwrap();
    }
}
