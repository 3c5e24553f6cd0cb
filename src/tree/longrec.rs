// # Long Records
//
// Payloads above the long-record threshold chain through LongRec pages.
// Page body: u64 next page id, then payload bytes. The chain is written
// back to front so every page links forward to an already-written page.
// Chains are immutable once written; an update writes a new chain and
// frees the old one.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::buffer::BufferPool;
use crate::common::{PageId, Timestamp};
use crate::error::{EngineError, Result};
use crate::storage::alloc;
use crate::storage::page::{self, PageKind};
use crate::storage::volume::Volume;

use super::node::LongRef;

const NEXT_PTR_LEN: usize = 8;

fn chunk_capacity(page_size: usize) -> usize {
    super::body_capacity(page_size) - NEXT_PTR_LEN
}

/// Write `blob` as a chain and return its reference.
pub fn write_chain(
    pool: &BufferPool,
    volume: &Arc<Volume>,
    blob: &[u8],
    ts: Timestamp,
) -> Result<LongRef> {
    debug_assert!(!blob.is_empty());
    let cap = chunk_capacity(pool.page_size());
    let chunks: Vec<&[u8]> = blob.chunks(cap).collect();
    let mut next = PageId::NONE;
    for chunk in chunks.iter().rev() {
        let mut pin = alloc::allocate_page(pool, volume, PageKind::LongRec, 0, ts)?;
        let body = page::body_mut(pin.bytes_mut());
        body[0..NEXT_PTR_LEN].copy_from_slice(&next.0.to_le_bytes());
        body[NEXT_PTR_LEN..NEXT_PTR_LEN + chunk.len()].copy_from_slice(chunk);
        pin.mark_dirty(ts);
        next = pin.page_id();
    }
    Ok(LongRef {
        total_len: blob.len() as u64,
        head: next,
    })
}

/// Read a whole chain back.
pub fn read_chain(pool: &BufferPool, volume: &Arc<Volume>, long_ref: LongRef) -> Result<Bytes> {
    let cap = chunk_capacity(pool.page_size());
    let mut out = BytesMut::with_capacity(long_ref.total_len as usize);
    let mut remaining = long_ref.total_len as usize;
    let mut pid = long_ref.head;
    while remaining > 0 {
        if pid.is_none() {
            return Err(EngineError::CorruptPage {
                volume: volume.id(),
                page: long_ref.head,
                detail: format!("long-record chain short by {remaining} bytes"),
            });
        }
        let pin = pool.pin_read(volume.id(), pid)?;
        let header = page::PageHeader::decode(pin.bytes())?;
        if header.kind != PageKind::LongRec {
            return Err(EngineError::CorruptPage {
                volume: volume.id(),
                page: pid,
                detail: format!("long-record chain entered {:?} page", header.kind),
            });
        }
        let body = page::body(pin.bytes());
        let take = remaining.min(cap);
        out.extend_from_slice(&body[NEXT_PTR_LEN..NEXT_PTR_LEN + take]);
        remaining -= take;
        pid = PageId(u64::from_le_bytes(body[0..NEXT_PTR_LEN].try_into().unwrap()));
    }
    Ok(out.freeze())
}

/// Return every page of a chain to the free list.
pub fn free_chain(
    pool: &BufferPool,
    volume: &Arc<Volume>,
    head: PageId,
    ts: Timestamp,
) -> Result<()> {
    let mut pid = head;
    while !pid.is_none() {
        let next = {
            let pin = pool.pin_read(volume.id(), pid)?;
            let body = page::body(pin.bytes());
            PageId(u64::from_le_bytes(body[0..NEXT_PTR_LEN].try_into().unwrap()))
        };
        alloc::free_page(pool, volume, pid, ts)?;
        pid = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
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
        let (volume, _) =
            Volume::open_or_create(VolumeId(0), &VolumeSpec::new("main", dir.join("main.vol")), PS)
                .unwrap();
        volumes.add(Arc::clone(&volume));
        let pool = BufferPool::new(PS, 64, Arc::clone(&journal), volumes, fatal, cancel);
        pool.set_wal_enabled(true);
        (pool, volume, journal)
    }

    #[test]
    fn chain_round_trip() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        let blob: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let long_ref = write_chain(&pool, &volume, &blob, 1).unwrap();
        assert_eq!(long_ref.total_len, 5000);
        let back = read_chain(&pool, &volume, long_ref).unwrap();
        assert_eq!(&back[..], &blob[..]);
        journal.shutdown().unwrap();
    }

    #[test]
    fn chain_shorter_than_one_page() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        let blob = vec![0x42u8; 100];
        let long_ref = write_chain(&pool, &volume, &blob, 1).unwrap();
        let back = read_chain(&pool, &volume, long_ref).unwrap();
        assert_eq!(&back[..], &blob[..]);
        journal.shutdown().unwrap();
    }

    #[test]
    fn free_chain_recycles_pages() {
        let dir = tempdir().unwrap();
        let (pool, volume, journal) = harness(dir.path());
        let blob = vec![7u8; 4000];
        let long_ref = write_chain(&pool, &volume, &blob, 1).unwrap();
        free_chain(&pool, &volume, long_ref.head, 2).unwrap();
        // The freed pages come back for the next chain.
        let again = write_chain(&pool, &volume, &blob, 3).unwrap();
        let back = read_chain(&pool, &volume, again).unwrap();
        assert_eq!(back.len(), 4000);
        journal.shutdown().unwrap();
    }
}
