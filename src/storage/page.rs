// # Page Header
//
// Every non-header page starts with a fixed 32-byte header followed by the
// page body. The checksum covers the whole page with the crc field zeroed,
// so a page is sealed once after its last mutation and verified on every
// read from disk.
//
// Layout (little-endian):
//
// ```text
// offset  size  field
//      0     1  kind
//      1     1  level          (tree level; 0 for leaves and non-tree pages)
//      2     2  key_count
//      4     8  self page id
//     12     8  right sibling page id
//     20     8  version stamp
//     28     4  crc32
// ```

use crate::common::{PageId, Timestamp, VolumeId};
use crate::error::{EngineError, Result};

pub const PAGE_HEADER_LEN: usize = 32;

const OFF_KIND: usize = 0;
const OFF_LEVEL: usize = 1;
const OFF_KEY_COUNT: usize = 2;
const OFF_SELF_ID: usize = 4;
const OFF_RIGHT_SIBLING: usize = 12;
const OFF_VERSION_STAMP: usize = 20;
const OFF_CRC: usize = 28;

/// Tagged page variant. Behavior dispatches from this, not from types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// On the free list or never allocated.
    Free = 0,
    /// The volume header (page 0 only; different layout, see `volume`).
    Header = 1,
    /// B-tree index page: keys and child page ids.
    Index = 2,
    /// B-tree leaf page: keys and values or long-record references.
    Data = 3,
    /// Long-record continuation page.
    LongRec = 4,
    /// Scheduled for the free list but not yet linked in.
    Garbage = 5,
}

impl PageKind {
    pub fn from_u8(raw: u8) -> Option<PageKind> {
        match raw {
            0 => Some(PageKind::Free),
            1 => Some(PageKind::Header),
            2 => Some(PageKind::Index),
            3 => Some(PageKind::Data),
            4 => Some(PageKind::LongRec),
            5 => Some(PageKind::Garbage),
            _ => None,
        }
    }
}

/// Decoded form of the 32-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub kind: PageKind,
    pub level: u8,
    pub key_count: u16,
    pub page_id: PageId,
    pub right_sibling: PageId,
    pub version_stamp: Timestamp,
}

impl PageHeader {
    pub fn new(kind: PageKind, level: u8, page_id: PageId) -> Self {
        Self {
            kind,
            level,
            key_count: 0,
            page_id,
            right_sibling: PageId::NONE,
            version_stamp: 0,
        }
    }

    /// Decode without validating the checksum.
    pub fn decode(buf: &[u8]) -> Result<PageHeader> {
        debug_assert!(buf.len() >= PAGE_HEADER_LEN);
        let kind = PageKind::from_u8(buf[OFF_KIND])
            .ok_or_else(|| EngineError::Corrupt(format!("bad page kind {}", buf[OFF_KIND])))?;
        Ok(PageHeader {
            kind,
            level: buf[OFF_LEVEL],
            key_count: u16::from_le_bytes(buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 2].try_into().unwrap()),
            page_id: PageId(u64::from_le_bytes(
                buf[OFF_SELF_ID..OFF_SELF_ID + 8].try_into().unwrap(),
            )),
            right_sibling: PageId(u64::from_le_bytes(
                buf[OFF_RIGHT_SIBLING..OFF_RIGHT_SIBLING + 8].try_into().unwrap(),
            )),
            version_stamp: u64::from_le_bytes(
                buf[OFF_VERSION_STAMP..OFF_VERSION_STAMP + 8].try_into().unwrap(),
            ),
        })
    }

    /// Write every field except the crc. The page must be sealed afterwards.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PAGE_HEADER_LEN);
        buf[OFF_KIND] = self.kind as u8;
        buf[OFF_LEVEL] = self.level;
        buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 2].copy_from_slice(&self.key_count.to_le_bytes());
        buf[OFF_SELF_ID..OFF_SELF_ID + 8].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[OFF_RIGHT_SIBLING..OFF_RIGHT_SIBLING + 8]
            .copy_from_slice(&self.right_sibling.0.to_le_bytes());
        buf[OFF_VERSION_STAMP..OFF_VERSION_STAMP + 8]
            .copy_from_slice(&self.version_stamp.to_le_bytes());
    }
}

/// Checksum of the page with the crc field treated as zero.
pub fn compute_crc(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..OFF_CRC]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[OFF_CRC + 4..]);
    hasher.finalize()
}

/// Stamp the checksum into the header. Call after the last mutation, before
/// the page goes to the journal or the volume.
pub fn seal(buf: &mut [u8]) {
    let crc = compute_crc(buf);
    buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
}

pub fn stored_crc(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[OFF_CRC..OFF_CRC + 4].try_into().unwrap())
}

pub fn version_stamp(buf: &[u8]) -> Timestamp {
    u64::from_le_bytes(buf[OFF_VERSION_STAMP..OFF_VERSION_STAMP + 8].try_into().unwrap())
}

/// Stamp the page's version. The caller reseals afterwards.
pub fn set_version_stamp(buf: &mut [u8], ts: Timestamp) {
    buf[OFF_VERSION_STAMP..OFF_VERSION_STAMP + 8].copy_from_slice(&ts.to_le_bytes());
}

/// Full validation applied to every page materialized from disk: kind field
/// valid, self id matches the requested id, checksum verifies.
pub fn validate(volume: VolumeId, expected: PageId, buf: &[u8]) -> Result<PageHeader> {
    let header = PageHeader::decode(buf).map_err(|e| EngineError::CorruptPage {
        volume,
        page: expected,
        detail: e.to_string(),
    })?;
    if header.page_id != expected {
        return Err(EngineError::CorruptPage {
            volume,
            page: expected,
            detail: format!("self id {} does not match", header.page_id),
        });
    }
    let crc = compute_crc(buf);
    if crc != stored_crc(buf) {
        return Err(EngineError::CorruptPage {
            volume,
            page: expected,
            detail: format!("crc mismatch: stored {:08x}, computed {crc:08x}", stored_crc(buf)),
        });
    }
    Ok(header)
}

/// Reset a buffer to an empty page of the given kind.
pub fn init(buf: &mut [u8], kind: PageKind, level: u8, page_id: PageId) {
    buf.fill(0);
    PageHeader::new(kind, level, page_id).encode(buf);
    seal(buf);
}

pub fn body(buf: &[u8]) -> &[u8] {
    &buf[PAGE_HEADER_LEN..]
}

pub fn body_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[PAGE_HEADER_LEN..]
}
