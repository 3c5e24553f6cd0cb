// # Volume
//
// A file-backed sequence of fixed-size pages. Page 0 is the volume header;
// page 1 is the root of the reserved tree directory. The header's
// allocation fields (next page id, free-list head) are mutated through the
// buffer pool like any other page so that allocation is covered by the
// journal; this module only does raw file I/O, validation, and extension.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::common::{PageId, Timestamp, VolumeId};
use crate::config::VolumeSpec;
use crate::error::{EngineError, Result};
use crate::storage::page;

pub const VOLUME_MAGIC: &[u8; 32] = b"CELLARDB VOLUME FORMAT 1        ";
pub const VOLUME_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 32;
const OFF_PAGE_SIZE: usize = 36;
const OFF_NEXT_PAGE: usize = 40;
const OFF_FREE_HEAD: usize = 48;
const OFF_DIR_ROOT: usize = 56;
const OFF_STAMP: usize = 64;

/// Decoded mutable fields of the header page. The magic, version, and page
/// size are fixed at creation and only checked thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHeader {
    pub next_page_id: u64,
    pub free_list_head: PageId,
    pub directory_root: PageId,
    pub version_stamp: Timestamp,
}

impl VolumeHeader {
    /// Decode from a header-page image, checking the fixed fields.
    pub fn decode(expected_page_size: usize, buf: &[u8]) -> Result<VolumeHeader> {
        if &buf[OFF_MAGIC..OFF_MAGIC + 32] != VOLUME_MAGIC {
            return Err(EngineError::Corrupt("bad volume magic".to_string()));
        }
        let version = u32::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
        if version != VOLUME_VERSION {
            return Err(EngineError::Corrupt(format!(
                "unsupported volume format version {version}"
            )));
        }
        let page_size = u32::from_le_bytes(buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap());
        if page_size as usize != expected_page_size {
            return Err(EngineError::Config(format!(
                "volume has page size {page_size}, engine configured for {expected_page_size}"
            )));
        }
        Ok(VolumeHeader {
            next_page_id: u64::from_le_bytes(buf[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 8].try_into().unwrap()),
            free_list_head: PageId(u64::from_le_bytes(
                buf[OFF_FREE_HEAD..OFF_FREE_HEAD + 8].try_into().unwrap(),
            )),
            directory_root: PageId(u64::from_le_bytes(
                buf[OFF_DIR_ROOT..OFF_DIR_ROOT + 8].try_into().unwrap(),
            )),
            version_stamp: u64::from_le_bytes(buf[OFF_STAMP..OFF_STAMP + 8].try_into().unwrap()),
        })
    }

    /// Encode onto a header-page image, rewriting the fixed fields too.
    pub fn encode(&self, page_size: usize, buf: &mut [u8]) {
        buf[OFF_MAGIC..OFF_MAGIC + 32].copy_from_slice(VOLUME_MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&(page_size as u32).to_le_bytes());
        buf[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 8].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[OFF_FREE_HEAD..OFF_FREE_HEAD + 8].copy_from_slice(&self.free_list_head.0.to_le_bytes());
        buf[OFF_DIR_ROOT..OFF_DIR_ROOT + 8].copy_from_slice(&self.directory_root.0.to_le_bytes());
        buf[OFF_STAMP..OFF_STAMP + 8].copy_from_slice(&self.version_stamp.to_le_bytes());
    }
}

pub struct Volume {
    id: VolumeId,
    name: String,
    path: PathBuf,
    page_size: usize,
    extension_pages: u64,
    maximum_pages: u64,
    temporary: bool,
    file: Mutex<File>,
    /// Current file capacity in pages.
    file_pages: AtomicU64,
}

impl Volume {
    /// Open an existing volume file, or create it when the spec allows.
    /// Returns the volume and whether it was created by this call.
    pub fn open_or_create(id: VolumeId, spec: &VolumeSpec, page_size: usize) -> Result<(Arc<Volume>, bool)> {
        if spec.path.exists() {
            let volume = Self::open(id, spec, page_size)?;
            Ok((volume, false))
        } else if spec.create {
            let volume = Self::create(id, spec, page_size)?;
            Ok((volume, true))
        } else {
            Err(EngineError::Config(format!(
                "volume {} missing at {} and create is disabled",
                spec.name,
                spec.path.display()
            )))
        }
    }

    fn open(id: VolumeId, spec: &VolumeSpec, page_size: usize) -> Result<Arc<Volume>> {
        let file = OpenOptions::new().read(true).write(true).open(&spec.path)?;
        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 || len < 2 * page_size as u64 {
            return Err(EngineError::Corrupt(format!(
                "volume {} has irregular length {len}",
                spec.name
            )));
        }
        let volume = Arc::new(Volume {
            id,
            name: spec.name.clone(),
            path: spec.path.clone(),
            page_size,
            extension_pages: spec.extension_pages,
            maximum_pages: spec.maximum_pages,
            temporary: false,
            file: Mutex::new(file),
            file_pages: AtomicU64::new(len / page_size as u64),
        });
        // Fail early on a foreign or damaged header.
        volume.read_header()?;
        info!(volume = %spec.name, pages = len / page_size as u64, "opened volume");
        Ok(volume)
    }

    fn create(id: VolumeId, spec: &VolumeSpec, page_size: usize) -> Result<Arc<Volume>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&spec.path)?;
        let volume = Arc::new(Volume {
            id,
            name: spec.name.clone(),
            path: spec.path.clone(),
            page_size,
            extension_pages: spec.extension_pages,
            maximum_pages: spec.maximum_pages,
            temporary: false,
            file: Mutex::new(file),
            file_pages: AtomicU64::new(0),
        });
        volume.format(spec.initial_pages)?;
        info!(volume = %spec.name, "created volume");
        Ok(volume)
    }

    /// Create an ephemeral volume: journal-bypassing, deleted on close.
    pub fn create_temporary(
        id: VolumeId,
        name: &str,
        dir: &std::path::Path,
        page_size: usize,
        maximum_pages: u64,
    ) -> Result<Arc<Volume>> {
        let path = dir.join(format!("{name}.tmp.vol"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let volume = Arc::new(Volume {
            id,
            name: name.to_string(),
            path,
            page_size,
            extension_pages: 32,
            maximum_pages,
            temporary: true,
            file: Mutex::new(file),
            file_pages: AtomicU64::new(0),
        });
        volume.format(8)?;
        debug!(volume = name, "created temporary volume");
        Ok(volume)
    }

    /// Lay down the header page and the empty directory root.
    fn format(&self, initial_pages: u64) -> Result<()> {
        let initial_pages = initial_pages.max(4);
        let mut buf = vec![0u8; self.page_size];
        VolumeHeader {
            next_page_id: 2,
            free_list_head: PageId::NONE,
            directory_root: PageId::DIRECTORY_ROOT,
            version_stamp: 0,
        }
        .encode(self.page_size, &mut buf);
        {
            let mut file = self.file.lock();
            file.set_len(initial_pages * self.page_size as u64)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
        }
        self.file_pages.store(initial_pages, Ordering::SeqCst);
        // Empty directory leaf.
        buf.fill(0);
        page::init(&mut buf, page::PageKind::Data, 0, PageId::DIRECTORY_ROOT);
        self.write_page(PageId::DIRECTORY_ROOT, &buf)?;
        self.sync()?;
        Ok(())
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn maximum_pages(&self) -> u64 {
        self.maximum_pages
    }

    /// Read and validate one page into `buf`. Header pages are checked
    /// against the volume magic; all others against self id and crc.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if page_id.0 >= self.file_pages.load(Ordering::SeqCst) {
            return Err(EngineError::CorruptPage {
                volume: self.id,
                page: page_id,
                detail: "read past end of volume".to_string(),
            });
        }
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(page_id.0 * self.page_size as u64))?;
            file.read_exact(buf)?;
        }
        if page_id == PageId::HEADER {
            VolumeHeader::decode(self.page_size, buf).map_err(|e| EngineError::CorruptPage {
                volume: self.id,
                page: page_id,
                detail: e.to_string(),
            })?;
        } else {
            page::validate(self.id, page_id, buf)?;
        }
        Ok(())
    }

    /// Write one page image. Durability ordering against the journal is the
    /// buffer pool's responsibility; this is a plain lazy write.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if page_id.0 >= self.file_pages.load(Ordering::SeqCst) {
            return Err(EngineError::InvariantViolation(format!(
                "write of unallocated page {page_id} in volume {}",
                self.name
            )));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.0 * self.page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Grow the file so `page_id` is addressable, honoring `maximum_pages`.
    pub fn ensure_capacity(&self, page_id: PageId) -> Result<()> {
        if page_id.0 >= self.maximum_pages {
            return Err(EngineError::VolumeFull(self.id));
        }
        let mut current = self.file_pages.load(Ordering::SeqCst);
        if page_id.0 < current {
            return Ok(());
        }
        let file = self.file.lock();
        // Re-check under the lock; another thread may have extended.
        current = self.file_pages.load(Ordering::SeqCst);
        if page_id.0 < current {
            return Ok(());
        }
        let mut target = current;
        while target <= page_id.0 {
            target += self.extension_pages;
        }
        target = target.min(self.maximum_pages);
        file.set_len(target * self.page_size as u64)?;
        self.file_pages.store(target, Ordering::SeqCst);
        debug!(volume = %self.name, pages = target, "extended volume");
        Ok(())
    }

    /// Raw read of the header page fields, bypassing the buffer pool. Used
    /// at open time before the pool exists.
    pub fn read_header(&self) -> Result<VolumeHeader> {
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
        }
        VolumeHeader::decode(self.page_size, &buf)
    }

    /// Truncate and delete the backing file. Temporary volumes only.
    pub fn discard(&self) -> Result<()> {
        debug_assert!(self.temporary);
        {
            let file = self.file.lock();
            file.set_len(0)?;
        }
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// The engine's open volumes, indexed by `VolumeId`.
pub struct VolumeSet {
    volumes: RwLock<Vec<Arc<Volume>>>,
}

impl VolumeSet {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, volume: Arc<Volume>) -> VolumeId {
        let mut volumes = self.volumes.write();
        debug_assert_eq!(volume.id().0 as usize, volumes.len());
        let id = volume.id();
        volumes.push(volume);
        id
    }

    pub fn get(&self, id: VolumeId) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown volume {id}")))
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.read().iter().find(|v| v.name() == name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().clone()
    }

    pub fn next_id(&self) -> VolumeId {
        VolumeId(self.volumes.read().len() as u16)
    }
}

impl Default for VolumeSet {
    fn default() -> Self {
        Self::new()
    }
}
