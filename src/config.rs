// # Engine Configuration
//
// Plain configuration structs validated once at `Engine::open`. Nothing here
// is re-read after open; background cadences and pool sizing are fixed for
// the engine's lifetime.

use std::path::PathBuf;
use std::time::Duration;

use crate::common::PAGE_SIZES;
use crate::error::{EngineError, Result};

/// Durability contract applied when a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitPolicy {
    /// Commit returns once the record is in the journal buffer; the writer
    /// makes it durable within `soft_flush_interval`.
    Soft,
    /// Commit blocks until the commit record is fsync-durable.
    Hard,
    /// Concurrent committers coalesce into one fsync and return when that
    /// fsync completes.
    #[default]
    Group,
}

/// Description of one volume file.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Volume name, unique within the engine.
    pub name: String,
    /// Path of the backing file.
    pub path: PathBuf,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Initial size in pages when creating.
    pub initial_pages: u64,
    /// Pages added per extension.
    pub extension_pages: u64,
    /// Hard ceiling in pages; allocation beyond this fails with
    /// `VolumeFull`.
    pub maximum_pages: u64,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            create: true,
            initial_pages: 32,
            extension_pages: 32,
            maximum_pages: 1 << 28,
        }
    }
}

/// Buffer pool sizing: an explicit frame count, or a memory budget the pool
/// divides by the page size.
#[derive(Debug, Clone, Copy)]
pub enum PoolSize {
    Frames(usize),
    Memory(usize),
}

impl PoolSize {
    pub(crate) fn frames(self, page_size: usize) -> usize {
        match self {
            PoolSize::Frames(n) => n,
            PoolSize::Memory(bytes) => bytes / page_size,
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// I/O unit for every volume of this engine. One of 1024, 2048, 4096,
    /// 8192, 16384.
    pub page_size: usize,
    /// Buffer pool sizing for that page size.
    pub pool_size: PoolSize,
    /// Directory holding journal files.
    pub journal_path: PathBuf,
    /// Journal file name prefix.
    pub journal_prefix: String,
    /// Rotation threshold for a journal generation.
    pub journal_file_max_size: u64,
    /// Volumes opened (or created) at engine open.
    pub volumes: Vec<VolumeSpec>,
    /// Default durability policy for commits.
    pub commit_policy: CommitPolicy,
    /// Bounded delay before SOFT commits reach stable storage.
    pub soft_flush_interval: Duration,
    /// Periodic checkpoint cadence, 10..=3600 seconds.
    pub checkpoint_interval: Duration,
    /// Disable journal copy-back deletion.
    pub append_only: bool,
    /// Directory for temporary volumes; defaults to `journal_path`.
    pub tmp_vol_dir: Option<PathBuf>,
    /// Ceiling in pages for each temporary volume.
    pub tmp_vol_max_pages: u64,
    /// Persist the set of resident pages at checkpoint.
    pub buffer_inventory_enabled: bool,
    /// Fault the persisted inventory back in at open.
    pub buffer_preload_enabled: bool,
    /// Retry cap for the cooperative retry helper.
    pub txn_retry_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 16384,
            pool_size: PoolSize::Frames(512),
            journal_path: PathBuf::from("."),
            journal_prefix: "cellardb_journal".to_string(),
            journal_file_max_size: 1 << 30,
            volumes: Vec::new(),
            commit_policy: CommitPolicy::default(),
            soft_flush_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(120),
            append_only: false,
            tmp_vol_dir: None,
            tmp_vol_max_pages: 1 << 20,
            buffer_inventory_enabled: false,
            buffer_preload_enabled: false,
            txn_retry_cap: 100,
        }
    }
}

impl EngineConfig {
    /// A small configuration rooted at `dir`: one volume named "main" and
    /// the journal beside it. Used heavily by tests.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            journal_path: dir.clone(),
            volumes: vec![VolumeSpec::new("main", dir.join("main.vol"))],
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !PAGE_SIZES.contains(&self.page_size) {
            return Err(EngineError::Config(format!(
                "unsupported page size {} (expected one of {:?})",
                self.page_size, PAGE_SIZES
            )));
        }
        let frames = self.pool_size.frames(self.page_size);
        if frames < 16 {
            return Err(EngineError::Config(format!(
                "buffer pool too small: {frames} frames (minimum 16)"
            )));
        }
        if self.volumes.is_empty() {
            return Err(EngineError::Config("no volumes configured".to_string()));
        }
        let mut names: Vec<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.volumes.len() {
            return Err(EngineError::Config("duplicate volume name".to_string()));
        }
        for spec in &self.volumes {
            if spec.maximum_pages < spec.initial_pages {
                return Err(EngineError::Config(format!(
                    "volume {}: maximum_pages {} below initial_pages {}",
                    spec.name, spec.maximum_pages, spec.initial_pages
                )));
            }
            if spec.extension_pages == 0 {
                return Err(EngineError::Config(format!(
                    "volume {}: extension_pages must be nonzero",
                    spec.name
                )));
            }
            if spec.initial_pages < 4 {
                return Err(EngineError::Config(format!(
                    "volume {}: initial_pages must be at least 4",
                    spec.name
                )));
            }
        }
        let cp = self.checkpoint_interval.as_secs();
        if !(10..=3600).contains(&cp) {
            return Err(EngineError::Config(format!(
                "checkpoint_interval {cp}s outside 10..=3600"
            )));
        }
        if self.journal_file_max_size < 1 << 20 {
            return Err(EngineError::Config(
                "journal_file_max_size below 1 MiB".to_string(),
            ));
        }
        if self.journal_prefix.is_empty() || self.journal_prefix.contains('.') {
            return Err(EngineError::Config(
                "journal_prefix must be nonempty and dot-free".to_string(),
            ));
        }
        if self.txn_retry_cap == 0 {
            return Err(EngineError::Config("txn_retry_cap must be nonzero".to_string()));
        }
        Ok(())
    }
}
