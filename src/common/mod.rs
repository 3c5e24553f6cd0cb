// # Common Types
//
// Shared identifiers, timestamps, and size limits used across all engine
// modules. Every subsystem addresses pages, trees, and volumes through the
// newtypes defined here; raw integers never cross module boundaries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Size Limits
// ============================================================================

/// Maximum encoded key length in bytes.
pub const MAX_KEY_LEN: usize = 2047;

/// Maximum value length in bytes (64 MiB).
pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;

/// Number of accumulator slots per tree.
pub const ACCUMULATOR_SLOTS: usize = 64;

/// Supported page sizes.
pub const PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

// ============================================================================
// Identifiers
// ============================================================================

/// Identifies a volume within an engine. Index into the engine's volume set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u16);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies a tree within a volume. Tree 0 is the reserved directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u32);

impl TreeId {
    /// The reserved tree-directory tree.
    pub const DIRECTORY: TreeId = TreeId(0);
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identifies a page within a volume. Page 0 is the volume header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel for "no page" (right sibling of the rightmost page, empty
    /// free list, end of a long-record chain).
    pub const NONE: PageId = PageId(0);

    /// The volume header page.
    pub const HEADER: PageId = PageId(0);

    /// The root of the reserved directory tree.
    pub const DIRECTORY_ROOT: PageId = PageId(1);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Commit/read timestamp drawn from the engine's monotonic counter.
///
/// Timestamp 0 precedes every commit; the first committed transaction gets
/// timestamp 1.
pub type Timestamp = u64;

/// Transaction identifier. Distinct from timestamps: a transaction keeps its
/// id across retries of the commit protocol, while timestamps are assigned
/// fresh at begin and commit.
pub type TxnId = u64;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation consulted at suspension points (I/O waits,
/// journal fsync waits, eviction waits, retry backoff). Replaces sentinel
/// exceptions: a cancelled wait surfaces `EngineError::Interrupted`.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out of a wait loop if cancellation was requested.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::EngineError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_once_set() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
        assert!(token.is_cancelled());
    }

    #[test]
    fn page_id_sentinels() {
        assert!(PageId::NONE.is_none());
        assert_eq!(PageId::HEADER, PageId(0));
        assert!(!PageId::DIRECTORY_ROOT.is_none());
    }

    #[test]
    fn display_forms() {
        assert_eq!(VolumeId(3).to_string(), "v3");
        assert_eq!(TreeId(7).to_string(), "t7");
        assert_eq!(PageId(42).to_string(), "p42");
    }
}
