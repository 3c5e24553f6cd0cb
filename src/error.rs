use thiserror::Error;

use crate::common::{PageId, Timestamp, VolumeId};

/// All failures surfaced by the engine.
///
/// `Rollback` is the one recoverable kind: it means an optimistic commit lost
/// to a concurrent committer and the transaction body should be re-run at a
/// fresh read timestamp. Everything else propagates to the caller unchanged.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt page {page} in volume {volume}: {detail}")]
    CorruptPage {
        volume: VolumeId,
        page: PageId,
        detail: String,
    },

    #[error("corrupt journal at {file} offset {offset}: {detail}")]
    CorruptJournal {
        file: String,
        offset: u64,
        detail: String,
    },

    #[error("corrupt state: {0}")]
    Corrupt(String),

    #[error("volume {0} is full")]
    VolumeFull(VolumeId),

    #[error("key too long: {0} bytes (max {max})", max = crate::common::MAX_KEY_LEN)]
    KeyTooLong(usize),

    #[error("value too large: {0} bytes (max {max})", max = crate::common::MAX_VALUE_LEN)]
    ValueTooLarge(usize),

    #[error("write conflict at commit (read timestamp {read_ts})")]
    Rollback { read_ts: Timestamp },

    #[error("transaction failed after {0} retries")]
    TransactionFailed(u32),

    #[error("operation timed out")]
    Timeout,

    #[error("operation interrupted")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("recovery failed: {0}")]
    Recovery(String),

    #[error("engine is closed or non-writable after a fatal error")]
    EngineClosed,
}

impl EngineError {
    /// True for errors that poison the engine: once one of these is raised
    /// from a write path the engine marks itself non-writable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CorruptPage { .. }
                | EngineError::CorruptJournal { .. }
                | EngineError::Corrupt(_)
                | EngineError::InvariantViolation(_)
        )
    }

    /// True when the caller may retry the transaction body.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Rollback { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
