// # Recovery Scan
//
// Pure journal-side helpers for crash recovery: locate the newest valid
// checkpoint across all generations, then stream every record after its
// base timestamp to the engine's replay callback. The engine owns the
// replay semantics (restoring page images, buffering transactions until
// their commit record, folding accumulator updates); this module only
// walks the files.

use std::path::Path;

use tracing::info;

use crate::common::Timestamp;
use crate::error::Result;
use crate::journal::files::{self, JournalFileReader, ScannedRecord};
use crate::journal::record::{CheckpointRecord, JournalRecord};

/// Result of the pre-open scan.
pub struct JournalScan {
    /// Newest checkpoint found anywhere in the journal.
    pub last_checkpoint: Option<CheckpointRecord>,
    /// Generation the writer should continue at.
    pub next_generation: u64,
    /// True when any journal file was present.
    pub journal_present: bool,
}

/// Walk every generation looking for the newest checkpoint.
pub fn scan(dir: &Path, prefix: &str) -> Result<JournalScan> {
    let generations = files::list_generations(dir, prefix)?;
    let journal_present = !generations.is_empty();
    let next_generation = generations.last().map(|(g, _)| g + 1).unwrap_or(1);
    let mut last_checkpoint: Option<CheckpointRecord> = None;
    for (_, path) in &generations {
        let mut reader = JournalFileReader::open(path)?;
        while let Some(scanned) = reader.next_record()? {
            if let JournalRecord::Checkpoint(cp) = scanned.record {
                last_checkpoint = Some(cp);
            }
        }
    }
    if let Some(cp) = &last_checkpoint {
        info!(
            checkpoint_id = cp.checkpoint_id,
            base = cp.base_timestamp,
            "recovery found checkpoint"
        );
    }
    Ok(JournalScan {
        last_checkpoint,
        next_generation,
        journal_present,
    })
}

/// Stream every record with timestamp greater than `base_ts` to `apply`,
/// oldest generation first. Checkpoint records are not forwarded.
pub fn replay_after<F>(dir: &Path, prefix: &str, base_ts: Timestamp, mut apply: F) -> Result<()>
where
    F: FnMut(ScannedRecord) -> Result<()>,
{
    let generations = files::list_generations(dir, prefix)?;
    let mut forwarded = 0u64;
    for (generation, path) in &generations {
        let mut reader = JournalFileReader::open(path)?;
        while let Some(scanned) = reader.next_record()? {
            if scanned.timestamp <= base_ts {
                continue;
            }
            if matches!(scanned.record, JournalRecord::Checkpoint(_)) {
                continue;
            }
            forwarded += 1;
            apply(scanned)?;
        }
        info!(generation, "recovery replayed generation");
    }
    info!(records = forwarded, "recovery replay complete");
    Ok(())
}
