// # Journal Copy-Back
//
// Reclaims journal space after checkpoints. A completed checkpoint at base
// timestamp B guarantees every page image with timestamp <= B has reached
// its volume, and no recovery will read records at or below B. A
// generation whose newest record timestamp is <= B is therefore dead, and
// whole dead generations are deleted, oldest first. Append-only engines
// keep everything.
//
// Deletion failures are transient: the pass logs and retries on the next
// tick rather than poisoning the engine.

use tracing::{info, warn};

use crate::error::Result;
use crate::journal::files::{self, JournalFileReader};
use crate::journal::writer::Journal;

/// One reclamation pass. Returns the number of generations deleted.
pub fn run_once(journal: &Journal) -> Result<usize> {
    if journal.append_only() {
        return Ok(0);
    }
    let Some(checkpoint) = journal.last_checkpoint() else {
        return Ok(0);
    };
    let generations = files::list_generations(journal.dir(), journal.prefix())?;
    let current = journal.current_generation();
    let mut deleted = 0usize;
    for (generation, path) in generations {
        if generation >= current {
            break;
        }
        let mut newest = 0u64;
        {
            let mut reader = match JournalFileReader::open(&path) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(generation, error = %e, "copy-back skipping unreadable generation");
                    break;
                }
            };
            while let Some(scanned) = reader.next_record()? {
                newest = newest.max(scanned.timestamp);
            }
        }
        if newest > checkpoint.base_timestamp {
            // Still live; later generations are at least as new.
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(generation, "journal generation reclaimed");
                deleted += 1;
            }
            Err(e) => {
                warn!(generation, error = %e, "copy-back delete failed; will retry");
                break;
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CancelToken, PageId, VolumeId};
    use crate::journal::record::{CheckpointRecord, JournalRecord};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn journal(dir: &std::path::Path, append_only: bool) -> Arc<Journal> {
        Journal::new(
            dir.to_path_buf(),
            "j".to_string(),
            1024,
            4096,
            Duration::from_millis(20),
            append_only,
            CancelToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn fill_generations(j: &Journal, pages: u64) {
        let image = bytes::Bytes::from(vec![3u8; 1024]);
        let mut last = 0;
        for i in 0..pages {
            last = j
                .append_sync(
                    &JournalRecord::PageImage {
                        volume: VolumeId(0),
                        page_id: PageId(i),
                        image: image.clone(),
                    },
                    i + 1,
                )
                .unwrap();
        }
        j.wait_durable(last).unwrap();
    }

    #[test]
    fn reclaims_generations_behind_checkpoint() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path(), false);
        j.start(1).unwrap();
        fill_generations(&j, 10);
        assert!(j.current_generation() > 2);
        j.set_last_checkpoint(CheckpointRecord {
            checkpoint_id: 1,
            base_timestamp: 10,
            ..Default::default()
        });
        let deleted = run_once(&j).unwrap();
        assert!(deleted > 0);
        let left = files::list_generations(dir.path(), "j").unwrap();
        assert_eq!(left.last().unwrap().0, j.current_generation());
        j.shutdown().unwrap();
    }

    #[test]
    fn keeps_generations_with_live_records() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path(), false);
        j.start(1).unwrap();
        fill_generations(&j, 10);
        let before = files::list_generations(dir.path(), "j").unwrap().len();
        // Checkpoint far behind the newest records: nothing reclaimable.
        j.set_last_checkpoint(CheckpointRecord {
            checkpoint_id: 1,
            base_timestamp: 0,
            ..Default::default()
        });
        assert_eq!(run_once(&j).unwrap(), 0);
        let after = files::list_generations(dir.path(), "j").unwrap().len();
        assert_eq!(before, after);
        j.shutdown().unwrap();
    }

    #[test]
    fn append_only_never_deletes() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path(), true);
        j.start(1).unwrap();
        fill_generations(&j, 10);
        j.set_last_checkpoint(CheckpointRecord {
            checkpoint_id: 1,
            base_timestamp: 100,
            ..Default::default()
        });
        assert_eq!(run_once(&j).unwrap(), 0);
        j.shutdown().unwrap();
    }

    #[test]
    fn missing_checkpoint_is_a_no_op() {
        let dir = tempdir().unwrap();
        let j = journal(dir.path(), false);
        j.start(1).unwrap();
        fill_generations(&j, 6);
        assert_eq!(run_once(&j).unwrap(), 0);
        j.shutdown().unwrap();
    }
}
