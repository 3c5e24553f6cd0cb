// # Journal Writer
//
// One writer thread owns the current journal file. Appenders encode their
// record, take a sequence number, and enqueue; the writer drains the queue
// in batches, writes, rotates generations at the size threshold, and
// fsyncs. Durability is published as a high-water sequence under a mutex
// and condition variable, which is what makes GROUP commit work: every
// committer waiting on a sequence at or below the batch's last record is
// released by the one fsync.
//
// Appending happens under a small mutex so that sequence order equals file
// order. Commit records additionally serialize under the engine's commit
// lock, so commit order in the file equals commit-timestamp order, which is
// what recovery's prefix guarantee rests on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::common::{CancelToken, Timestamp};
use crate::error::{EngineError, Result};
use crate::journal::files::{self, FileHeader, FILE_HEADER_LEN};
use crate::journal::record::{CheckpointRecord, JournalRecord};

const QUEUE_DEPTH: usize = 1024;

enum WriterMsg {
    Record {
        seq: u64,
        bytes: Vec<u8>,
        sync: bool,
    },
    Flush,
    Shutdown,
    /// Stop without the final fsync. Crash simulation: whatever already
    /// reached the OS survives, nothing further is forced out.
    Abort,
}

struct SenderSlot {
    next_seq: u64,
    sender: Option<Sender<WriterMsg>>,
}

struct DurableState {
    durable_seq: u64,
    failed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JournalStats {
    pub records: u64,
    pub bytes: u64,
    pub fsyncs: u64,
    pub rotations: u64,
}

pub struct Journal {
    dir: PathBuf,
    prefix: String,
    page_size: usize,
    max_file_size: u64,
    soft_flush_interval: Duration,
    append_only: bool,
    cancel: CancelToken,
    fatal: Arc<AtomicBool>,
    slot: Mutex<SenderSlot>,
    durable: Mutex<DurableState>,
    durable_cv: Condvar,
    writer: Mutex<Option<JoinHandle<()>>>,
    current_generation: AtomicU64,
    last_checkpoint: Mutex<Option<CheckpointRecord>>,
    records: AtomicU64,
    bytes: AtomicU64,
    fsyncs: AtomicU64,
    rotations: AtomicU64,
}

impl Journal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: PathBuf,
        prefix: String,
        page_size: usize,
        max_file_size: u64,
        soft_flush_interval: Duration,
        append_only: bool,
        cancel: CancelToken,
        fatal: Arc<AtomicBool>,
    ) -> Arc<Journal> {
        Arc::new(Journal {
            dir,
            prefix,
            page_size,
            max_file_size,
            soft_flush_interval,
            append_only,
            cancel,
            fatal,
            slot: Mutex::new(SenderSlot {
                next_seq: 0,
                sender: None,
            }),
            durable: Mutex::new(DurableState {
                durable_seq: 0,
                failed: false,
            }),
            durable_cv: Condvar::new(),
            writer: Mutex::new(None),
            current_generation: AtomicU64::new(0),
            last_checkpoint: Mutex::new(None),
            records: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn append_only(&self) -> bool {
        self.append_only
    }

    pub fn current_generation(&self) -> u64 {
        self.current_generation.load(Ordering::SeqCst)
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointRecord> {
        self.last_checkpoint.lock().clone()
    }

    pub fn set_last_checkpoint(&self, checkpoint: CheckpointRecord) {
        *self.last_checkpoint.lock() = Some(checkpoint);
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            records: self.records.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }

    /// Open the next generation file and start the writer thread. Called
    /// once, after the recovery scan has read every existing generation.
    pub fn start(self: &Arc<Self>, start_generation: u64) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.sender.is_some() {
            return Err(EngineError::InvariantViolation(
                "journal writer already started".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.dir)?;
        let file = self.open_generation(start_generation)?;
        self.current_generation.store(start_generation, Ordering::SeqCst);
        let (tx, rx) = bounded(QUEUE_DEPTH);
        slot.sender = Some(tx);
        drop(slot);

        let journal = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cellardb-journal".to_string())
            .spawn(move || journal.writer_loop(rx, file, start_generation))
            .map_err(EngineError::Io)?;
        *self.writer.lock() = Some(handle);
        info!(generation = start_generation, "journal writer started");
        Ok(())
    }

    fn open_generation(&self, generation: u64) -> Result<File> {
        let path = self.dir.join(files::file_name(&self.prefix, generation));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let created_unix_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let header = FileHeader {
            generation,
            created_unix_secs,
            page_size: self.page_size as u32,
            max_size: self.max_file_size,
        };
        file.write_all(&header.encode())?;
        Ok(file)
    }

    /// Encode and enqueue a record. Returns the sequence to wait on.
    pub fn append(&self, record: &JournalRecord, timestamp: Timestamp) -> Result<u64> {
        self.append_inner(record, timestamp, false)
    }

    /// Like `append`, but asks the writer to fsync as soon as the record is
    /// written (HARD and GROUP commit, checkpoints, page images).
    pub fn append_sync(&self, record: &JournalRecord, timestamp: Timestamp) -> Result<u64> {
        self.append_inner(record, timestamp, true)
    }

    fn append_inner(&self, record: &JournalRecord, timestamp: Timestamp, sync: bool) -> Result<u64> {
        if self.durable.lock().failed {
            return Err(EngineError::EngineClosed);
        }
        let bytes = record.encode(timestamp);
        let len = bytes.len() as u64;
        let mut slot = self.slot.lock();
        let sender = slot
            .sender
            .as_ref()
            .ok_or(EngineError::EngineClosed)?
            .clone();
        slot.next_seq += 1;
        let seq = slot.next_seq;
        // Send while still holding the slot lock so queue order equals
        // sequence order.
        sender
            .send(WriterMsg::Record { seq, bytes, sync })
            .map_err(|_| EngineError::EngineClosed)?;
        drop(slot);
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        Ok(seq)
    }

    /// Ask the writer to flush without appending anything.
    pub fn flush(&self) {
        let slot = self.slot.lock();
        if let Some(sender) = slot.sender.as_ref() {
            let _ = sender.try_send(WriterMsg::Flush);
        }
    }

    /// Block until the journal is durable through `seq`.
    pub fn wait_durable(&self, seq: u64) -> Result<()> {
        let mut durable = self.durable.lock();
        loop {
            if durable.failed {
                return Err(EngineError::EngineClosed);
            }
            if durable.durable_seq >= seq {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(EngineError::Interrupted);
            }
            self.durable_cv
                .wait_for(&mut durable, Duration::from_millis(50));
        }
    }

    pub fn append_and_wait(&self, record: &JournalRecord, timestamp: Timestamp) -> Result<u64> {
        let seq = self.append_sync(record, timestamp)?;
        self.wait_durable(seq)?;
        Ok(seq)
    }

    /// Stop the writer without the final fsync. Records still in flight
    /// may reach the file but are never forced to stable storage; the
    /// journal refuses further appends.
    pub fn abort(&self) {
        let sender = {
            let mut slot = self.slot.lock();
            slot.sender.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(WriterMsg::Abort);
        }
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Flush, fsync, and stop the writer thread.
    pub fn shutdown(&self) -> Result<()> {
        let sender = {
            let mut slot = self.slot.lock();
            slot.sender.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(WriterMsg::Shutdown);
        }
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        if self.durable.lock().failed {
            return Err(EngineError::EngineClosed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writer thread
    // ------------------------------------------------------------------

    fn writer_loop(self: Arc<Self>, rx: Receiver<WriterMsg>, file: File, generation: u64) {
        let mut state = WriterFileState {
            file,
            generation,
            size: FILE_HEADER_LEN as u64,
            last_written_seq: 0,
            unflushed: false,
        };
        loop {
            let msg = rx.recv_timeout(self.soft_flush_interval);
            match msg {
                Ok(WriterMsg::Record { seq, bytes, sync }) => {
                    let mut want_sync = sync;
                    if let Err(e) = self.write_record(&mut state, seq, &bytes) {
                        self.fail(&e);
                        continue;
                    }
                    // Coalesce whatever else is already queued.
                    while let Ok(extra) = rx.try_recv() {
                        match extra {
                            WriterMsg::Record { seq, bytes, sync } => {
                                if let Err(e) = self.write_record(&mut state, seq, &bytes) {
                                    self.fail(&e);
                                    break;
                                }
                                want_sync |= sync;
                            }
                            WriterMsg::Flush => want_sync = true,
                            WriterMsg::Shutdown => {
                                self.sync_and_publish(&mut state);
                                debug!("journal writer stopped");
                                return;
                            }
                            WriterMsg::Abort => {
                                debug!("journal writer aborted");
                                return;
                            }
                        }
                    }
                    if want_sync {
                        self.sync_and_publish(&mut state);
                    }
                }
                Ok(WriterMsg::Flush) => {
                    if state.unflushed {
                        self.sync_and_publish(&mut state);
                    }
                }
                Ok(WriterMsg::Shutdown) => {
                    self.sync_and_publish(&mut state);
                    debug!("journal writer stopped");
                    return;
                }
                Ok(WriterMsg::Abort) => {
                    debug!("journal writer aborted");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if state.unflushed {
                        self.sync_and_publish(&mut state);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.sync_and_publish(&mut state);
                    debug!("journal writer stopped (channel closed)");
                    return;
                }
            }
        }
    }

    fn write_record(&self, state: &mut WriterFileState, seq: u64, bytes: &[u8]) -> Result<()> {
        if self.durable.lock().failed {
            return Err(EngineError::EngineClosed);
        }
        if state.size + bytes.len() as u64 > self.max_file_size {
            self.rotate(state)?;
        }
        state.file.write_all(bytes)?;
        state.size += bytes.len() as u64;
        state.last_written_seq = seq;
        state.unflushed = true;
        Ok(())
    }

    fn rotate(&self, state: &mut WriterFileState) -> Result<()> {
        // The old generation must be fully durable before records continue
        // in the next one.
        state.file.sync_all()?;
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        let next = state.generation + 1;
        let file = self.open_generation(next)?;
        state.file = file;
        state.generation = next;
        state.size = FILE_HEADER_LEN as u64;
        self.current_generation.store(next, Ordering::SeqCst);
        self.rotations.fetch_add(1, Ordering::Relaxed);
        info!(generation = next, "journal rotated");
        Ok(())
    }

    fn sync_and_publish(&self, state: &mut WriterFileState) {
        if let Err(e) = state.file.sync_all() {
            self.fail(&EngineError::Io(e));
            return;
        }
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        state.unflushed = false;
        let mut durable = self.durable.lock();
        durable.durable_seq = state.last_written_seq;
        drop(durable);
        self.durable_cv.notify_all();
    }

    fn fail(&self, e: &EngineError) {
        let mut durable = self.durable.lock();
        if !durable.failed {
            error!(error = %e, "journal write failed; engine is now non-writable");
            self.fatal.store(true, Ordering::SeqCst);
            durable.failed = true;
        }
        drop(durable);
        self.durable_cv.notify_all();
    }
}

struct WriterFileState {
    file: File,
    generation: u64,
    size: u64,
    last_written_seq: u64,
    unflushed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageId, VolumeId};
    use crate::journal::files::{list_generations, JournalFileReader};
    use tempfile::tempdir;

    fn new_journal(dir: &std::path::Path, max_file_size: u64) -> Arc<Journal> {
        Journal::new(
            dir.to_path_buf(),
            "j".to_string(),
            1024,
            max_file_size,
            Duration::from_millis(20),
            false,
            CancelToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn append_wait_shutdown_scan() {
        let dir = tempdir().unwrap();
        let journal = new_journal(dir.path(), 1 << 20);
        journal.start(1).unwrap();

        let mut last = 0;
        for txn_id in 0..10u64 {
            last = journal
                .append(&JournalRecord::TxnCommit { txn_id }, txn_id + 1)
                .unwrap();
        }
        journal.wait_durable(last).unwrap();
        journal.shutdown().unwrap();

        let generations = list_generations(dir.path(), "j").unwrap();
        assert_eq!(generations.len(), 1);
        let mut reader = JournalFileReader::open(&generations[0].1).unwrap();
        let mut count = 0;
        while reader.next_record().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn rotation_at_size_threshold() {
        let dir = tempdir().unwrap();
        // Small cap so page images force rotation.
        let journal = new_journal(dir.path(), 4096);
        journal.start(1).unwrap();
        let image = bytes::Bytes::from(vec![7u8; 1024]);
        let mut last = 0;
        for i in 0..8u64 {
            last = journal
                .append_sync(
                    &JournalRecord::PageImage {
                        volume: VolumeId(0),
                        page_id: PageId(i),
                        image: image.clone(),
                    },
                    i,
                )
                .unwrap();
        }
        journal.wait_durable(last).unwrap();
        assert!(journal.current_generation() > 1);
        journal.shutdown().unwrap();

        let generations = list_generations(dir.path(), "j").unwrap();
        assert!(generations.len() >= 2);
        // Every generation must still be a valid record stream.
        let mut total = 0;
        for (_, path) in &generations {
            let mut reader = JournalFileReader::open(path).unwrap();
            while reader.next_record().unwrap().is_some() {
                total += 1;
            }
        }
        assert_eq!(total, 8);
    }

    #[test]
    fn append_after_shutdown_fails() {
        let dir = tempdir().unwrap();
        let journal = new_journal(dir.path(), 1 << 20);
        journal.start(1).unwrap();
        journal.shutdown().unwrap();
        assert!(matches!(
            journal.append(&JournalRecord::TxnBegin { txn_id: 1 }, 1),
            Err(EngineError::EngineClosed)
        ));
    }

    #[test]
    fn group_waiters_all_released() {
        let dir = tempdir().unwrap();
        let journal = new_journal(dir.path(), 1 << 20);
        journal.start(1).unwrap();
        let mut handles = Vec::new();
        for txn_id in 0..8u64 {
            let journal = Arc::clone(&journal);
            handles.push(std::thread::spawn(move || {
                let seq = journal
                    .append_sync(&JournalRecord::TxnCommit { txn_id }, txn_id)
                    .unwrap();
                journal.wait_durable(seq).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        journal.shutdown().unwrap();
    }
}
