// # Journal
//
// The write-ahead log. Every state-changing effect is sequenced here before
// it reaches a volume: transaction records at commit, page images at
// writeback, accumulator updates, checkpoints. A single writer thread
// consumes a bounded queue of encoded records, batches them, rotates
// generations, and coordinates group fsync through a condition variable.
//
// Durability rule (J2): a dirty page goes to its volume only after the
// journal is durable up to that page's last modification. The buffer pool
// enforces this by appending a page image and waiting on its sequence
// before the volume write.

pub mod copyback;
pub mod files;
pub mod record;
pub mod recovery;
pub mod writer;

pub use record::{AccumulatorSnapshot, CheckpointRecord, JournalRecord};
pub use writer::{Journal, JournalStats};
