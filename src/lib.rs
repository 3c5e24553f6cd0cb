// # CellarDB
//
// An embedded, crash-safe, snapshot-isolated ordered key/value storage
// engine. State lives in fixed-size pages inside volume files; every change
// is sequenced through a write-ahead journal; a bounded buffer pool caches
// pages; a B-tree with prefix-compressed keys and long-record chains indexes
// them; transactions read at a fixed snapshot and commit optimistically.
//
// The public surface is deliberately small: open an [`Engine`], obtain an
// [`Exchange`] for a tree, and drive point/range operations through it,
// either auto-committed or inside [`Engine::transact`].
//
// ```rust,ignore
// let engine = Engine::open(EngineConfig::in_dir("/var/lib/app"))?;
// let mut ex = engine.exchange("main", "people")?;
// engine.transact(|txn| {
//     ex.key_mut().clear().append_str("bob");
//     ex.set_value(b"builder");
//     ex.store_in(txn)
// })?;
// ```

pub mod accumulator;
pub mod buffer;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod journal;
pub mod key;
pub mod storage;
pub mod tree;
pub mod txn;
pub mod value;

pub use accumulator::AccumulatorKind;
pub use common::{PageId, Timestamp, TreeId, TxnId, VolumeId};
pub use config::{CommitPolicy, EngineConfig, PoolSize, VolumeSpec};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use exchange::{Direction, Exchange};
pub use key::{Key, Segment};
pub use txn::transaction::Transaction;
pub use value::Value;
