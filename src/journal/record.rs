// # Journal Records
//
// Fixed binary framing, one record at a time:
//
// ```text
// u32 body length | u8 type | u64 timestamp | u32 crc32(body) | body
// ```
//
// All integers little-endian. A zero length terminates the valid region of
// a journal file; the zero-padded tail beyond it is tolerated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::accumulator::AccumulatorKind;
use crate::common::{PageId, Timestamp, TreeId, TxnId, VolumeId};
use crate::error::{EngineError, Result};

/// Frame header length: length + type + timestamp + crc.
pub const RECORD_HEADER_LEN: usize = 4 + 1 + 8 + 4;

pub const TYPE_PAGE_IMAGE: u8 = 1;
pub const TYPE_TXN_BEGIN: u8 = 2;
pub const TYPE_TXN_UPDATE: u8 = 3;
pub const TYPE_TXN_COMMIT: u8 = 4;
pub const TYPE_TXN_ROLLBACK: u8 = 5;
pub const TYPE_ACCUM_UPDATE: u8 = 6;
pub const TYPE_CHECKPOINT: u8 = 7;
pub const TYPE_TREE_META: u8 = 8;

/// Tombstone marker in the value-length field of a TxnUpdate body.
const VLEN_TOMBSTONE: u32 = 0x8000_0000;

/// Accumulator state captured by a checkpoint: the folded value at the
/// checkpoint's base timestamp plus, for SEQ, the allocation high water.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorSnapshot {
    pub tree: TreeId,
    pub slot: u8,
    pub kind: AccumulatorKind,
    pub value: i64,
    pub high_water: i64,
}

/// Body of a CHECKPOINT record. Recovery replays only records newer than
/// the base timestamp of the last valid checkpoint, seeding accumulator
/// state and volume stamps from here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CheckpointRecord {
    pub checkpoint_id: u64,
    pub base_timestamp: Timestamp,
    pub active_txns: Vec<TxnId>,
    pub volume_stamps: Vec<(VolumeId, Timestamp)>,
    pub accumulators: Vec<AccumulatorSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// Full image of a page, appended before the page reaches its volume.
    PageImage {
        volume: VolumeId,
        page_id: PageId,
        image: Bytes,
    },
    TxnBegin {
        txn_id: TxnId,
    },
    /// One buffered write of a committing transaction. `value: None` is a
    /// tombstone.
    TxnUpdate {
        txn_id: TxnId,
        tree: TreeId,
        key: Bytes,
        value: Option<Bytes>,
    },
    TxnCommit {
        txn_id: TxnId,
    },
    TxnRollback {
        txn_id: TxnId,
    },
    AccumulatorUpdate {
        txn_id: TxnId,
        tree: TreeId,
        slot: u8,
        kind: AccumulatorKind,
        arg: i64,
    },
    Checkpoint(CheckpointRecord),
    /// Tree directory change: emitted when a tree is created or removed
    /// (root `PageId::NONE` marks removal), carrying the tree's
    /// accumulator seed values as of the change.
    TreeMeta {
        volume: VolumeId,
        tree: TreeId,
        name: String,
        root: PageId,
        accumulators: Vec<AccumulatorSnapshot>,
    },
}

fn put_accumulator_snapshot(out: &mut BytesMut, snap: &AccumulatorSnapshot) {
    out.put_u32_le(snap.tree.0);
    out.put_u8(snap.slot);
    out.put_u8(snap.kind as u8);
    out.put_i64_le(snap.value);
    out.put_i64_le(snap.high_water);
}

fn get_accumulator_snapshot(buf: &mut &[u8]) -> Result<AccumulatorSnapshot> {
    if buf.remaining() < 22 {
        return Err(EngineError::Corrupt(
            "truncated accumulator snapshot".to_string(),
        ));
    }
    let tree = TreeId(buf.get_u32_le());
    let slot = buf.get_u8();
    let kind = AccumulatorKind::from_u8(buf.get_u8())
        .ok_or_else(|| EngineError::Corrupt("bad accumulator kind".to_string()))?;
    let value = buf.get_i64_le();
    let high_water = buf.get_i64_le();
    Ok(AccumulatorSnapshot {
        tree,
        slot,
        kind,
        value,
        high_water,
    })
}

impl JournalRecord {
    pub fn type_code(&self) -> u8 {
        match self {
            JournalRecord::PageImage { .. } => TYPE_PAGE_IMAGE,
            JournalRecord::TxnBegin { .. } => TYPE_TXN_BEGIN,
            JournalRecord::TxnUpdate { .. } => TYPE_TXN_UPDATE,
            JournalRecord::TxnCommit { .. } => TYPE_TXN_COMMIT,
            JournalRecord::TxnRollback { .. } => TYPE_TXN_ROLLBACK,
            JournalRecord::AccumulatorUpdate { .. } => TYPE_ACCUM_UPDATE,
            JournalRecord::Checkpoint(_) => TYPE_CHECKPOINT,
            JournalRecord::TreeMeta { .. } => TYPE_TREE_META,
        }
    }

    fn encode_body(&self, out: &mut BytesMut) {
        match self {
            JournalRecord::PageImage {
                volume,
                page_id,
                image,
            } => {
                out.put_u16_le(volume.0);
                out.put_u64_le(page_id.0);
                out.put_slice(image);
            }
            JournalRecord::TxnBegin { txn_id }
            | JournalRecord::TxnCommit { txn_id }
            | JournalRecord::TxnRollback { txn_id } => {
                out.put_u64_le(*txn_id);
            }
            JournalRecord::TxnUpdate {
                txn_id,
                tree,
                key,
                value,
            } => {
                out.put_u64_le(*txn_id);
                out.put_u32_le(tree.0);
                out.put_u16_le(key.len() as u16);
                out.put_slice(key);
                match value {
                    Some(v) => {
                        out.put_u32_le(v.len() as u32);
                        out.put_slice(v);
                    }
                    None => out.put_u32_le(VLEN_TOMBSTONE),
                }
            }
            JournalRecord::AccumulatorUpdate {
                txn_id,
                tree,
                slot,
                kind,
                arg,
            } => {
                out.put_u64_le(*txn_id);
                out.put_u32_le(tree.0);
                out.put_u8(*slot);
                out.put_u8(*kind as u8);
                out.put_i64_le(*arg);
            }
            JournalRecord::Checkpoint(cp) => {
                out.put_u64_le(cp.checkpoint_id);
                out.put_u64_le(cp.base_timestamp);
                out.put_u32_le(cp.active_txns.len() as u32);
                for id in &cp.active_txns {
                    out.put_u64_le(*id);
                }
                out.put_u16_le(cp.volume_stamps.len() as u16);
                for (volume, stamp) in &cp.volume_stamps {
                    out.put_u16_le(volume.0);
                    out.put_u64_le(*stamp);
                }
                out.put_u32_le(cp.accumulators.len() as u32);
                for acc in &cp.accumulators {
                    put_accumulator_snapshot(out, acc);
                }
            }
            JournalRecord::TreeMeta {
                volume,
                tree,
                name,
                root,
                accumulators,
            } => {
                out.put_u16_le(volume.0);
                out.put_u32_le(tree.0);
                out.put_u64_le(root.0);
                out.put_u16_le(name.len() as u16);
                out.put_slice(name.as_bytes());
                out.put_u32_le(accumulators.len() as u32);
                for acc in accumulators {
                    put_accumulator_snapshot(out, acc);
                }
            }
        }
    }

    /// Encode the full frame, crc included.
    pub fn encode(&self, timestamp: Timestamp) -> Vec<u8> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.push(self.type_code());
        frame.extend_from_slice(&timestamp.to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a record body. The caller has already verified the crc.
    pub fn decode(type_code: u8, body: &[u8]) -> Result<JournalRecord> {
        let mut buf = body;
        let short = || EngineError::Corrupt("truncated journal record body".to_string());
        macro_rules! need {
            ($n:expr) => {
                if buf.remaining() < $n {
                    return Err(short());
                }
            };
        }
        match type_code {
            TYPE_PAGE_IMAGE => {
                need!(10);
                let volume = VolumeId(buf.get_u16_le());
                let page_id = PageId(buf.get_u64_le());
                Ok(JournalRecord::PageImage {
                    volume,
                    page_id,
                    image: Bytes::copy_from_slice(buf),
                })
            }
            TYPE_TXN_BEGIN => {
                need!(8);
                Ok(JournalRecord::TxnBegin {
                    txn_id: buf.get_u64_le(),
                })
            }
            TYPE_TXN_COMMIT => {
                need!(8);
                Ok(JournalRecord::TxnCommit {
                    txn_id: buf.get_u64_le(),
                })
            }
            TYPE_TXN_ROLLBACK => {
                need!(8);
                Ok(JournalRecord::TxnRollback {
                    txn_id: buf.get_u64_le(),
                })
            }
            TYPE_TXN_UPDATE => {
                need!(14);
                let txn_id = buf.get_u64_le();
                let tree = TreeId(buf.get_u32_le());
                let klen = buf.get_u16_le() as usize;
                need!(klen + 4);
                let key = Bytes::copy_from_slice(&buf[..klen]);
                buf.advance(klen);
                let vlen = buf.get_u32_le();
                let value = if vlen == VLEN_TOMBSTONE {
                    None
                } else {
                    let vlen = vlen as usize;
                    need!(vlen);
                    Some(Bytes::copy_from_slice(&buf[..vlen]))
                };
                Ok(JournalRecord::TxnUpdate {
                    txn_id,
                    tree,
                    key,
                    value,
                })
            }
            TYPE_ACCUM_UPDATE => {
                need!(22);
                let txn_id = buf.get_u64_le();
                let tree = TreeId(buf.get_u32_le());
                let slot = buf.get_u8();
                let kind = AccumulatorKind::from_u8(buf.get_u8())
                    .ok_or_else(|| EngineError::Corrupt("bad accumulator kind".to_string()))?;
                let arg = buf.get_i64_le();
                Ok(JournalRecord::AccumulatorUpdate {
                    txn_id,
                    tree,
                    slot,
                    kind,
                    arg,
                })
            }
            TYPE_CHECKPOINT => {
                need!(20);
                let checkpoint_id = buf.get_u64_le();
                let base_timestamp = buf.get_u64_le();
                let n_active = buf.get_u32_le() as usize;
                need!(n_active * 8 + 2);
                let mut active_txns = Vec::with_capacity(n_active);
                for _ in 0..n_active {
                    active_txns.push(buf.get_u64_le());
                }
                let n_volumes = buf.get_u16_le() as usize;
                need!(n_volumes * 10 + 4);
                let mut volume_stamps = Vec::with_capacity(n_volumes);
                for _ in 0..n_volumes {
                    let volume = VolumeId(buf.get_u16_le());
                    let stamp = buf.get_u64_le();
                    volume_stamps.push((volume, stamp));
                }
                let n_accums = buf.get_u32_le() as usize;
                need!(n_accums * 22);
                let mut accumulators = Vec::with_capacity(n_accums);
                for _ in 0..n_accums {
                    accumulators.push(get_accumulator_snapshot(&mut buf)?);
                }
                Ok(JournalRecord::Checkpoint(CheckpointRecord {
                    checkpoint_id,
                    base_timestamp,
                    active_txns,
                    volume_stamps,
                    accumulators,
                }))
            }
            TYPE_TREE_META => {
                need!(16);
                let volume = VolumeId(buf.get_u16_le());
                let tree = TreeId(buf.get_u32_le());
                let root = PageId(buf.get_u64_le());
                let nlen = buf.get_u16_le() as usize;
                need!(nlen + 4);
                let name = String::from_utf8(buf[..nlen].to_vec())
                    .map_err(|_| EngineError::Corrupt("non-utf8 tree name".to_string()))?;
                buf.advance(nlen);
                let n_accums = buf.get_u32_le() as usize;
                need!(n_accums * 22);
                let mut accumulators = Vec::with_capacity(n_accums);
                for _ in 0..n_accums {
                    accumulators.push(get_accumulator_snapshot(&mut buf)?);
                }
                Ok(JournalRecord::TreeMeta {
                    volume,
                    tree,
                    name,
                    root,
                    accumulators,
                })
            }
            other => Err(EngineError::Corrupt(format!(
                "unknown journal record type {other}"
            ))),
        }
    }
}
