// # Multi-Version Values
//
// The byte blob stored at a leaf for one key: a list of versions ascending
// by commit timestamp. A snapshot read resolves to the newest version at or
// below its timestamp; a tombstone version makes the key absent from that
// timestamp on.
//
// ```text
// version := u64 commit_ts | u32 len+tombstone_flag | payload
// ```
//
// At most one version exists per timestamp; inserting at an existing
// timestamp replaces, which is what makes recovery replay idempotent.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::Timestamp;
use crate::error::{EngineError, Result};

const TOMBSTONE_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub ts: Timestamp,
    pub tombstone: bool,
    pub payload: Bytes,
}

pub fn decode(blob: &Bytes) -> Result<Vec<Version>> {
    let mut buf = blob.clone();
    let mut out = Vec::new();
    let mut prev_ts = 0u64;
    while buf.has_remaining() {
        if buf.remaining() < 12 {
            return Err(EngineError::Corrupt("truncated multi-version value".to_string()));
        }
        let ts = buf.get_u64_le();
        let len_raw = buf.get_u32_le();
        let tombstone = len_raw & TOMBSTONE_FLAG != 0;
        let len = (len_raw & !TOMBSTONE_FLAG) as usize;
        if buf.remaining() < len {
            return Err(EngineError::Corrupt("truncated multi-version payload".to_string()));
        }
        if !out.is_empty() && ts <= prev_ts {
            return Err(EngineError::Corrupt("multi-version list out of order".to_string()));
        }
        prev_ts = ts;
        let payload = buf.split_to(len);
        out.push(Version {
            ts,
            tombstone,
            payload,
        });
    }
    Ok(out)
}

fn encode(versions: &[Version]) -> Vec<u8> {
    let mut out = BytesMut::new();
    for version in versions {
        out.put_u64_le(version.ts);
        if version.tombstone {
            out.put_u32_le(TOMBSTONE_FLAG);
        } else {
            out.put_u32_le(version.payload.len() as u32);
            out.put_slice(&version.payload);
        }
    }
    out.to_vec()
}

/// Resolve a read at `at`: the newest version with ts <= at, with
/// tombstones reading as absent.
pub fn resolve_at(blob: &Bytes, at: Timestamp) -> Result<Option<Bytes>> {
    let versions = decode(blob)?;
    for version in versions.iter().rev() {
        if version.ts <= at {
            return Ok(if version.tombstone {
                None
            } else {
                Some(version.payload.clone())
            });
        }
    }
    Ok(None)
}

/// Timestamp of the newest version, for commit-time conflict validation.
pub fn latest_ts(blob: &Bytes) -> Result<Option<Timestamp>> {
    Ok(decode(blob)?.last().map(|v| v.ts))
}

/// Build the blob after writing (`Some`) or deleting (`None`) at `ts`,
/// pruning versions no live snapshot can see. `horizon` is the oldest
/// active read timestamp. Returns `None` when nothing observable remains
/// and the leaf entry itself can go.
pub fn updated_blob(
    existing: Option<&Bytes>,
    ts: Timestamp,
    value: Option<&[u8]>,
    horizon: Timestamp,
) -> Result<Option<Vec<u8>>> {
    let mut versions = match existing {
        Some(blob) => decode(blob)?,
        None => Vec::new(),
    };
    let new_version = Version {
        ts,
        tombstone: value.is_none(),
        payload: Bytes::copy_from_slice(value.unwrap_or(&[])),
    };
    match versions.binary_search_by_key(&ts, |v| v.ts) {
        Ok(pos) => versions[pos] = new_version,
        Err(pos) => versions.insert(pos, new_version),
    }
    let pruned = prune_versions(versions, horizon);
    if pruned.is_empty() {
        return Ok(None);
    }
    Ok(Some(encode(&pruned)))
}

/// Drop versions superseded by a later version that every live snapshot
/// already sees, and a trailing tombstone nothing can observe.
fn prune_versions(versions: Vec<Version>, horizon: Timestamp) -> Vec<Version> {
    // Index of the newest version at or below the horizon: everything
    // older is invisible to all current and future snapshots.
    let mut keep_from = 0;
    for (i, version) in versions.iter().enumerate() {
        if version.ts <= horizon {
            keep_from = i;
        } else {
            break;
        }
    }
    let kept = &versions[keep_from..];
    // A lone tombstone at or below the horizon is observable by nobody.
    if kept.len() == 1 && kept[0].tombstone && kept[0].ts <= horizon {
        return Vec::new();
    }
    kept.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(specs: &[(u64, Option<&[u8]>)]) -> Bytes {
        let versions: Vec<Version> = specs
            .iter()
            .map(|(ts, v)| Version {
                ts: *ts,
                tombstone: v.is_none(),
                payload: Bytes::copy_from_slice(v.unwrap_or(&[])),
            })
            .collect();
        Bytes::from(encode(&versions))
    }

    #[test]
    fn resolve_picks_newest_at_or_below() {
        let b = blob(&[(2, Some(b"old")), (5, Some(b"new"))]);
        assert_eq!(resolve_at(&b, 1).unwrap(), None);
        assert_eq!(resolve_at(&b, 2).unwrap().unwrap().as_ref(), b"old");
        assert_eq!(resolve_at(&b, 4).unwrap().unwrap().as_ref(), b"old");
        assert_eq!(resolve_at(&b, 5).unwrap().unwrap().as_ref(), b"new");
        assert_eq!(resolve_at(&b, 99).unwrap().unwrap().as_ref(), b"new");
    }

    #[test]
    fn tombstone_reads_as_absent() {
        let b = blob(&[(2, Some(b"v")), (6, None)]);
        assert!(resolve_at(&b, 5).unwrap().is_some());
        assert!(resolve_at(&b, 6).unwrap().is_none());
        assert_eq!(latest_ts(&b).unwrap(), Some(6));
    }

    #[test]
    fn insert_replaces_on_equal_timestamp() {
        let b = blob(&[(3, Some(b"a"))]);
        let updated = updated_blob(Some(&b), 3, Some(b"a"), 0).unwrap().unwrap();
        // Idempotent: replaying the same write yields the same blob.
        assert_eq!(updated, b.as_ref());
    }

    #[test]
    fn prune_drops_superseded_below_horizon() {
        let b = blob(&[(1, Some(b"a")), (2, Some(b"b")), (8, Some(b"c"))]);
        let updated = updated_blob(Some(&b), 9, Some(b"d"), 5).unwrap().unwrap();
        let versions = decode(&Bytes::from(updated)).unwrap();
        // Version 1 is superseded by 2 which every snapshot >= 5 sees;
        // 2 stays (visible to snapshots in [2,8)), 8 and 9 stay.
        let stamps: Vec<u64> = versions.iter().map(|v| v.ts).collect();
        assert_eq!(stamps, vec![2, 8, 9]);
    }

    #[test]
    fn entry_vanishes_when_only_an_old_tombstone_remains() {
        let b = blob(&[(2, Some(b"v"))]);
        let updated = updated_blob(Some(&b), 3, None, 10).unwrap();
        assert!(updated.is_none());
    }

    #[test]
    fn tombstone_above_horizon_is_kept() {
        let b = blob(&[(2, Some(b"v"))]);
        let updated = updated_blob(Some(&b), 7, None, 5).unwrap().unwrap();
        let versions = decode(&Bytes::from(updated)).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[1].tombstone);
    }

    #[test]
    fn decode_rejects_out_of_order() {
        let good = blob(&[(5, Some(b"x"))]);
        let mut bytes = good.to_vec();
        bytes.extend_from_slice(&encode(&[Version {
            ts: 3,
            tombstone: false,
            payload: Bytes::from_static(b"y"),
        }]));
        assert!(decode(&Bytes::from(bytes)).is_err());
    }
}
