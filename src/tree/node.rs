// # Node Codec
//
// Decoded view of a B-tree page and its on-disk record layout. Keys on a
// page are stored prefix-compressed: each record carries the number of
// bytes it shares with its predecessor (the elided byte count) and only the
// differing suffix.
//
// Index record:  u16 ebc | u16 suffix_len | u64 child    | suffix
// Leaf record:   u16 ebc | u16 suffix_len | u32 vlen+flag | suffix | value
//
// Bit 31 of a leaf record's vlen marks a long-record reference; the value
// field is then 16 bytes: total length and head page of the chain.
//
// Index pages keep a low sentinel: the first entry's key is empty, so every
// lookup lands on some child. Operations mutate the decoded form and
// re-encode; a node that no longer fits its page signals overflow and the
// caller splits.

use bytes::Bytes;

use crate::common::{PageId, Timestamp};
use crate::error::{EngineError, Result};
use crate::storage::page::{self, PageHeader, PageKind, PAGE_HEADER_LEN};

const INDEX_RECORD_OVERHEAD: usize = 2 + 2 + 8;
const LEAF_RECORD_OVERHEAD: usize = 2 + 2 + 4;
const VLEN_LONG_REF: u32 = 0x8000_0000;
const LONG_REF_LEN: usize = 16;

/// Reference to a long-record chain stored in place of an inline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongRef {
    pub total_len: u64,
    pub head: PageId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Child page (index pages).
    Child(PageId),
    /// Inline value bytes (leaf pages).
    Value(Bytes),
    /// Reference to a long-record chain (leaf pages).
    Long(LongRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub key: Vec<u8>,
    pub payload: Payload,
}

/// Decoded page. `level` 0 is a leaf; anything above is an index page.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: PageKind,
    pub level: u8,
    pub right_sibling: PageId,
    pub version_stamp: Timestamp,
    pub entries: Vec<NodeEntry>,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl Node {
    pub fn new_leaf() -> Node {
        Node {
            kind: PageKind::Data,
            level: 0,
            right_sibling: PageId::NONE,
            version_stamp: 0,
            entries: Vec::new(),
        }
    }

    pub fn new_index(level: u8) -> Node {
        Node {
            kind: PageKind::Index,
            level,
            right_sibling: PageId::NONE,
            version_stamp: 0,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn decode(buf: &[u8]) -> Result<Node> {
        let header = PageHeader::decode(buf)?;
        if header.kind != PageKind::Data && header.kind != PageKind::Index {
            return Err(EngineError::Corrupt(format!(
                "expected tree page, found {:?}",
                header.kind
            )));
        }
        let body = page::body(buf);
        let mut entries = Vec::with_capacity(header.key_count as usize);
        let mut prev_key: Vec<u8> = Vec::new();
        let mut off = 0usize;
        let short = |what: &str| EngineError::Corrupt(format!("truncated node record ({what})"));
        for _ in 0..header.key_count {
            if off + 4 > body.len() {
                return Err(short("record header"));
            }
            let ebc = u16::from_le_bytes(body[off..off + 2].try_into().unwrap()) as usize;
            let suffix_len = u16::from_le_bytes(body[off + 2..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if ebc > prev_key.len() {
                return Err(EngineError::Corrupt("bad elided byte count".to_string()));
            }
            let payload;
            if header.kind == PageKind::Index {
                if off + 8 + suffix_len > body.len() {
                    return Err(short("index record"));
                }
                let child = PageId(u64::from_le_bytes(body[off..off + 8].try_into().unwrap()));
                off += 8;
                payload = Payload::Child(child);
            } else {
                if off + 4 > body.len() {
                    return Err(short("leaf vlen"));
                }
                let vlen_raw = u32::from_le_bytes(body[off..off + 4].try_into().unwrap());
                off += 4;
                let long_ref = vlen_raw & VLEN_LONG_REF != 0;
                let vlen = (vlen_raw & !VLEN_LONG_REF) as usize;
                if off + suffix_len > body.len() {
                    return Err(short("leaf key suffix"));
                }
                // Key first, then the value field.
                let mut key = prev_key[..ebc].to_vec();
                key.extend_from_slice(&body[off..off + suffix_len]);
                off += suffix_len;
                if long_ref {
                    if vlen != LONG_REF_LEN || off + LONG_REF_LEN > body.len() {
                        return Err(short("long ref"));
                    }
                    let total_len = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
                    let head = PageId(u64::from_le_bytes(body[off + 8..off + 16].try_into().unwrap()));
                    off += LONG_REF_LEN;
                    prev_key = key.clone();
                    entries.push(NodeEntry {
                        key,
                        payload: Payload::Long(LongRef { total_len, head }),
                    });
                    continue;
                }
                if off + vlen > body.len() {
                    return Err(short("leaf value"));
                }
                let value = Bytes::copy_from_slice(&body[off..off + vlen]);
                off += vlen;
                prev_key = key.clone();
                entries.push(NodeEntry {
                    key,
                    payload: Payload::Value(value),
                });
                continue;
            }
            if off + suffix_len > body.len() {
                return Err(short("index key suffix"));
            }
            let mut key = prev_key[..ebc].to_vec();
            key.extend_from_slice(&body[off..off + suffix_len]);
            off += suffix_len;
            prev_key = key.clone();
            entries.push(NodeEntry { key, payload });
        }
        Ok(Node {
            kind: header.kind,
            level: header.level,
            right_sibling: header.right_sibling,
            version_stamp: header.version_stamp,
            entries,
        })
    }

    /// Encoded body size with prefix compression.
    pub fn encoded_size(&self) -> usize {
        let mut size = 0usize;
        let mut prev: &[u8] = &[];
        for entry in &self.entries {
            let ebc = common_prefix(prev, &entry.key).min(u16::MAX as usize);
            let suffix = entry.key.len() - ebc;
            size += match &entry.payload {
                Payload::Child(_) => INDEX_RECORD_OVERHEAD + suffix,
                Payload::Value(v) => LEAF_RECORD_OVERHEAD + suffix + v.len(),
                Payload::Long(_) => LEAF_RECORD_OVERHEAD + suffix + LONG_REF_LEN,
            };
            prev = &entry.key;
        }
        size
    }

    pub fn fits(&self, page_size: usize) -> bool {
        self.entries.len() <= u16::MAX as usize
            && self.encoded_size() <= page_size - PAGE_HEADER_LEN
    }

    /// Encode onto a page buffer. The caller must have checked `fits`; the
    /// version stamp is written separately by the pin's `mark_dirty`.
    pub fn encode_into(&self, buf: &mut [u8], page_id: PageId) -> Result<()> {
        if !self.fits(buf.len()) {
            return Err(EngineError::InvariantViolation(format!(
                "node for {page_id} exceeds page capacity"
            )));
        }
        let header = PageHeader {
            kind: self.kind,
            level: self.level,
            key_count: self.entries.len() as u16,
            page_id,
            right_sibling: self.right_sibling,
            version_stamp: self.version_stamp,
        };
        buf.fill(0);
        header.encode(buf);
        let body = page::body_mut(buf);
        let mut off = 0usize;
        let mut prev: Vec<u8> = Vec::new();
        for entry in &self.entries {
            let ebc = common_prefix(&prev, &entry.key).min(u16::MAX as usize);
            let suffix = &entry.key[ebc..];
            body[off..off + 2].copy_from_slice(&(ebc as u16).to_le_bytes());
            body[off + 2..off + 4].copy_from_slice(&(suffix.len() as u16).to_le_bytes());
            off += 4;
            match &entry.payload {
                Payload::Child(child) => {
                    body[off..off + 8].copy_from_slice(&child.0.to_le_bytes());
                    off += 8;
                    body[off..off + suffix.len()].copy_from_slice(suffix);
                    off += suffix.len();
                }
                Payload::Value(value) => {
                    body[off..off + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
                    off += 4;
                    body[off..off + suffix.len()].copy_from_slice(suffix);
                    off += suffix.len();
                    body[off..off + value.len()].copy_from_slice(value);
                    off += value.len();
                }
                Payload::Long(long_ref) => {
                    body[off..off + 4]
                        .copy_from_slice(&(VLEN_LONG_REF | LONG_REF_LEN as u32).to_le_bytes());
                    off += 4;
                    body[off..off + suffix.len()].copy_from_slice(suffix);
                    off += suffix.len();
                    body[off..off + 8].copy_from_slice(&long_ref.total_len.to_le_bytes());
                    body[off + 8..off + 16].copy_from_slice(&long_ref.head.0.to_le_bytes());
                    off += LONG_REF_LEN;
                }
            }
            prev = entry.key.clone();
        }
        page::seal(buf);
        Ok(())
    }

    /// Leaf: exact-match position or insertion point.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Index: the child to descend into for `key`. Relies on the low
    /// sentinel entry, so an index page always routes.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(pos) => pos,
            Err(0) => 0,
            Err(pos) => pos - 1,
        }
    }

    pub fn child_at(&self, pos: usize) -> Result<PageId> {
        match &self.entries[pos].payload {
            Payload::Child(child) => Ok(*child),
            _ => Err(EngineError::Corrupt("index entry without child".to_string())),
        }
    }

    /// Split roughly in half by encoded size, preferring the right node at
    /// the boundary. Returns the separator key and the right node; `self`
    /// keeps the left half. Every key in the right node is >= separator.
    pub fn split(&mut self) -> (Vec<u8>, Node) {
        debug_assert!(self.entries.len() >= 2);
        let total = self.encoded_size();
        let mut acc = 0usize;
        let mut cut = self.entries.len() - 1;
        let mut prev: &[u8] = &[];
        for (i, entry) in self.entries.iter().enumerate() {
            let ebc = common_prefix(prev, &entry.key);
            let record = match &entry.payload {
                Payload::Child(_) => INDEX_RECORD_OVERHEAD + entry.key.len() - ebc,
                Payload::Value(v) => LEAF_RECORD_OVERHEAD + entry.key.len() - ebc + v.len(),
                Payload::Long(_) => LEAF_RECORD_OVERHEAD + entry.key.len() - ebc + LONG_REF_LEN,
            };
            acc += record;
            prev = &entry.key;
            if acc * 2 >= total {
                cut = i + 1;
                break;
            }
        }
        // Never leave either side empty.
        let cut = cut.clamp(1, self.entries.len() - 1);
        let right_entries = self.entries.split_off(cut);
        let mut right = Node {
            kind: self.kind,
            level: self.level,
            right_sibling: self.right_sibling,
            version_stamp: 0,
            entries: right_entries,
        };
        let separator = right.entries[0].key.clone();
        if !right.is_leaf() {
            // The right node keeps the low-sentinel convention: the
            // separator moves up to the parent and the stored copy is
            // emptied.
            right.entries[0].key = Vec::new();
        }
        (separator, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: usize = 1024;

    fn leaf_with(keys: &[&[u8]]) -> Node {
        let mut node = Node::new_leaf();
        for key in keys {
            node.entries.push(NodeEntry {
                key: key.to_vec(),
                payload: Payload::Value(Bytes::from_static(b"v")),
            });
        }
        node
    }

    #[test]
    fn leaf_round_trip_with_prefix_compression() {
        let mut buf = vec![0u8; PS];
        let node = leaf_with(&[b"stress6/0/1", b"stress6/0/2", b"stress6/1/1", b"tin"]);
        node.encode_into(&mut buf, PageId(4)).unwrap();
        let header = PageHeader::decode(&buf).unwrap();
        assert_eq!(header.key_count, 4);
        let decoded = Node::decode(&buf).unwrap();
        assert_eq!(decoded.entries, node.entries);
        // Shared prefixes must actually compress.
        let uncompressed: usize = node
            .entries
            .iter()
            .map(|e| LEAF_RECORD_OVERHEAD + e.key.len() + 1)
            .sum();
        assert!(node.encoded_size() < uncompressed);
    }

    #[test]
    fn index_round_trip() {
        let mut buf = vec![0u8; PS];
        let mut node = Node::new_index(1);
        node.entries.push(NodeEntry {
            key: Vec::new(),
            payload: Payload::Child(PageId(2)),
        });
        node.entries.push(NodeEntry {
            key: b"m".to_vec(),
            payload: Payload::Child(PageId(3)),
        });
        node.right_sibling = PageId(9);
        node.encode_into(&mut buf, PageId(7)).unwrap();
        let decoded = Node::decode(&buf).unwrap();
        assert_eq!(decoded.right_sibling, PageId(9));
        assert_eq!(decoded.entries, node.entries);
    }

    #[test]
    fn long_ref_round_trip() {
        let mut buf = vec![0u8; PS];
        let mut node = Node::new_leaf();
        node.entries.push(NodeEntry {
            key: b"big".to_vec(),
            payload: Payload::Long(LongRef {
                total_len: 100_000,
                head: PageId(55),
            }),
        });
        node.encode_into(&mut buf, PageId(4)).unwrap();
        let decoded = Node::decode(&buf).unwrap();
        assert_eq!(decoded.entries, node.entries);
    }

    #[test]
    fn child_routing_uses_low_sentinel() {
        let mut node = Node::new_index(1);
        node.entries.push(NodeEntry {
            key: Vec::new(),
            payload: Payload::Child(PageId(2)),
        });
        node.entries.push(NodeEntry {
            key: b"h".to_vec(),
            payload: Payload::Child(PageId(3)),
        });
        node.entries.push(NodeEntry {
            key: b"p".to_vec(),
            payload: Payload::Child(PageId(4)),
        });
        assert_eq!(node.child_index(b"a"), 0);
        assert_eq!(node.child_index(b"h"), 1);
        assert_eq!(node.child_index(b"k"), 1);
        assert_eq!(node.child_index(b"z"), 2);
    }

    #[test]
    fn split_keeps_order_and_balance() {
        let keys: Vec<Vec<u8>> = (0..100u32)
            .map(|i| format!("key/{i:04}").into_bytes())
            .collect();
        let mut node = Node::new_leaf();
        for key in &keys {
            node.entries.push(NodeEntry {
                key: key.clone(),
                payload: Payload::Value(Bytes::from_static(b"xyz")),
            });
        }
        let (separator, right) = node.split();
        assert!(!node.entries.is_empty() && !right.entries.is_empty());
        assert_eq!(node.entries.len() + right.entries.len(), 100);
        assert!(node.entries.last().unwrap().key < right.entries[0].key);
        assert_eq!(separator, right.entries[0].key);
        // Roughly balanced by size.
        let l = node.encoded_size();
        let r = right.encoded_size();
        assert!(l * 4 > r && r * 4 > l, "unbalanced split {l} vs {r}");
    }

    #[test]
    fn index_split_blanks_right_sentinel() {
        let mut node = Node::new_index(1);
        node.entries.push(NodeEntry {
            key: Vec::new(),
            payload: Payload::Child(PageId(10)),
        });
        for i in 1..10u32 {
            node.entries.push(NodeEntry {
                key: format!("k{i}").into_bytes(),
                payload: Payload::Child(PageId(10 + i as u64)),
            });
        }
        let (separator, right) = node.split();
        assert!(!separator.is_empty());
        assert!(right.entries[0].key.is_empty());
    }

    #[test]
    fn overflow_detected_by_fits() {
        let mut node = Node::new_leaf();
        node.entries.push(NodeEntry {
            key: b"k".to_vec(),
            payload: Payload::Value(Bytes::from(vec![0u8; PS])),
        });
        assert!(!node.fits(PS));
        let mut buf = vec![0u8; PS];
        assert!(node.encode_into(&mut buf, PageId(4)).is_err());
    }

    #[test]
    fn decode_rejects_bad_ebc() {
        let mut buf = vec![0u8; PS];
        let node = leaf_with(&[b"abc"]);
        node.encode_into(&mut buf, PageId(4)).unwrap();
        // Corrupt the first record's ebc to a nonzero value.
        let body_off = PAGE_HEADER_LEN;
        buf[body_off] = 9;
        page::seal(&mut buf);
        assert!(Node::decode(&buf).is_err());
    }
}
