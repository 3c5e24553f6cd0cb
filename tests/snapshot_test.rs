// Snapshot isolation end to end: committed writes become visible in
// timestamp order, readers hold their snapshot for the whole transaction,
// and values round-trip bit for bit.

mod common;

use cellardb::Key;
use tempfile::tempdir;

#[test]
fn insert_then_fetch_across_snapshots() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    ex.key_mut().clear().append_int(42).unwrap();
    ex.set_value(b"hello");
    ex.store().unwrap();

    // A fresh transaction sees the committed value.
    let mut txn = engine.begin_transaction();
    assert!(ex.fetch_in(&mut txn).unwrap());
    assert_eq!(ex.get_value(), b"hello");
    engine.commit(txn).unwrap();

    // Pin a snapshot before the overwrite.
    let mut old_snapshot = engine.begin_transaction();

    ex.key_mut().clear().append_int(42).unwrap();
    ex.set_value(b"world");
    ex.store().unwrap();

    // New reads see the overwrite.
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.get_value(), b"world");

    // The older snapshot still sees the first value.
    assert!(ex.fetch_in(&mut old_snapshot).unwrap());
    assert_eq!(ex.get_value(), b"hello");
    engine.commit(old_snapshot).unwrap();

    engine.close().unwrap();
}

#[test]
fn disjoint_commits_all_visible() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    for i in 0..100i64 {
        engine
            .transact(|txn| {
                ex.key_mut().clear().append_int(i).unwrap();
                ex.set_value(format!("value-{i}").as_bytes());
                ex.store_in(txn)
            })
            .unwrap();
    }
    // One snapshot after all commits observes every one of them.
    let mut txn = engine.begin_transaction();
    for i in 0..100i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        assert!(ex.fetch_in(&mut txn).unwrap());
        assert_eq!(ex.get_value(), format!("value-{i}").as_bytes());
    }
    engine.commit(txn).unwrap();
    engine.close().unwrap();
}

#[test]
fn round_trip_bytes_exact() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 1024);
    let mut ex = engine.exchange("main", "bytes").unwrap();

    // Values spanning empty, binary, page-sized, and long-record ranges.
    let mut values: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0u8],
        vec![0xFF; 17],
        (0..=255u8).collect(),
    ];
    values.push((0..3000u32).map(|i| (i % 257) as u8).collect());
    values.push(vec![7u8; 20_000]);

    for (i, value) in values.iter().enumerate() {
        ex.key_mut().clear().append_int(i as i64).unwrap();
        ex.set_value(value);
        ex.store().unwrap();
    }
    for (i, value) in values.iter().enumerate() {
        ex.key_mut().clear().append_int(i as i64).unwrap();
        assert!(ex.fetch().unwrap());
        assert_eq!(ex.get_value(), &value[..], "value {i}");
    }
    engine.close().unwrap();
}

#[test]
fn tombstone_reads_as_absent_at_later_snapshots() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    ex.key_mut().clear().append_str("k").unwrap();
    ex.set_value(b"v");
    ex.store().unwrap();

    let mut before_remove = engine.begin_transaction();
    assert!(ex.remove().unwrap());

    // Snapshot from before the remove still sees the value.
    assert!(ex.fetch_in(&mut before_remove).unwrap());
    assert_eq!(ex.get_value(), b"v");
    engine.commit(before_remove).unwrap();

    assert!(!ex.exists().unwrap());
    engine.close().unwrap();
}

#[test]
fn forward_then_reverse_traversal_same_set() {
    let dir = tempdir().unwrap();
    let engine = common::open_soft(dir.path(), 2048);
    let mut ex = engine.exchange("main", "t").unwrap();

    for i in 0..1000i64 {
        ex.key_mut().clear().append_int(i * 3).unwrap();
        ex.set_value(b"");
        ex.store().unwrap();
    }

    let mut forward = Vec::new();
    ex.key_mut().clear();
    while ex.next(true).unwrap() {
        forward.push(ex.key().encoded().to_vec());
    }

    let mut reverse = Vec::new();
    ex.key_mut().clear();
    ex.key_mut().append_after();
    while ex.previous(true).unwrap() {
        reverse.push(ex.key().encoded().to_vec());
    }
    reverse.reverse();

    assert_eq!(forward.len(), 1000);
    assert_eq!(forward, reverse);
    engine.close().unwrap();
}

#[test]
fn clean_reopen_preserves_everything() {
    let dir = tempdir().unwrap();
    {
        let engine = common::open(dir.path(), 4096);
        let mut ex = engine.exchange("main", "t").unwrap();
        for i in 0..500i64 {
            ex.key_mut().clear().append_int(i).unwrap();
            ex.set_value(&i.to_be_bytes());
            ex.store().unwrap();
        }
        engine.close().unwrap();
    }
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();
    for i in 0..500i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        assert!(ex.fetch().unwrap(), "key {i} after reopen");
        assert_eq!(ex.get_value(), &i.to_be_bytes());
    }
    assert_eq!(engine.tree_names("main").unwrap(), vec!["t".to_string()]);
    engine.close().unwrap();
}

#[test]
fn remove_tree_then_recreate_empty() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "doomed").unwrap();
    for i in 0..200i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        ex.set_value(b"x");
        ex.store().unwrap();
    }
    drop(ex);
    assert!(engine.remove_tree("main", "doomed").unwrap());
    assert!(engine.tree_names("main").unwrap().is_empty());

    let mut ex = engine.exchange("main", "doomed").unwrap();
    ex.key_mut().clear().append_int(0).unwrap();
    assert!(!ex.exists().unwrap());
    engine.close().unwrap();
}

#[test]
fn implicit_and_explicit_transactions_interleave() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    let counter_key = |key: &mut Key| {
        key.clear();
        key.append_str("counter").unwrap();
    };

    counter_key(ex.key_mut());
    ex.set_value(&0i64.to_le_bytes());
    ex.store().unwrap();

    for _ in 0..10 {
        engine
            .transact(|txn| {
                counter_key(ex.key_mut());
                ex.fetch_in(txn)?;
                let current = i64::from_le_bytes(ex.get_value().try_into().unwrap());
                ex.set_value(&(current + 1).to_le_bytes());
                ex.store_in(txn)
            })
            .unwrap();
    }

    counter_key(ex.key_mut());
    assert!(ex.fetch().unwrap());
    assert_eq!(i64::from_le_bytes(ex.get_value().try_into().unwrap()), 10);
    engine.close().unwrap();
}

#[test]
fn rollback_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    let mut txn = engine.begin_transaction();
    ex.key_mut().clear().append_str("ghost").unwrap();
    ex.set_value(b"boo");
    ex.store_in(&mut txn).unwrap();
    engine.rollback(txn).unwrap();

    assert!(!ex.exists().unwrap());
    engine.close().unwrap();

    // The rolled-back write must not resurface after a restart either.
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("ghost").unwrap();
    assert!(!ex.exists().unwrap());
    engine.close().unwrap();
}
