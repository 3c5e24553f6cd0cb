// Split/join stress: a large keyspace under one prefix, values grown past
// the long-record threshold and shrunk back, with full-prefix traversal
// checks afterwards.

mod common;

use tempfile::tempdir;

const KEYS: i64 = 10_000;

#[test]
fn grow_shrink_cycle_over_ten_thousand_keys() {
    let dir = tempdir().unwrap();
    let engine = common::open_soft(dir.path(), 4096);
    let mut ex = engine.exchange("main", "stress").unwrap();

    let set_key = |ex: &mut cellardb::Exchange, thread: i64, i: i64| {
        let key = ex.key_mut();
        key.clear();
        key.append_str("stress6").unwrap();
        key.append_int(thread).unwrap();
        key.append_int(i).unwrap();
    };

    // Insert with empty values.
    for i in 0..KEYS {
        set_key(&mut ex, 0, i);
        ex.set_value(b"");
        ex.store().unwrap();
    }

    // Grow every value to 500 bytes, then shrink back to empty.
    let fat = vec![0xABu8; 500];
    for i in 0..KEYS {
        set_key(&mut ex, 0, i);
        ex.set_value(&fat);
        ex.store().unwrap();
    }
    for i in 0..KEYS {
        set_key(&mut ex, 0, i);
        ex.set_value(b"");
        ex.store().unwrap();
    }

    // Every key fetches back empty.
    for i in 0..KEYS {
        set_key(&mut ex, 0, i);
        assert!(ex.fetch().unwrap(), "key {i} missing after shrink");
        assert!(ex.get_value().is_empty(), "key {i} not empty");
    }

    // Forward traversal over the prefix yields exactly KEYS keys in
    // insertion order of i.
    ex.key_mut().clear();
    ex.key_mut().append_str("stress6").unwrap();
    let prefix = ex.key().encoded().to_vec();
    let mut expected = 0i64;
    while ex.next(true).unwrap() {
        if !ex.key().encoded().starts_with(&prefix) {
            break;
        }
        let segments = ex.key().decode().unwrap();
        assert_eq!(segments[1], cellardb::Segment::Int(0));
        assert_eq!(segments[2], cellardb::Segment::Int(expected));
        expected += 1;
    }
    assert_eq!(expected, KEYS);

    engine.close().unwrap();
}

#[test]
fn interleaved_insert_delete_keeps_structure_valid() {
    let dir = tempdir().unwrap();
    let engine = common::open_soft(dir.path(), 2048);
    let mut ex = engine.exchange("main", "churn").unwrap();

    // Two waves of inserts with a delete wave in between, so pages split,
    // underflow, join, and split again.
    for i in 0..3000i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        ex.set_value(&[0x55; 64]);
        ex.store().unwrap();
    }
    for i in 0..3000i64 {
        if i % 3 != 0 {
            ex.key_mut().clear().append_int(i).unwrap();
            ex.remove().unwrap();
        }
    }
    for i in 3000..4000i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        ex.set_value(&[0x66; 64]);
        ex.store().unwrap();
    }

    let mut count = 0i64;
    let mut last: Option<Vec<u8>> = None;
    ex.key_mut().clear();
    while ex.next(true).unwrap() {
        let encoded = ex.key().encoded().to_vec();
        if let Some(prev) = &last {
            assert!(prev < &encoded, "traversal out of order");
        }
        last = Some(encoded);
        count += 1;
    }
    assert_eq!(count, 1000 + 1000);
    engine.close().unwrap();
}

#[test]
fn long_records_survive_restart() {
    let dir = tempdir().unwrap();
    let blob: Vec<u8> = (0..60_000u32).map(|i| (i % 253) as u8).collect();
    {
        let engine = common::open(dir.path(), 1024);
        let mut ex = engine.exchange("main", "blobs").unwrap();
        for i in 0..5i64 {
            ex.key_mut().clear().append_int(i).unwrap();
            ex.set_value(&blob);
            ex.store().unwrap();
        }
        engine.close().unwrap();
    }
    let engine = common::open(dir.path(), 1024);
    let mut ex = engine.exchange("main", "blobs").unwrap();
    for i in 0..5i64 {
        ex.key_mut().clear().append_int(i).unwrap();
        assert!(ex.fetch().unwrap());
        assert_eq!(ex.get_value(), &blob[..], "blob {i}");
    }
    engine.close().unwrap();
}
