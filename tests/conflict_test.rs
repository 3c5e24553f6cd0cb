// Optimistic conflict handling: concurrent transactions reading a shared
// key race to commit; the loser rolls back and retries at a fresh
// snapshot.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

use cellardb::{Engine, EngineError};
use tempfile::tempdir;

fn read_counter(engine: &Engine, txn: &mut cellardb::Transaction) -> i64 {
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("counter").unwrap();
    if ex.fetch_in(txn).unwrap() {
        i64::from_le_bytes(ex.get_value().try_into().unwrap())
    } else {
        0
    }
}

fn write_counter(engine: &Engine, txn: &mut cellardb::Transaction, v: i64) {
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("counter").unwrap();
    ex.set_value(&v.to_le_bytes());
    ex.store_in(txn).unwrap();
}

#[test]
fn racing_writers_retry_and_both_land() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);

    // Seed the shared counter.
    {
        let mut ex = engine.exchange("main", "t").unwrap();
        ex.key_mut().clear().append_str("counter").unwrap();
        ex.set_value(&0i64.to_le_bytes());
        ex.store().unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let total_attempts = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for label in [b"A".to_vec(), b"B".to_vec()] {
        let engine = engine.clone();
        let barrier = Arc::clone(&barrier);
        let total_attempts = Arc::clone(&total_attempts);
        handles.push(std::thread::spawn(move || {
            let mut attempt = 0u32;
            engine
                .transact(|txn| {
                    attempt += 1;
                    total_attempts.fetch_add(1, Ordering::SeqCst);
                    let current = read_counter(&engine, txn);
                    write_counter(&engine, txn, current + 1);
                    let mut ex = engine.exchange("main", "t").unwrap();
                    ex.key_mut().clear().append_int(5).unwrap();
                    ex.set_value(&label);
                    ex.store_in(txn)?;
                    // Line both threads up on their first attempt so the
                    // conflict actually happens.
                    if attempt == 1 {
                        barrier.wait();
                    }
                    Ok(())
                })
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // One of the two lost its first attempt and went around again.
    assert!(total_attempts.load(Ordering::SeqCst) >= 3);

    // The counter was incremented exactly twice, and key 5 holds one of
    // the two labels.
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("counter").unwrap();
    assert!(ex.fetch().unwrap());
    assert_eq!(i64::from_le_bytes(ex.get_value().try_into().unwrap()), 2);
    ex.key_mut().clear().append_int(5).unwrap();
    assert!(ex.fetch().unwrap());
    assert!(ex.get_value() == b"A" || ex.get_value() == b"B");

    engine.close().unwrap();
}

#[test]
fn blind_writes_do_not_conflict() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for i in 0..2i64 {
        let engine = engine.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let mut txn = engine.begin_transaction();
            let mut ex = engine.exchange("main", "t").unwrap();
            ex.key_mut().clear().append_int(i).unwrap();
            ex.set_value(b"mine");
            ex.store_in(&mut txn).unwrap();
            barrier.wait();
            // No reads anywhere: neither commit may fail.
            engine.commit(txn).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    engine.close().unwrap();
}

#[test]
fn conflict_surfaces_as_rollback_without_helper() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();

    ex.key_mut().clear().append_str("shared").unwrap();
    ex.set_value(b"0");
    ex.store().unwrap();

    // Transaction A reads; B commits an overwrite; A's commit must fail
    // with the retryable conflict error.
    let mut a = engine.begin_transaction();
    ex.key_mut().clear().append_str("shared").unwrap();
    assert!(ex.fetch_in(&mut a).unwrap());
    ex.set_value(b"from-a");
    ex.store_in(&mut a).unwrap();

    ex.set_value(b"from-b");
    ex.store().unwrap();

    match engine.commit(a) {
        Err(EngineError::Rollback { .. }) => {}
        other => panic!("expected rollback, got {other:?}"),
    }
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.get_value(), b"from-b");
    engine.close().unwrap();
}

#[test]
fn retry_cap_surfaces_transaction_failed() {
    let dir = tempdir().unwrap();
    let mut config = common::config(dir.path(), 4096);
    config.txn_retry_cap = 3;
    common::init_tracing();
    let engine = Engine::open(config).unwrap();
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("hot").unwrap();
    ex.set_value(b"0");
    ex.store().unwrap();

    // Every attempt reads the hot key, then a sidecar commit bumps it
    // before the attempt can commit.
    let result: cellardb::Result<()> = engine.transact(|txn| {
        let mut ex = engine.exchange("main", "t").unwrap();
        ex.key_mut().clear().append_str("hot").unwrap();
        ex.fetch_in(txn)?;
        ex.set_value(b"attempt");
        ex.store_in(txn)?;
        // Sidecar commit that always wins.
        let mut side = engine.exchange("main", "t").unwrap();
        side.key_mut().clear().append_str("hot").unwrap();
        side.set_value(b"sidecar");
        side.store()?;
        Ok(())
    });
    match result {
        Err(EngineError::TransactionFailed(attempts)) => assert_eq!(attempts, 3),
        other => panic!("expected TransactionFailed, got {other:?}"),
    }
    engine.close().unwrap();
}
