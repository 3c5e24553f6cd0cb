// Volume administration: temporary volumes, tree listings, stale-journal
// refusal, and configuration rejection at open.

mod common;

use cellardb::{CommitPolicy, Engine, EngineError};
use tempfile::tempdir;

#[test]
fn temporary_volume_is_ephemeral() {
    let dir = tempdir().unwrap();
    {
        let engine = common::open(dir.path(), 4096);
        engine.create_temporary_volume("scratch").unwrap();
        let mut ex = engine.exchange("scratch", "spill").unwrap();
        for i in 0..500i64 {
            ex.key_mut().clear().append_int(i).unwrap();
            ex.set_value(&[9u8; 100]);
            ex.store().unwrap();
        }
        assert!(ex.fetch().unwrap());
        engine.close().unwrap();
        // The backing file is gone after close.
        assert!(!dir.path().join("scratch.tmp.vol").exists());
    }
    // And nothing about it persists into the next engine.
    let engine = common::open(dir.path(), 4096);
    assert!(engine.exchange("scratch", "spill").is_err());
    engine.close().unwrap();
}

#[test]
fn tree_names_lists_sorted_live_trees() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    for name in ["zebra", "alpha", "middle"] {
        let mut ex = engine.exchange("main", name).unwrap();
        ex.key_mut().clear().append_int(1).unwrap();
        ex.set_value(b"x");
        ex.store().unwrap();
    }
    assert_eq!(
        engine.tree_names("main").unwrap(),
        vec!["alpha", "middle", "zebra"]
    );
    assert!(engine.remove_tree("main", "middle").unwrap());
    assert!(!engine.remove_tree("main", "middle").unwrap());
    assert_eq!(engine.tree_names("main").unwrap(), vec!["alpha", "zebra"]);
    engine.close().unwrap();

    // The listing survives restart through the directory tree.
    let engine = common::open(dir.path(), 4096);
    assert_eq!(engine.tree_names("main").unwrap(), vec!["alpha", "zebra"]);
    engine.close().unwrap();
}

#[test]
fn stale_journal_is_refused() {
    let dir = tempdir().unwrap();
    {
        let engine = common::open(dir.path(), 4096);
        let mut ex = engine.exchange("main", "t").unwrap();
        ex.key_mut().clear().append_int(1).unwrap();
        ex.set_value(b"x");
        ex.store().unwrap();
        engine.close().unwrap();
    }
    // Deleting the journal strands the volume ahead of it.
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with("cellardb_journal")
        {
            std::fs::remove_file(entry.path()).unwrap();
        }
    }
    match Engine::open(common::config(dir.path(), 4096)) {
        Err(EngineError::Corrupt(_)) => {}
        other => panic!("expected corrupt-state refusal, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn bad_configuration_is_rejected_up_front() {
    let dir = tempdir().unwrap();
    let mut config = common::config(dir.path(), 4096);
    config.page_size = 1000;
    assert!(matches!(
        Engine::open(config),
        Err(EngineError::Config(_))
    ));

    let mut config = common::config(dir.path(), 4096);
    config.volumes.clear();
    assert!(matches!(
        Engine::open(config),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn per_transaction_durability_override() {
    let dir = tempdir().unwrap();
    // Engine-wide SOFT, one transaction insists on HARD.
    let mut config = common::config(dir.path(), 4096);
    config.commit_policy = CommitPolicy::Soft;
    common::init_tracing();
    let engine = Engine::open(config).unwrap();
    let mut ex = engine.exchange("main", "t").unwrap();

    let mut txn = engine.begin_transaction();
    txn.set_commit_policy(CommitPolicy::Hard);
    ex.key_mut().clear().append_str("durable").unwrap();
    ex.set_value(b"now");
    ex.store_in(&mut txn).unwrap();
    engine.commit(txn).unwrap();

    // The HARD commit was fsynced before returning, so it survives an
    // immediate kill with no soft-flush window.
    engine.crash();
    let engine = common::open(dir.path(), 4096);
    let mut ex = engine.exchange("main", "t").unwrap();
    ex.key_mut().clear().append_str("durable").unwrap();
    assert!(ex.fetch().unwrap());
    assert_eq!(ex.get_value(), b"now");
    engine.close().unwrap();
}

#[test]
fn reserved_tree_names_are_rejected() {
    let dir = tempdir().unwrap();
    let engine = common::open(dir.path(), 4096);
    assert!(engine.exchange("main", "_directory").is_err());
    engine.close().unwrap();
}
