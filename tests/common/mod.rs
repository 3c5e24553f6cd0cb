#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use cellardb::{CommitPolicy, Engine, EngineConfig};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn config(dir: &Path, page_size: usize) -> EngineConfig {
    EngineConfig {
        page_size,
        ..EngineConfig::in_dir(dir)
    }
}

pub fn open(dir: &Path, page_size: usize) -> Engine {
    init_tracing();
    Engine::open(config(dir, page_size)).expect("engine open")
}

/// SOFT-commit engine for bulk tests: one fsync per flush interval
/// instead of one per commit.
pub fn open_soft(dir: &Path, page_size: usize) -> Engine {
    init_tracing();
    let cfg = EngineConfig {
        commit_policy: CommitPolicy::Soft,
        ..config(dir, page_size)
    };
    Engine::open(cfg).expect("engine open")
}
