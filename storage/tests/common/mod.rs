#![allow(dead_code)]

use pagedb_storage::{DataManager, EngineConfig, TransactionManager, VersionManager};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

/// Routes the library's `log` output to the test writer; `RUST_LOG` filters it.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A transaction manager in a fresh data directory. The directory is removed
/// when the engine is dropped.
pub struct TestEngine {
    pub config: EngineConfig,
    pub tm: Arc<TransactionManager>,
    _dir: TempDir,
}

pub fn setup_engine() -> TestEngine {
    init_logging();
    let dir = tempdir().unwrap();
    let config = EngineConfig::with_data_dir(dir.path());
    let tm = Arc::new(TransactionManager::create(&config.xid_path()).unwrap());
    TestEngine {
        config,
        tm,
        _dir: dir,
    }
}

impl TestEngine {
    /// A version manager over its own record file, subscribed to `tm`.
    pub fn version_manager(&self, name: &str) -> Arc<VersionManager> {
        let dm = DataManager::create(&self.config.table_path(name)).unwrap();
        VersionManager::attach(dm, &self.tm)
    }
}

/// Blocks until `check` holds, failing the test after about two seconds.
pub fn wait_for(what: &str, check: impl Fn() -> bool) {
    let _span = tracing::debug_span!("wait_for", what).entered();
    for _ in 0..1000 {
        if check() {
            tracing::debug!("condition met");
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {}", what);
}
