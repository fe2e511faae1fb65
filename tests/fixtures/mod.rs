//! Shared setup for integration tests: an on-disk store plus one fully
//! wired node (registry, kv service, command runner, router).
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;

use ripple::command::{CommandRouter, CommandRunner};
use ripple::core::{Clock, Registry, SystemClock};
use ripple::kv::{KvRemove, KvRemoveHandler, KvSet, KvSetHandler, KvStore};
use ripple::oplog::{
    init_oplog_schema, open_connection, AgentId, ChangeNotifier, CompletedOps, InProcessHub,
    NotifyPolicy, OperationLog,
};

pub const CHANNEL: &str = "ripple_ops";

pub fn temp_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.sqlite3");
    (dir, path)
}

pub fn open_db(path: &Path) -> Connection {
    let conn = open_connection(path).expect("open connection");
    init_oplog_schema(&conn).expect("oplog schema");
    ripple::kv::init_kv_schema(&conn).expect("kv schema");
    conn
}

/// One process's worth of wiring against a shared store file.
pub struct Node {
    pub registry: Registry,
    pub store: Arc<KvStore>,
    pub runner: CommandRunner,
    pub router: Arc<CommandRouter>,
    pub log: OperationLog,
    pub completed: Arc<CompletedOps>,
}

pub fn node(path: &Path, hub: &InProcessHub) -> Node {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Registry::new();
    let store = KvStore::new(open_db(path), Duration::from_secs(60)).expect("kv store");

    let log = OperationLog::new(AgentId::generate(), Arc::clone(&clock));
    let notifier = ChangeNotifier::new(
        Arc::new(hub.clone()),
        CHANNEL,
        log.agent().clone(),
        NotifyPolicy::default(),
    );
    let completed = CompletedOps::new(1024);
    let runner = CommandRunner::new(
        registry.clone(),
        open_db(path),
        log.clone(),
        notifier,
        Arc::clone(&completed),
    );

    let mut router = CommandRouter::new();
    router.register::<KvSet, KvSetHandler>(Arc::new(KvSetHandler::new(Arc::clone(&store))));
    router.register::<KvRemove, KvRemoveHandler>(Arc::new(KvRemoveHandler::new(Arc::clone(
        &store,
    ))));

    Node {
        registry,
        store,
        runner,
        router: Arc::new(router),
        log,
        completed,
    }
}

/// Poll until `check` passes or the deadline lapses.
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
