//! End-to-end command flow: execute, commit, invalidate, re-read.

mod fixtures;

use ripple::core::ComputeCtx;
use ripple::kv::{KvRemove, KvRemoveHandler, KvSet, KvSetHandler};
use ripple::oplog::InProcessHub;

use std::sync::Arc;

#[test]
fn set_then_read_reflects_the_write() {
    let (_dir, path) = fixtures::temp_db();
    let hub = InProcessHub::new(8);
    let node = fixtures::node(&path, &hub);
    let handler = KvSetHandler::new(Arc::clone(&node.store));

    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(*node.store.get(&cx, "greeting").unwrap(), None);

    node.runner
        .run(
            &handler,
            &KvSet {
                key: "greeting".into(),
                value: "hello".into(),
            },
        )
        .unwrap();

    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(
        *node.store.get(&cx, "greeting").unwrap(),
        Some("hello".to_string())
    );

    node.runner
        .run(
            &handler,
            &KvSet {
                key: "greeting".into(),
                value: "hej".into(),
            },
        )
        .unwrap();

    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(
        *node.store.get(&cx, "greeting").unwrap(),
        Some("hej".to_string())
    );
}

#[test]
fn value_only_update_leaves_count_cached() {
    let (_dir, path) = fixtures::temp_db();
    let hub = InProcessHub::new(8);
    let node = fixtures::node(&path, &hub);
    let handler = KvSetHandler::new(Arc::clone(&node.store));

    node.runner
        .run(
            &handler,
            &KvSet {
                key: "a".into(),
                value: "1".into(),
            },
        )
        .unwrap();

    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(*node.store.count(&cx).unwrap(), 1);
    let count_fp = node.store.count_def().fingerprint(&()).unwrap();
    let cell_before = node.registry.peek(&count_fp).unwrap();
    assert!(cell_before.is_consistent());

    // Same key again: membership unchanged, count untouched.
    node.runner
        .run(
            &handler,
            &KvSet {
                key: "a".into(),
                value: "2".into(),
            },
        )
        .unwrap();
    let cell_after = node.registry.peek(&count_fp).unwrap();
    assert!(cell_after.is_consistent());
    assert_eq!(cell_before.version(), cell_after.version());

    // New key: count must go stale and recompute.
    node.runner
        .run(
            &handler,
            &KvSet {
                key: "b".into(),
                value: "3".into(),
            },
        )
        .unwrap();
    assert!(!cell_after.is_consistent());
    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(*node.store.count(&cx).unwrap(), 2);
}

#[test]
fn remove_of_missing_key_does_not_stale_count() {
    let (_dir, path) = fixtures::temp_db();
    let hub = InProcessHub::new(8);
    let node = fixtures::node(&path, &hub);
    let set = KvSetHandler::new(Arc::clone(&node.store));
    let remove = KvRemoveHandler::new(Arc::clone(&node.store));

    node.runner
        .run(
            &set,
            &KvSet {
                key: "a".into(),
                value: "1".into(),
            },
        )
        .unwrap();

    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(*node.store.count(&cx).unwrap(), 1);
    let count_fp = node.store.count_def().fingerprint(&()).unwrap();
    let cell = node.registry.peek(&count_fp).unwrap();

    node.runner
        .run(&remove, &KvRemove { key: "ghost".into() })
        .unwrap();
    assert!(cell.is_consistent());

    node.runner
        .run(&remove, &KvRemove { key: "a".into() })
        .unwrap();
    assert!(!cell.is_consistent());
    let cx = ComputeCtx::read(&node.registry);
    assert_eq!(*node.store.count(&cx).unwrap(), 0);
}

#[test]
fn committed_operation_is_durable_and_recorded() {
    let (_dir, path) = fixtures::temp_db();
    let hub = InProcessHub::new(8);
    let node = fixtures::node(&path, &hub);
    let handler = KvSetHandler::new(Arc::clone(&node.store));

    let op = node
        .runner
        .run(
            &handler,
            &KvSet {
                key: "k".into(),
                value: "v".into(),
            },
        )
        .unwrap();
    assert!(op.commit_time_ms > 0);
    assert!(node.completed.contains(&op.id));

    let conn = fixtures::open_db(&path);
    let stored = node.log.try_get(&conn, &op.id).unwrap().unwrap();
    assert_eq!(stored.command.kind, "kv.set");
    assert_eq!(stored.items.get("existed"), Some(&serde_json::json!(false)));
}
