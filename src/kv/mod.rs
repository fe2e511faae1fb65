//! Key-value service demonstrating the full read and write paths.
//!
//! Reads go through computed definitions so they are memoized and
//! dependency-tracked; writes are two-phase commands whose Invalidate pass
//! re-invokes exactly the reads they staled. `count` is only invalidated
//! when a write changes key membership, not on value-only updates.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandContext, CommandError, CommandHandler};
use crate::core::{ComputeCtx, ComputeDef, CoreError, ServiceId};

pub fn init_kv_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         )",
    )
}

/// Memoized read surface over the kv table. Holds its own read connection;
/// WAL mode lets it read while a command transaction writes.
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
    get: ComputeDef<String, Option<String>>,
    count: ComputeDef<(), u64>,
}

impl KvStore {
    pub fn new(conn: Connection, keep_alive: Duration) -> Result<Arc<Self>, CoreError> {
        init_kv_schema(&conn).map_err(|e| CoreError::ComputeFailed {
            reason: e.to_string(),
        })?;
        let conn = Arc::new(Mutex::new(conn));
        let service = ServiceId::parse("kv")?;

        let get = {
            let conn = Arc::clone(&conn);
            ComputeDef::new(&service, "get", move |_cx, key: &String| {
                let conn = conn.lock().map_err(|_| CoreError::LockPoisoned)?;
                conn.query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| CoreError::ComputeFailed {
                    reason: e.to_string(),
                })
            })?
            .keep_alive(keep_alive)
        };

        let count = {
            let conn = Arc::clone(&conn);
            ComputeDef::new(&service, "count", move |_cx, _args: &()| {
                let conn = conn.lock().map_err(|_| CoreError::LockPoisoned)?;
                conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| CoreError::ComputeFailed {
                        reason: e.to_string(),
                    })
            })?
            .keep_alive(keep_alive)
        };

        Ok(Arc::new(Self { conn, get, count }))
    }

    pub fn get(&self, cx: &ComputeCtx<'_>, key: &str) -> Result<Arc<Option<String>>, CoreError> {
        self.get.call(cx, &key.to_string())
    }

    pub fn count(&self, cx: &ComputeCtx<'_>) -> Result<Arc<u64>, CoreError> {
        self.count.call(cx, &())
    }

    pub fn get_def(&self) -> &ComputeDef<String, Option<String>> {
        &self.get
    }

    pub fn count_def(&self) -> &ComputeDef<(), u64> {
        &self.count
    }

    /// Direct unmemoized read, bypassing the cache.
    pub fn raw_get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let conn = self.conn.lock().map_err(|_| CoreError::LockPoisoned)?;
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| CoreError::ComputeFailed {
            reason: e.to_string(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvSet {
    pub key: String,
    pub value: String,
}

impl Command for KvSet {
    const KIND: &'static str = "kv.set";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvRemove {
    pub key: String,
}

impl Command for KvRemove {
    const KIND: &'static str = "kv.remove";
}

pub struct KvSetHandler {
    store: Arc<KvStore>,
}

impl KvSetHandler {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

impl CommandHandler<KvSet> for KvSetHandler {
    fn handle(&self, cx: &mut CommandContext<'_>, command: &KvSet) -> Result<(), CommandError> {
        if cx.phase().is_invalidate() {
            let compute = cx.compute();
            let _ = self.store.get.call(&compute, &command.key);
            if !cx.item_bool("existed") {
                let _ = self.store.count.call(&compute, &());
            }
            return Ok(());
        }

        let txn = cx.txn()?;
        let existed: bool = txn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key = ?1",
            params![command.key],
            |row| row.get::<_, i64>(0),
        )? > 0;
        txn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![command.key, command.value],
        )?;
        cx.set_item("existed", existed)?;
        Ok(())
    }
}

pub struct KvRemoveHandler {
    store: Arc<KvStore>,
}

impl KvRemoveHandler {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }
}

impl CommandHandler<KvRemove> for KvRemoveHandler {
    fn handle(&self, cx: &mut CommandContext<'_>, command: &KvRemove) -> Result<(), CommandError> {
        if cx.phase().is_invalidate() {
            let compute = cx.compute();
            let _ = self.store.get.call(&compute, &command.key);
            if cx.item_bool("removed") {
                let _ = self.store.count.call(&compute, &());
            }
            return Ok(());
        }

        let txn = cx.txn()?;
        let removed = txn.execute("DELETE FROM kv WHERE key = ?1", params![command.key])? > 0;
        cx.set_item("removed", removed)?;
        Ok(())
    }
}
