//! SQLite connection handling for the backing store.
//!
//! Every process sharing one store file opens its own connections; WAL
//! journal mode plus a busy timeout make multi-connection access safe.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::oplog::OpLogError;

const BUSY_TIMEOUT_MS: u64 = 5_000;

pub fn open_connection(path: &Path) -> Result<Connection, OpLogError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

pub fn init_oplog_schema(conn: &Connection) -> Result<(), OpLogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS operations (
             id          TEXT PRIMARY KEY,
             agent_id    TEXT NOT NULL,
             start_time  INTEGER NOT NULL,
             commit_time INTEGER NOT NULL,
             command     TEXT NOT NULL,
             items       TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_operations_commit_time
             ON operations(commit_time);",
    )?;
    Ok(())
}
