//! The durable operation log.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::core::Clock;
use crate::oplog::operation::{AgentId, CommandEnvelope, Operation, OperationId};
use crate::oplog::OpLogError;

/// Reads and writes `operations` rows on behalf of one agent.
#[derive(Clone)]
pub struct OperationLog {
    agent: AgentId,
    clock: Arc<dyn Clock>,
}

impl OperationLog {
    pub fn new(agent: AgentId, clock: Arc<dyn Clock>) -> Self {
        Self { agent, clock }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fabricate an uncommitted record for this agent.
    pub fn new_operation(
        &self,
        command: CommandEnvelope,
        items: BTreeMap<String, Value>,
    ) -> Operation {
        Operation {
            id: OperationId::generate(),
            agent_id: self.agent.clone(),
            start_time_ms: self.clock.now_ms(),
            commit_time_ms: 0,
            command,
            items,
        }
    }

    /// Persist a record inside the transaction that carries the business
    /// mutation it accompanies. Stamps the commit time.
    pub fn add(&self, txn: &Transaction<'_>, op: &mut Operation) -> Result<(), OpLogError> {
        op.commit_time_ms = self.clock.now_ms();
        let command = serde_json::to_string(&op.command).map_err(|e| OpLogError::Encode {
            reason: e.to_string(),
        })?;
        let items = serde_json::to_string(&op.items).map_err(|e| OpLogError::Encode {
            reason: e.to_string(),
        })?;
        txn.execute(
            "INSERT INTO operations (id, agent_id, start_time, commit_time, command, items)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                op.id.to_string(),
                op.agent_id.as_str(),
                op.start_time_ms,
                op.commit_time_ms,
                command,
                items,
            ],
        )?;
        Ok(())
    }

    pub fn try_get(
        &self,
        conn: &Connection,
        id: &OperationId,
    ) -> Result<Option<Operation>, OpLogError> {
        conn.query_row(
            "SELECT id, agent_id, start_time, commit_time, command, items
             FROM operations WHERE id = ?1",
            params![id.to_string()],
            decode_row,
        )
        .optional()?
        .transpose()
    }

    /// Operations with `commit_time >= min_commit_ms`, commit time ascending,
    /// capped at `max_count`. Order among rows sharing a commit time is
    /// unspecified.
    pub fn list_newly_committed(
        &self,
        conn: &Connection,
        min_commit_ms: u64,
        max_count: usize,
    ) -> Result<Vec<Operation>, OpLogError> {
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, start_time, commit_time, command, items
             FROM operations WHERE commit_time >= ?1
             ORDER BY commit_time ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![min_commit_ms, max_count as i64], decode_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Delete the oldest `max_count` operations with
    /// `commit_time < min_commit_ms`; returns the count removed. Callers
    /// loop until this returns less than `max_count`.
    pub fn trim(
        &self,
        conn: &Connection,
        min_commit_ms: u64,
        max_count: usize,
    ) -> Result<usize, OpLogError> {
        let removed = conn.execute(
            "DELETE FROM operations WHERE rowid IN (
                 SELECT rowid FROM operations WHERE commit_time < ?1
                 ORDER BY commit_time ASC LIMIT ?2
             )",
            params![min_commit_ms, max_count as i64],
        )?;
        Ok(removed)
    }
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Operation, OpLogError>> {
    let id: String = row.get(0)?;
    let agent: String = row.get(1)?;
    let start_time: u64 = row.get(2)?;
    let commit_time: u64 = row.get(3)?;
    let command: String = row.get(4)?;
    let items: String = row.get(5)?;
    Ok(build_operation(
        id,
        agent,
        start_time,
        commit_time,
        command,
        items,
    ))
}

fn build_operation(
    id: String,
    agent: String,
    start_time_ms: u64,
    commit_time_ms: u64,
    command: String,
    items: String,
) -> Result<Operation, OpLogError> {
    let id = Uuid::from_str(&id).map_err(|e| OpLogError::Decode {
        reason: format!("operation id `{id}`: {e}"),
    })?;
    let agent_id = AgentId::parse(agent).map_err(|e| OpLogError::Decode {
        reason: e.to_string(),
    })?;
    let command: CommandEnvelope =
        serde_json::from_str(&command).map_err(|e| OpLogError::Decode {
            reason: format!("command payload: {e}"),
        })?;
    let items: BTreeMap<String, Value> =
        serde_json::from_str(&items).map_err(|e| OpLogError::Decode {
            reason: format!("items payload: {e}"),
        })?;
    Ok(Operation {
        id: OperationId::from_uuid(id),
        agent_id,
        start_time_ms,
        commit_time_ms,
        command,
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::oplog::store::{init_oplog_schema, open_connection};

    fn setup() -> (tempfile::TempDir, Connection, OperationLog, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_connection(&dir.path().join("store.sqlite")).unwrap();
        init_oplog_schema(&conn).unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let log = OperationLog::new(AgentId::parse("agent-1").unwrap(), clock.clone());
        (dir, conn, log, clock)
    }

    fn command(kind: &str) -> CommandEnvelope {
        CommandEnvelope {
            kind: kind.to_string(),
            body: serde_json::json!({"key": "a"}),
        }
    }

    #[test]
    fn add_stamps_commit_time_and_roundtrips() {
        let (_dir, mut conn, log, clock) = setup();
        let mut op = log.new_operation(command("kv.set"), BTreeMap::new());
        assert_eq!(op.start_time_ms, 1_000);
        assert_eq!(op.commit_time_ms, 0);

        clock.set(2_000);
        let txn = conn.transaction().unwrap();
        log.add(&txn, &mut op).unwrap();
        txn.commit().unwrap();
        assert_eq!(op.commit_time_ms, 2_000);

        let fetched = log.try_get(&conn, &op.id).unwrap().unwrap();
        assert_eq!(fetched, op);
        assert!(log
            .try_get(&conn, &OperationId::generate())
            .unwrap()
            .is_none());
    }

    #[test]
    fn list_newly_committed_orders_and_caps() {
        let (_dir, mut conn, log, clock) = setup();
        for t in [30u64, 10, 20] {
            clock.set(t);
            let mut op = log.new_operation(command("kv.set"), BTreeMap::new());
            let txn = conn.transaction().unwrap();
            log.add(&txn, &mut op).unwrap();
            txn.commit().unwrap();
        }

        let all = log.list_newly_committed(&conn, 0, 10).unwrap();
        let times: Vec<u64> = all.iter().map(|op| op.commit_time_ms).collect();
        assert_eq!(times, vec![10, 20, 30]);

        let since = log.list_newly_committed(&conn, 20, 10).unwrap();
        assert_eq!(since.len(), 2);

        let capped = log.list_newly_committed(&conn, 0, 2).unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].commit_time_ms, 20);
    }

    #[test]
    fn trim_never_touches_rows_at_or_after_the_threshold() {
        let (_dir, mut conn, log, clock) = setup();
        for t in 1..=5u64 {
            clock.set(t * 10);
            let mut op = log.new_operation(command("kv.set"), BTreeMap::new());
            let txn = conn.transaction().unwrap();
            log.add(&txn, &mut op).unwrap();
            txn.commit().unwrap();
        }

        // Threshold 30: rows at 10 and 20 go, batch size 1 drains them one
        // per call until 0.
        assert_eq!(log.trim(&conn, 30, 1).unwrap(), 1);
        assert_eq!(log.trim(&conn, 30, 1).unwrap(), 1);
        assert_eq!(log.trim(&conn, 30, 1).unwrap(), 0);

        let rest = log.list_newly_committed(&conn, 0, 10).unwrap();
        let times: Vec<u64> = rest.iter().map(|op| op.commit_time_ms).collect();
        assert_eq!(times, vec![30, 40, 50]);
    }
}
