//! Background watcher that applies remotely committed operations.
//!
//! The watcher tails the operation log and re-runs the Invalidate phase for
//! each row committed by another process, so this process's cached reads go
//! stale the same way they would have if the command had run locally. It
//! wakes on change notifications and also polls on a timer, since
//! notification delivery is best effort.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use rusqlite::Connection;

use crate::command::CommandRouter;
use crate::core::{Clock, Registry};
use crate::oplog::{NotifySubscription, OperationId, OperationLog};

/// Recently committed local operation ids. The runner records each commit
/// here so the watcher can skip rows this process already invalidated.
pub struct CompletedOps {
    inner: Mutex<CompletedInner>,
    cap: usize,
}

struct CompletedInner {
    order: VecDeque<OperationId>,
    set: HashSet<OperationId>,
}

impl CompletedOps {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CompletedInner {
                order: VecDeque::new(),
                set: HashSet::new(),
            }),
            cap,
        })
    }

    pub fn record(&self, id: OperationId) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.set.insert(id) {
            return;
        }
        inner.order.push_back(id);
        while inner.order.len() > self.cap {
            if let Some(old) = inner.order.pop_front() {
                inner.set.remove(&old);
            }
        }
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.set.contains(id),
            Err(_) => false,
        }
    }
}

pub struct WatcherParams {
    pub poll_interval: Duration,
    pub list_batch: usize,
}

/// Handle to the watcher thread. Dropping it stops the thread.
pub struct OperationWatcher {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl OperationWatcher {
    /// Spawn the tail loop. `conn` is the watcher's own connection; WAL mode
    /// lets it read while the runner writes. Only operations committed after
    /// spawn time are applied.
    pub fn spawn(
        registry: Registry,
        router: Arc<CommandRouter>,
        log: OperationLog,
        conn: Connection,
        subscription: NotifySubscription,
        completed: Arc<CompletedOps>,
        params: WatcherParams,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        // Capture the baseline before the thread starts: the thread may not
        // be scheduled until after commits the caller makes post-spawn.
        let min_commit_ms = clock.now_ms();
        let handle = std::thread::Builder::new()
            .name("ripple-watcher".to_string())
            .spawn(move || {
                let mut tail = Tail {
                    registry,
                    router,
                    log,
                    conn,
                    completed,
                    list_batch: params.list_batch,
                    min_commit_ms,
                    seen_at_edge: HashSet::new(),
                };
                loop {
                    crossbeam::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(subscription.receiver()) -> msg => {
                            if msg.is_err() {
                                // Transport gone; fall back to pure polling.
                                tail.poll();
                                std::thread::sleep(params.poll_interval);
                                continue;
                            }
                            tail.poll();
                        }
                        default(params.poll_interval) => tail.poll(),
                    }
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for OperationWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Tail {
    registry: Registry,
    router: Arc<CommandRouter>,
    log: OperationLog,
    conn: Connection,
    completed: Arc<CompletedOps>,
    list_batch: usize,
    min_commit_ms: u64,
    // Ids already applied at exactly `min_commit_ms`; the >= list query
    // re-returns rows sharing the edge timestamp.
    seen_at_edge: HashSet<OperationId>,
}

impl Tail {
    fn poll(&mut self) {
        loop {
            // Rows already applied at the edge timestamp sort first in the
            // >= query, so widen the page by their count; a tie spanning a
            // whole page would otherwise hide everything behind it.
            let limit = self.list_batch + self.seen_at_edge.len();
            let batch = match self
                .log
                .list_newly_committed(&self.conn, self.min_commit_ms, limit)
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!("operation list failed: {e}");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            let full = batch.len() == limit;
            let mut fresh = 0usize;
            for op in batch {
                if self.apply(op) {
                    fresh += 1;
                }
            }
            // No fresh rows means the query can only repeat itself.
            if !full || fresh == 0 {
                return;
            }
        }
    }

    /// Returns false when the row was already applied at the edge timestamp.
    fn apply(&mut self, op: crate::oplog::Operation) -> bool {
        if op.commit_time_ms > self.min_commit_ms {
            self.min_commit_ms = op.commit_time_ms;
            self.seen_at_edge.clear();
        } else if self.seen_at_edge.contains(&op.id) {
            return false;
        }
        self.seen_at_edge.insert(op.id);

        if self.completed.contains(&op.id) {
            return true;
        }
        if op.agent_id == *self.log.agent() {
            return true;
        }
        tracing::debug!(kind = %op.command.kind, id = %op.id, "applying remote operation");
        if let Err(e) = self.router.reinvalidate(&self.registry, &op) {
            // Stale cache beats a dead watcher; keep tailing.
            tracing::error!(kind = %op.command.kind, id = %op.id, "remote invalidate failed: {e}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn completed_ops_caps_and_forgets_oldest() {
        let completed = CompletedOps::new(2);
        let a = OperationId::from_uuid(Uuid::new_v4());
        let b = OperationId::from_uuid(Uuid::new_v4());
        let c = OperationId::from_uuid(Uuid::new_v4());
        completed.record(a);
        completed.record(b);
        assert!(completed.contains(&a));
        completed.record(c);
        assert!(!completed.contains(&a));
        assert!(completed.contains(&b));
        assert!(completed.contains(&c));
    }

    #[test]
    fn completed_ops_record_is_idempotent() {
        let completed = CompletedOps::new(2);
        let a = OperationId::from_uuid(Uuid::new_v4());
        let b = OperationId::from_uuid(Uuid::new_v4());
        completed.record(a);
        completed.record(a);
        completed.record(b);
        assert!(completed.contains(&a));
        assert!(completed.contains(&b));
    }
}
