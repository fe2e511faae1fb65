//! Background trimming of aged operation-log rows.
//!
//! Rows only need to outlive every watcher's poll window, so anything older
//! than the configured minimum age is deletable. Work happens one bounded
//! batch per wake to keep the delete transactions short; a full batch
//! triggers an immediate re-check since more rows are likely waiting.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use rand::Rng;
use rusqlite::Connection;

use crate::core::Clock;
use crate::oplog::OperationLog;

pub struct TrimmerParams {
    pub check_interval: Duration,
    pub min_age: Duration,
    pub batch: usize,
}

/// Handle to the trimmer thread. Dropping it stops the thread.
pub struct OperationTrimmer {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl OperationTrimmer {
    pub fn spawn(
        conn: Connection,
        log: OperationLog,
        params: TrimmerParams,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("ripple-trimmer".to_string())
            .spawn(move || {
                let mut delay = jittered(params.check_interval);
                loop {
                    match shutdown_rx.recv_timeout(delay) {
                        Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => break,
                        Err(channel::RecvTimeoutError::Timeout) => {}
                    }
                    let cutoff_ms = clock.now_ms().saturating_sub(params.min_age.as_millis() as u64);
                    delay = match log.trim(&conn, cutoff_ms, params.batch) {
                        Ok(deleted) if deleted == params.batch => {
                            tracing::debug!(deleted, "trimmed a full batch, re-checking");
                            Duration::from_millis(1)
                        }
                        Ok(deleted) => {
                            if deleted > 0 {
                                tracing::debug!(deleted, "trimmed aged operations");
                            }
                            jittered(params.check_interval)
                        }
                        Err(e) => {
                            tracing::error!("operation trim failed: {e}");
                            short_backoff()
                        }
                    };
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for OperationTrimmer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// Spread wakeups so co-located processes do not trim in lockstep.
fn jittered(interval: Duration) -> Duration {
    let base = interval.as_millis() as u64;
    if base == 0 {
        return interval;
    }
    let jitter = rand::rng().random_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

fn short_backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(200..=1_000))
}
