//! Process-wide computed-value registry.
//!
//! Maps fingerprints to weakly-held [`Computed`] cells. A slot may also pin
//! its cell with a strong reference for the duration of a keep-alive window
//! anchored at the last access; a sweep evicts slots that are invalidated,
//! dead, or past their window with no outside holder. Concurrent
//! (re)computation of the same fingerprint is serialized by a per-fingerprint
//! flight lock so the compute function runs exactly once per miss, while
//! unrelated fingerprints compute in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};

use crate::core::capture;
use crate::core::computed::{ArcAny, Computed, ComputedState};
use crate::core::error::CoreError;
use crate::core::propagate;
use crate::core::{CancelToken, Clock, Fingerprint, SystemClock};

struct Slot {
    cell: Weak<Computed>,
    /// Strong hold for the keep-alive window; `None` when the window is zero.
    pin: Option<Arc<Computed>>,
    keep_alive_ms: u64,
    last_access_ms: u64,
}

struct RegistryInner {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    flights: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
}

/// Shared handle to one process-local registry. Explicitly constructed and
/// injected; every test builds its own.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted: usize,
    pub retained: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
                clock,
                next_version: AtomicU64::new(1),
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Look up or produce the cell for `fingerprint`.
    ///
    /// A consistent hit returns the cached cell without running `compute`.
    /// On miss or invalidation, exactly one caller is admitted through the
    /// per-fingerprint flight lock; everyone else blocks and then re-reads
    /// the freshly installed cell. The compute function runs inside a capture
    /// frame so its own registry reads become dependency edges.
    pub fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        keep_alive_ms: u64,
        cancel: &CancelToken,
        compute: impl FnOnce() -> Result<ArcAny, CoreError>,
    ) -> Result<Arc<Computed>, CoreError> {
        if capture::is_computing(fingerprint) {
            return Err(CoreError::DependencyCycle {
                fingerprint: fingerprint.clone(),
            });
        }
        cancel.check()?;

        if let Some(hit) = self.lookup_consistent(fingerprint)? {
            capture::record_read(&hit);
            return Ok(hit);
        }

        let flight = self.flight_lock(fingerprint)?;
        let _admitted = flight.lock().map_err(|_| CoreError::LockPoisoned)?;

        // Another holder may have recomputed while we waited.
        if let Some(hit) = self.lookup_consistent(fingerprint)? {
            capture::record_read(&hit);
            return Ok(hit);
        }
        cancel.check()?;

        let cell = Arc::new(Computed::new(fingerprint.clone(), self.bump_version()));
        let frame = capture::push(Arc::clone(&cell));
        let result = compute();
        let dependencies = frame.finish();

        match result {
            Ok(value) => cell.seal_value(value, dependencies),
            // Failures of the compute fn itself are memoized like values.
            Err(error @ CoreError::ComputeFailed { .. }) => cell.seal_error(error, dependencies),
            // Cancellation and contract errors install nothing; the flight
            // lock is released on return and waiters compute normally.
            Err(error) => return Err(error),
        }

        self.install(&cell, keep_alive_ms)?;
        capture::record_read(&cell);
        tracing::trace!(
            fingerprint = %fingerprint,
            version = cell.version(),
            deps = cell.dependencies().len(),
            "computed installed"
        );
        Ok(cell)
    }

    /// The cell currently installed for `fingerprint`, in whatever state,
    /// without touching its keep-alive or recording an edge.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<Arc<Computed>> {
        let slots = self.inner.slots.lock().ok()?;
        slots.get(fingerprint).and_then(|slot| slot.cell.upgrade())
    }

    /// Mark the entry for `fingerprint` invalidated (without removing it) and
    /// propagate to its dependents. Returns `true` when a live entry was
    /// freshly invalidated.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let cell = match self.peek(fingerprint) {
            Some(cell) => cell,
            None => return false,
        };
        // Hooks run outside the slot-map lock; they may re-enter the
        // registry.
        propagate::invalidate_tree(&cell) > 0
    }

    /// One eviction pass. Safe to run concurrently with lookups: a cell
    /// already handed to a caller stays valid, only its slot goes away.
    pub fn sweep(&self) -> SweepStats {
        let now = self.inner.clock.now_ms();
        let mut stats = SweepStats::default();

        if let Ok(mut slots) = self.inner.slots.lock() {
            slots.retain(|_, slot| {
                let Some(cell) = slot.cell.upgrade() else {
                    stats.evicted += 1;
                    return false;
                };
                if cell.state() == ComputedState::Invalidated {
                    stats.evicted += 1;
                    return false;
                }
                let lapsed = now.saturating_sub(slot.last_access_ms) >= slot.keep_alive_ms;
                if !lapsed {
                    stats.retained += 1;
                    return true;
                }
                slot.pin = None;
                // `cell` is our own temporary; any other strong reference is
                // an outside holder the sweep must not strand.
                if Arc::strong_count(&cell) > 1 {
                    stats.retained += 1;
                    return true;
                }
                stats.evicted += 1;
                false
            });
        }

        if let Ok(mut flights) = self.inner.flights.lock() {
            flights.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        stats
    }

    /// Number of live slots; test observability.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the timer-driven background sweep. The returned handle stops
    /// the thread when dropped.
    pub fn start_sweeper(&self, interval: Duration) -> std::io::Result<Sweeper> {
        let registry = self.clone();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("ripple-sweeper".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let stats = registry.sweep();
                        if stats.evicted > 0 {
                            tracing::debug!(
                                evicted = stats.evicted,
                                retained = stats.retained,
                                "sweep pass"
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Sweeper {
            shutdown: shutdown_tx,
            handle: Some(handle),
        })
    }

    fn lookup_consistent(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Arc<Computed>>, CoreError> {
        let mut slots = self.inner.slots.lock().map_err(|_| CoreError::LockPoisoned)?;
        let Some(slot) = slots.get_mut(fingerprint) else {
            return Ok(None);
        };
        let Some(cell) = slot.cell.upgrade() else {
            return Ok(None);
        };
        if !cell.is_consistent() {
            return Ok(None);
        }
        slot.last_access_ms = self.inner.clock.now_ms();
        if slot.keep_alive_ms > 0 {
            slot.pin = Some(Arc::clone(&cell));
        }
        Ok(Some(cell))
    }

    fn install(&self, cell: &Arc<Computed>, keep_alive_ms: u64) -> Result<(), CoreError> {
        let mut slots = self.inner.slots.lock().map_err(|_| CoreError::LockPoisoned)?;
        let pin = if keep_alive_ms > 0 {
            Some(Arc::clone(cell))
        } else {
            None
        };
        slots.insert(
            cell.fingerprint().clone(),
            Slot {
                cell: Arc::downgrade(cell),
                pin,
                keep_alive_ms,
                last_access_ms: self.inner.clock.now_ms(),
            },
        );
        Ok(())
    }

    fn flight_lock(&self, fingerprint: &Fingerprint) -> Result<Arc<Mutex<()>>, CoreError> {
        let mut flights = self
            .inner
            .flights
            .lock()
            .map_err(|_| CoreError::LockPoisoned)?;
        Ok(Arc::clone(
            flights
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    fn bump_version(&self) -> u64 {
        self.inner.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the background sweep thread; dropping it stops the sweep.
pub struct Sweeper {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
