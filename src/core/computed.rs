//! The memoized result cell.
//!
//! A `Computed` is created in the `Computing` state, sealed exactly once with
//! its output and frozen dependency set, and from then on only ever makes the
//! `Consistent -> Invalidated` transition. Invalidation never touches the
//! output: a stale cell stays readable for consumers that tolerate staleness,
//! and merely tells the registry that the next access needs a fresh
//! computation.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::core::error::CoreError;
use crate::core::Fingerprint;

/// Type-erased output payload shared by every caller of one computation.
pub type ArcAny = Arc<dyn Any + Send + Sync>;

type InvalidationHook = Box<dyn FnOnce() + Send>;

/// Lifecycle state of a [`Computed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// Being produced right now; never visible through the registry.
    Computing,
    /// Sealed and current.
    Consistent,
    /// Sealed but stale; the next registry access recomputes.
    Invalidated,
}

impl ComputedState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ComputedState::Computing,
            1 => ComputedState::Consistent,
            _ => ComputedState::Invalidated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ComputedState::Computing => 0,
            ComputedState::Consistent => 1,
            ComputedState::Invalidated => 2,
        }
    }
}

/// One immutable memoized result plus its place in the dependency graph.
pub struct Computed {
    fingerprint: Fingerprint,
    version: u64,
    state: AtomicU8,
    output: OnceLock<Result<ArcAny, CoreError>>,
    dependencies: OnceLock<Vec<Fingerprint>>,
    dependents: Mutex<Vec<Weak<Computed>>>,
    hooks: Mutex<Vec<InvalidationHook>>,
}

impl Computed {
    /// A fresh cell in the `Computing` state. Only the registry constructs
    /// these; the cell becomes publicly visible once sealed and installed.
    pub(crate) fn new(fingerprint: Fingerprint, version: u64) -> Self {
        Self {
            fingerprint,
            version,
            state: AtomicU8::new(ComputedState::Computing.as_u8()),
            output: OnceLock::new(),
            dependencies: OnceLock::new(),
            dependents: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Process-monotonic version; a recompute always installs a higher one.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> ComputedState {
        ComputedState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == ComputedState::Consistent
    }

    /// Freeze the cell with a successful output and its captured upstream
    /// edges. A racing invalidation may already have marked the cell stale;
    /// the output still seals, the state stays `Invalidated`.
    pub(crate) fn seal_value(&self, value: ArcAny, dependencies: Vec<Fingerprint>) {
        let _ = self.output.set(Ok(value));
        let _ = self.dependencies.set(dependencies);
        let _ = self.state.compare_exchange(
            ComputedState::Computing.as_u8(),
            ComputedState::Consistent.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Freeze the cell with a failed output. Failed computations are memoized
    /// like values so every caller blocked on the same fingerprint observes
    /// the identical error; invalidation clears them like anything else.
    pub(crate) fn seal_error(&self, error: CoreError, dependencies: Vec<Fingerprint>) {
        let _ = self.output.set(Err(error));
        let _ = self.dependencies.set(dependencies);
        let _ = self.state.compare_exchange(
            ComputedState::Computing.as_u8(),
            ComputedState::Consistent.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The sealed output, if any.
    pub fn output(&self) -> Option<&Result<ArcAny, CoreError>> {
        self.output.get()
    }

    /// Typed view of the sealed output.
    pub fn value<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, CoreError> {
        match self.output.get() {
            Some(Ok(any)) => {
                Arc::clone(any)
                    .downcast::<T>()
                    .map_err(|_| CoreError::OutputTypeMismatch {
                        fingerprint: self.fingerprint.clone(),
                    })
            }
            Some(Err(e)) => Err(e.clone()),
            None => Err(CoreError::ComputeFailed {
                reason: format!("{} read before it was sealed", self.fingerprint),
            }),
        }
    }

    /// Upstream fingerprints this computation read; empty until sealed and
    /// frozen forever after.
    pub fn dependencies(&self) -> &[Fingerprint] {
        self.dependencies.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Register a downstream cell. The edge is weak: it never keeps the
    /// dependent alive.
    pub(crate) fn add_dependent(&self, dependent: Weak<Computed>) {
        if let Ok(mut dependents) = self.dependents.lock() {
            dependents.push(dependent);
        }
    }

    pub(crate) fn dependents_snapshot(&self) -> Vec<Weak<Computed>> {
        match self.dependents.lock() {
            Ok(dependents) => dependents.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Mark the cell stale. Returns `true` on the first transition only, and
    /// fires the one-shot invalidation hooks exactly then.
    pub fn invalidate(&self) -> bool {
        let prior = self
            .state
            .swap(ComputedState::Invalidated.as_u8(), Ordering::AcqRel);
        let fresh = prior != ComputedState::Invalidated.as_u8();
        if fresh {
            self.fire_hooks();
        }
        fresh
    }

    /// One-shot callback on the transition to `Invalidated`. Fires
    /// immediately when the cell is already stale.
    pub fn on_invalidated(&self, hook: impl FnOnce() + Send + 'static) {
        if self.state() == ComputedState::Invalidated {
            hook();
            return;
        }
        if let Ok(mut hooks) = self.hooks.lock() {
            // Re-check under the lock so a concurrent invalidate cannot slip
            // between the state read and the push.
            if self.state() == ComputedState::Invalidated {
                drop(hooks);
                hook();
            } else {
                hooks.push(Box::new(hook));
            }
        }
    }

    fn fire_hooks(&self) {
        let hooks = match self.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            hook();
        }
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("fingerprint", &self.fingerprint)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("dependencies", &self.dependencies().len())
            .finish()
    }
}
