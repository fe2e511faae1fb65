//! Explicit compute-operation definitions.
//!
//! A [`ComputeDef`] wraps a plain, side-effect-free closure with the
//! registry's memoization: calling it fingerprints the arguments, consults
//! the registry, and only runs the closure on a miss. In the `Invalidate`
//! phase of a command the same call turns into an invalidation of the cached
//! entry instead of a computation, which is how mutating commands declare the
//! reads they stale by literally calling them.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::computed::{ArcAny, Computed};
use crate::core::error::CoreError;
use crate::core::registry::Registry;
use crate::core::{CancelToken, Fingerprint, MethodId, Phase, ServiceId};

/// Ambient context for one compute or invalidate call.
pub struct ComputeCtx<'a> {
    registry: &'a Registry,
    phase: Phase,
    cancel: CancelToken,
}

impl<'a> ComputeCtx<'a> {
    /// A plain read context: `Execute` phase, no cancellation.
    pub fn read(registry: &'a Registry) -> Self {
        Self {
            registry,
            phase: Phase::Execute,
            cancel: CancelToken::new(),
        }
    }

    pub fn new(registry: &'a Registry, phase: Phase, cancel: CancelToken) -> Self {
        Self {
            registry,
            phase,
            cancel,
        }
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

type ComputeFn<A, T> = dyn Fn(&ComputeCtx<'_>, &A) -> Result<T, CoreError> + Send + Sync;

/// A named, memoized compute operation over argument type `A` producing `T`.
pub struct ComputeDef<A, T> {
    service: ServiceId,
    method: MethodId,
    keep_alive: Duration,
    f: Arc<ComputeFn<A, T>>,
}

impl<A, T> Clone for ComputeDef<A, T> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            method: self.method.clone(),
            keep_alive: self.keep_alive,
            f: Arc::clone(&self.f),
        }
    }
}

impl<A, T> ComputeDef<A, T>
where
    A: Serialize,
    T: Send + Sync + 'static,
{
    pub fn new(
        service: &ServiceId,
        method: &str,
        f: impl Fn(&ComputeCtx<'_>, &A) -> Result<T, CoreError> + Send + Sync + 'static,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            service: service.clone(),
            method: MethodId::parse(method)?,
            keep_alive: Duration::ZERO,
            f: Arc::new(f),
        })
    }

    /// Minimum duration a cached result resists eviction after its last
    /// access. Default zero: the entry lives only while someone holds it.
    pub fn keep_alive(mut self, window: Duration) -> Self {
        self.keep_alive = window;
        self
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn fingerprint(&self, args: &A) -> Result<Fingerprint, CoreError> {
        Fingerprint::compute(&self.service, &self.method, args)
    }

    /// The memoized call. In the `Invalidate` phase this invalidates the
    /// cached entry and yields [`CoreError::InvalidationPass`], which callers
    /// in that phase discard.
    pub fn call(&self, cx: &ComputeCtx<'_>, args: &A) -> Result<Arc<T>, CoreError> {
        self.call_computed(cx, args)?.value::<T>()
    }

    /// Like [`ComputeDef::call`] but returns the whole cell; used where the
    /// version or invalidation hook is needed alongside the value.
    pub fn call_computed(&self, cx: &ComputeCtx<'_>, args: &A) -> Result<Arc<Computed>, CoreError> {
        let fingerprint = self.fingerprint(args)?;
        if cx.phase().is_invalidate() {
            cx.registry().invalidate(&fingerprint);
            return Err(CoreError::InvalidationPass);
        }
        let keep_alive_ms = u64::try_from(self.keep_alive.as_millis()).unwrap_or(u64::MAX);
        cx.registry()
            .get_or_compute(&fingerprint, keep_alive_ms, cx.cancel_token(), || {
                let value = (self.f)(cx, args)?;
                Ok(Arc::new(value) as ArcAny)
            })
    }

    /// Explicitly invalidate the cached entry for `args`.
    pub fn invalidate(&self, registry: &Registry, args: &A) -> Result<bool, CoreError> {
        Ok(registry.invalidate(&self.fingerprint(args)?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counted_def(runs: Arc<AtomicUsize>) -> ComputeDef<String, String> {
        let service = ServiceId::parse("echo").unwrap();
        ComputeDef::new(&service, "upper", move |_cx, args: &String| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(args.to_uppercase())
        })
        .unwrap()
    }

    #[test]
    fn call_memoizes_per_argument_value() {
        let registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let def = counted_def(Arc::clone(&runs)).keep_alive(Duration::from_secs(60));
        let cx = ComputeCtx::read(&registry);

        assert_eq!(*def.call(&cx, &"a".to_string()).unwrap(), "A");
        assert_eq!(*def.call(&cx, &"a".to_string()).unwrap(), "A");
        assert_eq!(*def.call(&cx, &"b".to_string()).unwrap(), "B");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_phase_calls_invalidate_instead_of_computing() {
        let registry = Registry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let def = counted_def(Arc::clone(&runs)).keep_alive(Duration::from_secs(60));

        let read = ComputeCtx::read(&registry);
        let cell = def.call_computed(&read, &"a".to_string()).unwrap();
        assert!(cell.is_consistent());

        let invalidating = ComputeCtx::new(&registry, Phase::Invalidate, CancelToken::new());
        let err = def.call(&invalidating, &"a".to_string()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidationPass));
        assert!(!cell.is_consistent());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The next plain read recomputes.
        assert_eq!(*def.call(&read, &"a".to_string()).unwrap(), "A");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_defs_capture_dependency_edges() {
        let registry = Registry::new();
        let service = ServiceId::parse("num").unwrap();
        let base: ComputeDef<u32, u32> = ComputeDef::new(&service, "base", |_cx, n| Ok(n * 10))
            .unwrap()
            .keep_alive(Duration::from_secs(60));
        let double = {
            let base = base.clone();
            ComputeDef::new(&service, "double", move |cx, n: &u32| {
                Ok(*base.call(cx, n)? * 2)
            })
            .unwrap()
            .keep_alive(Duration::from_secs(60))
        };

        let cx = ComputeCtx::read(&registry);
        assert_eq!(*double.call(&cx, &3).unwrap(), 60);

        let root = registry.peek(&double.fingerprint(&3).unwrap()).unwrap();
        assert_eq!(root.dependencies(), &[base.fingerprint(&3).unwrap()]);

        base.invalidate(&registry, &3).unwrap();
        assert!(!root.is_consistent());
    }
}
