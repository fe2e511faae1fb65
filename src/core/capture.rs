//! Thread-local dependency capture stack.
//!
//! While a computation for fingerprint F runs, a frame for F sits on the
//! calling thread's stack. Every registry read of another fingerprint G
//! records the edge `F depends on G` into the top frame and registers F as a
//! weak dependent of G. Reads outside any frame record nothing. Frames nest:
//! a sub-computation captures into its own frame only.

use std::cell::RefCell;
use std::sync::Arc;

use crate::core::computed::Computed;
use crate::core::Fingerprint;

struct FrameState {
    computing: Arc<Computed>,
    dependencies: Vec<Fingerprint>,
}

thread_local! {
    static STACK: RefCell<Vec<FrameState>> = const { RefCell::new(Vec::new()) };
}

/// RAII frame guard: pushed while a computation runs, popped on
/// [`CaptureFrame::finish`] or on drop (cancellation, panic).
pub(crate) struct CaptureFrame {
    finished: bool,
}

impl CaptureFrame {
    /// Consume the frame, returning the dependency set captured so far.
    pub(crate) fn finish(mut self) -> Vec<Fingerprint> {
        self.finished = true;
        STACK.with(|stack| {
            stack
                .borrow_mut()
                .pop()
                .map(|frame| frame.dependencies)
                .unwrap_or_default()
        })
    }
}

impl Drop for CaptureFrame {
    fn drop(&mut self) {
        if !self.finished {
            STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }
}

/// Begin capturing for `computing` on this thread.
pub(crate) fn push(computing: Arc<Computed>) -> CaptureFrame {
    STACK.with(|stack| {
        stack.borrow_mut().push(FrameState {
            computing,
            dependencies: Vec::new(),
        });
    });
    CaptureFrame { finished: false }
}

/// Is `fingerprint` already computing somewhere on this thread's stack?
/// Detects reentrant/self-referential compute chains before they deadlock on
/// their own per-fingerprint lock.
pub(crate) fn is_computing(fingerprint: &Fingerprint) -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|frame| frame.computing.fingerprint() == fingerprint)
    })
}

/// Record that the computation on top of the stack (if any) read `upstream`.
pub(crate) fn record_read(upstream: &Arc<Computed>) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let Some(frame) = stack.last_mut() else {
            return;
        };
        let fingerprint = upstream.fingerprint();
        if frame.computing.fingerprint() == fingerprint {
            return;
        }
        if !frame.dependencies.contains(fingerprint) {
            frame.dependencies.push(fingerprint.clone());
            upstream.add_dependent(Arc::downgrade(&frame.computing));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArgsDigest, MethodId, ServiceId};

    fn cell(tag: &str) -> Arc<Computed> {
        let fingerprint = Fingerprint::new(
            ServiceId::parse("test").unwrap(),
            MethodId::parse("peek").unwrap(),
            ArgsDigest::of(tag).unwrap(),
        );
        Arc::new(Computed::new(fingerprint, 1))
    }

    #[test]
    fn reads_inside_a_frame_record_edges_both_ways() {
        let downstream = cell("down");
        let upstream = cell("up");

        let frame = push(Arc::clone(&downstream));
        record_read(&upstream);
        record_read(&upstream); // deduped
        let deps = frame.finish();

        assert_eq!(deps, vec![upstream.fingerprint().clone()]);
        let dependents = upstream.dependents_snapshot();
        assert_eq!(dependents.len(), 1);
        let back = dependents[0].upgrade().unwrap();
        assert_eq!(back.fingerprint(), downstream.fingerprint());
    }

    #[test]
    fn reads_outside_any_frame_record_nothing() {
        let upstream = cell("up");
        record_read(&upstream);
        assert!(upstream.dependents_snapshot().is_empty());
    }

    #[test]
    fn nested_frames_capture_independently() {
        let outer = cell("outer");
        let inner = cell("inner");
        let leaf = cell("leaf");

        let outer_frame = push(Arc::clone(&outer));
        let inner_frame = push(Arc::clone(&inner));
        record_read(&leaf);
        let inner_deps = inner_frame.finish();
        record_read(&inner);
        let outer_deps = outer_frame.finish();

        assert_eq!(inner_deps, vec![leaf.fingerprint().clone()]);
        assert_eq!(outer_deps, vec![inner.fingerprint().clone()]);
    }

    #[test]
    fn cycle_check_sees_the_whole_stack() {
        let outer = cell("outer");
        let inner = cell("inner");

        let _outer_frame = push(Arc::clone(&outer));
        let _inner_frame = push(Arc::clone(&inner));
        assert!(is_computing(outer.fingerprint()));
        assert!(is_computing(inner.fingerprint()));
        assert!(!is_computing(cell("other").fingerprint()));
    }

    #[test]
    fn dropping_an_unfinished_frame_pops_it() {
        let computing = cell("a");
        {
            let _frame = push(Arc::clone(&computing));
            assert!(is_computing(computing.fingerprint()));
        }
        assert!(!is_computing(computing.fingerprint()));
    }
}
