//! Invalidation propagation over the dependency graph.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::computed::Computed;

/// Mark `root` invalidated and walk its dependents breadth-first, marking
/// each. A node is enqueued only on its fresh `Consistent -> Invalidated`
/// transition, so the walk is idempotent and terminates on any graph shape.
/// Dead weak dependents are skipped: they are already-evicted downstream
/// state nobody can observe.
///
/// Returns the number of cells freshly invalidated, including the root.
pub fn invalidate_tree(root: &Arc<Computed>) -> usize {
    let mut queue: VecDeque<Arc<Computed>> = VecDeque::new();
    let mut marked = 0usize;

    if root.invalidate() {
        marked += 1;
        queue.push_back(Arc::clone(root));
    }

    while let Some(cell) = queue.pop_front() {
        for dependent in cell.dependents_snapshot() {
            let Some(dependent) = dependent.upgrade() else {
                continue;
            };
            if dependent.invalidate() {
                marked += 1;
                queue.push_back(dependent);
            }
        }
    }

    if marked > 0 {
        tracing::debug!(root = %root.fingerprint(), marked, "invalidation propagated");
    }
    marked
}
