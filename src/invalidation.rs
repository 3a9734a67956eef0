use std::collections::VecDeque;
use std::sync::Arc;

use crate::node::NodeCore;

/// InvalidationReason is a reason why a computed node is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// Invalidated explicitly by user code.
    Manual,
    /// A node this one read was invalidated.
    DependencyInvalidated,
    /// The auto-invalidation delay of the method elapsed.
    AutoInvalidation,
    /// The peer that computed the value reported that it changed.
    RemoteInvalidation,
    /// The peer that computed the value disconnected.
    PeerDisconnected,
    /// The computation was cancelled before it completed.
    Cancelled,
    /// A newer node was registered for the same key.
    Replaced,
    /// The computation failed with an error that may go away on retry.
    TransientFailure,
}

/// Invalidate every node that transitively used `root`.
///
/// `root` must already be invalidated. The walk is breadth-first over UsedBy
/// edges. Each node's edge list is taken out as it is visited, dead weak handles
/// are skipped, and a dependent is only enqueued when this walk performed its
/// flip, so concurrent walks over overlapping graphs visit each node once.
///
/// Returns the number of dependents flipped by this walk.
pub fn propagate(root: &Arc<NodeCore>) -> usize {
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    let mut flipped = 0;

    while let Some(node) = queue.pop_front() {
        for dependent in node.take_dependents() {
            let Some(dependent) = dependent.upgrade() else {
                continue;
            };
            if dependent.mark_invalidated(InvalidationReason::DependencyInvalidated) {
                flipped += 1;
                queue.push_back(dependent);
            }
        }
    }

    if flipped > 0 {
        tracing::debug!(root = ?root.key(), flipped, "propagated invalidation");
    }
    flipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{InputKey, MethodId, ReceiverId};
    use crate::node::ConsistencyState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(name: &'static str) -> Arc<NodeCore> {
        let node = NodeCore::new(InputKey::new(MethodId(name), ReceiverId::NONE, ()), None);
        node.set_output::<()>(Ok(()));
        assert!(node.try_complete());
        node
    }

    #[test]
    fn test_chain_propagation() {
        // a <- b <- c
        let a = node("a");
        let b = node("b");
        let c = node("c");
        b.add_dependency(&a);
        c.add_dependency(&b);

        assert!(a.invalidate(InvalidationReason::Manual));
        assert_eq!(b.state(), ConsistencyState::Invalidated);
        assert_eq!(c.state(), ConsistencyState::Invalidated);
        assert!(a.used_by().is_empty());
        assert!(c.used().is_empty());
    }

    #[test]
    fn test_diamond_flips_each_node_once() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let a = node("a");
        let b = node("b");
        let c = node("c");
        let d = node("d");
        b.add_dependency(&a);
        c.add_dependency(&a);
        d.add_dependency(&b);
        d.add_dependency(&c);

        let hooks = Arc::new(AtomicUsize::new(0));
        let h = hooks.clone();
        d.on_invalidated(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        a.mark_invalidated(InvalidationReason::Manual);
        assert_eq!(propagate(&a), 3);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_dependents_are_skipped() {
        let a = node("a");
        {
            let b = node("b");
            b.add_dependency(&a);
        }
        assert!(a.invalidate(InvalidationReason::Manual));
        assert!(a.used_by().is_empty());
    }

    #[test]
    fn test_concurrent_invalidation_flips_once() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        b.add_dependency(&a);
        c.add_dependency(&b);

        let flips = Arc::new(AtomicUsize::new(0));
        let f = flips.clone();
        c.on_invalidated(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    a.invalidate(InvalidationReason::Manual);
                    b.invalidate(InvalidationReason::Manual);
                });
            }
        });

        assert!(c.is_invalidated());
        assert_eq!(flips.load(Ordering::SeqCst), 1);
    }
}
