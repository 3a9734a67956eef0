//! Observability hooks for the computed graph.
//!
//! The runtime reports node accesses, registrations and invalidations to a
//! [`Tracer`]. Hooks are best-effort: the engine never depends on them, and the
//! default [`NoopTracer`] discards everything.
//!
//! # Example
//!
//! ```
//! use computed_flow::{ComputedRuntime, EventCollector};
//! use std::sync::Arc;
//!
//! let collector = Arc::new(EventCollector::new());
//! let runtime = ComputedRuntime::builder().tracer(collector.clone()).build();
//! # drop(runtime);
//! assert!(collector.is_empty());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::invalidation::InvalidationReason;
use crate::key::InputKey;
use crate::node::VersionTag;

/// Unique identifier for a compute execution span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

/// Compute execution result classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The body produced a value.
    Computed,
    /// The body failed; the failure was captured into the node.
    Failed,
    /// The computation was cancelled and left no node behind.
    Cancelled,
    /// The computed node was invalidated before it could be published.
    InvalidatedWhileComputing,
}

/// Tracer trait for observing the computed graph.
///
/// All methods except [`Tracer::new_span_id`] have empty default implementations,
/// so implementations only override the events they care about.
///
/// Implementations must be `Send + Sync`: hooks run on whatever thread touched
/// the graph.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called at the start of each computation.
    fn new_span_id(&self) -> SpanId;

    /// Called on every registry lookup.
    #[inline]
    fn on_access(&self, _key: &InputKey, _hit: bool) {}

    /// Called when a computation starts executing a body.
    #[inline]
    fn on_compute_start(&self, _span_id: SpanId, _key: &InputKey) {}

    /// Called when a computation ends.
    #[inline]
    fn on_compute_end(&self, _span_id: SpanId, _key: &InputKey, _result: ExecutionResult) {}

    /// Called when a node is published to the registry.
    #[inline]
    fn on_register(&self, _key: &InputKey, _tag: VersionTag) {}

    /// Called when a node is removed from the registry, or hidden from lookups.
    #[inline]
    fn on_unregister(&self, _key: &InputKey, _tag: VersionTag) {}

    /// Called once per node when it becomes invalidated.
    #[inline]
    fn on_invalidated(&self, _key: &InputKey, _tag: VersionTag, _reason: InvalidationReason) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`ComputedRuntime`](crate::ComputedRuntime).
pub struct NoopTracer;

/// Global span counter for tracers without their own numbering.
static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_span_id() -> SpanId {
    SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }
}

/// Forwards one in every `every` access, register and unregister event to the inner tracer.
///
/// Compute and invalidation events are rare compared to lookups and are always forwarded.
pub struct SampledTracer<T> {
    inner: T,
    every: u64,
    counter: AtomicU64,
}

impl<T: Tracer> SampledTracer<T> {
    /// Sample one in `every` high-volume events. `every` of 0 or 1 forwards everything.
    pub fn new(inner: T, every: u64) -> Self {
        Self {
            inner,
            every: every.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// The wrapped tracer.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn sample(&self) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }
}

impl<T: Tracer> Tracer for SampledTracer<T> {
    fn new_span_id(&self) -> SpanId {
        self.inner.new_span_id()
    }

    fn on_access(&self, key: &InputKey, hit: bool) {
        if self.sample() {
            self.inner.on_access(key, hit);
        }
    }

    fn on_compute_start(&self, span_id: SpanId, key: &InputKey) {
        self.inner.on_compute_start(span_id, key);
    }

    fn on_compute_end(&self, span_id: SpanId, key: &InputKey, result: ExecutionResult) {
        self.inner.on_compute_end(span_id, key, result);
    }

    fn on_register(&self, key: &InputKey, tag: VersionTag) {
        if self.sample() {
            self.inner.on_register(key, tag);
        }
    }

    fn on_unregister(&self, key: &InputKey, tag: VersionTag) {
        if self.sample() {
            self.inner.on_unregister(key, tag);
        }
    }

    fn on_invalidated(&self, key: &InputKey, tag: VersionTag, reason: InvalidationReason) {
        self.inner.on_invalidated(key, tag, reason);
    }
}

impl<T: Tracer> Tracer for Arc<T> {
    fn new_span_id(&self) -> SpanId {
        (**self).new_span_id()
    }

    fn on_access(&self, key: &InputKey, hit: bool) {
        (**self).on_access(key, hit);
    }

    fn on_compute_start(&self, span_id: SpanId, key: &InputKey) {
        (**self).on_compute_start(span_id, key);
    }

    fn on_compute_end(&self, span_id: SpanId, key: &InputKey, result: ExecutionResult) {
        (**self).on_compute_end(span_id, key, result);
    }

    fn on_register(&self, key: &InputKey, tag: VersionTag) {
        (**self).on_register(key, tag);
    }

    fn on_unregister(&self, key: &InputKey, tag: VersionTag) {
        (**self).on_unregister(key, tag);
    }

    fn on_invalidated(&self, key: &InputKey, tag: VersionTag, reason: InvalidationReason) {
        (**self).on_invalidated(key, tag, reason);
    }
}

/// A recorded tracer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// Registry lookup.
    Access {
        /// Debug form of the key.
        key: String,
        /// Whether a consistent node was found.
        hit: bool,
    },
    /// Body execution started.
    ComputeStart {
        /// Span of the execution.
        span_id: SpanId,
        /// Debug form of the key.
        key: String,
    },
    /// Body execution ended.
    ComputeEnd {
        /// Span of the execution.
        span_id: SpanId,
        /// Debug form of the key.
        key: String,
        /// Outcome.
        result: ExecutionResult,
    },
    /// Node published.
    Register {
        /// Debug form of the key.
        key: String,
        /// Tag of the published node.
        tag: VersionTag,
    },
    /// Node removed or hidden.
    Unregister {
        /// Debug form of the key.
        key: String,
        /// Tag of the removed node.
        tag: VersionTag,
    },
    /// Node invalidated.
    Invalidated {
        /// Debug form of the key.
        key: String,
        /// Tag of the invalidated node.
        tag: VersionTag,
        /// Why it was invalidated.
        reason: InvalidationReason,
    },
}

/// Tracer that accumulates events for later inspection and assertion.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<TraceEvent>>,
}

impl EventCollector {
    /// Create a new empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the collected events.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if no events have been collected.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Count the events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&TraceEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for EventCollector {
    fn new_span_id(&self) -> SpanId {
        next_span_id()
    }

    fn on_access(&self, key: &InputKey, hit: bool) {
        self.push(TraceEvent::Access {
            key: key.debug_repr(),
            hit,
        });
    }

    fn on_compute_start(&self, span_id: SpanId, key: &InputKey) {
        self.push(TraceEvent::ComputeStart {
            span_id,
            key: key.debug_repr(),
        });
    }

    fn on_compute_end(&self, span_id: SpanId, key: &InputKey, result: ExecutionResult) {
        self.push(TraceEvent::ComputeEnd {
            span_id,
            key: key.debug_repr(),
            result,
        });
    }

    fn on_register(&self, key: &InputKey, tag: VersionTag) {
        self.push(TraceEvent::Register {
            key: key.debug_repr(),
            tag,
        });
    }

    fn on_unregister(&self, key: &InputKey, tag: VersionTag) {
        self.push(TraceEvent::Unregister {
            key: key.debug_repr(),
            tag,
        });
    }

    fn on_invalidated(&self, key: &InputKey, tag: VersionTag, reason: InvalidationReason) {
        self.push(TraceEvent::Invalidated {
            key: key.debug_repr(),
            tag,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{MethodId, ReceiverId};
    use std::sync::atomic::AtomicUsize;

    struct CountingTracer {
        access_count: AtomicUsize,
    }

    impl Tracer for CountingTracer {
        fn new_span_id(&self) -> SpanId {
            SpanId(1)
        }

        fn on_access(&self, _key: &InputKey, _hit: bool) {
            self.access_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn key() -> InputKey {
        InputKey::new(MethodId("answer"), ReceiverId::NONE, 42u32)
    }

    #[test]
    fn test_noop_tracer_span_id() {
        let tracer = NoopTracer;
        let id1 = tracer.new_span_id();
        let id2 = tracer.new_span_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_sampled_tracer_forwards_one_in_n() {
        let tracer = SampledTracer::new(
            CountingTracer {
                access_count: AtomicUsize::new(0),
            },
            4,
        );
        for _ in 0..16 {
            tracer.on_access(&key(), true);
        }
        assert_eq!(tracer.inner().access_count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_collector_records_events() {
        let collector = EventCollector::new();
        collector.on_access(&key(), false);
        collector.on_invalidated(&key(), VersionTag(7), InvalidationReason::Manual);

        let events = collector.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TraceEvent::Access { hit: false, .. }));
        assert!(matches!(
            events[1],
            TraceEvent::Invalidated {
                reason: InvalidationReason::Manual,
                ..
            }
        ));
        assert!(collector.is_empty());
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<EventCollector>>();
    }
}
