use std::any::Any;
use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::error::{ComputeError, Failure};
use crate::invalidation::{propagate, InvalidationReason};
use crate::key::InputKey;
use crate::registry::WeakRegistry;

/// Output of a computation: the value, or the failure the body produced.
pub type Output<T> = Result<T, Failure>;

/// Opaque marker distinguishing one node instance from every other.
///
/// Tags are only compared for equality. They start from a random per-process
/// base so tags minted by a restarted process do not collide with the old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(pub u64);

static TAG_BASE: OnceLock<u64> = OnceLock::new();
static TAG_COUNTER: AtomicU64 = AtomicU64::new(0);

impl VersionTag {
    /// Mint a fresh tag.
    pub fn next() -> Self {
        let base = *TAG_BASE.get_or_init(|| ahash::RandomState::new().hash_one(std::process::id()));
        VersionTag(base.wrapping_add(TAG_COUNTER.fetch_add(1, Ordering::Relaxed)))
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:x}", self.0)
    }
}

/// Consistency state of a node.
///
/// Transitions are monotonic: `Computing -> Consistent -> Invalidated`, or
/// `Computing -> Invalidated` directly. `Invalidated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsistencyState {
    /// The body is still running.
    Computing = 0,
    /// The output is current.
    Consistent = 1,
    /// The output is stale; a new node must be computed.
    Invalidated = 2,
}

impl ConsistencyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsistencyState::Computing,
            1 => ConsistencyState::Consistent,
            _ => ConsistencyState::Invalidated,
        }
    }
}

type InvalidationHook = Box<dyn FnOnce(&Arc<NodeCore>) + Send>;
type DropHook = Box<dyn FnOnce() + Send>;

/// Type-erased node of the computed graph.
///
/// A node is immutable once it leaves the `Computing` state, apart from the
/// terminal flip to `Invalidated`. Used edges are strong (a node keeps what it
/// read alive), UsedBy edges are weak.
pub struct NodeCore {
    key: InputKey,
    tag: VersionTag,
    state: AtomicU8,
    output: OnceLock<Arc<dyn Any + Send + Sync>>,
    remote_tag: OnceLock<VersionTag>,
    used: Mutex<Vec<Arc<NodeCore>>>,
    used_by: Mutex<Vec<Weak<NodeCore>>>,
    hooks: Mutex<Option<Vec<InvalidationHook>>>,
    drop_hooks: Mutex<Vec<DropHook>>,
    timer: Mutex<Option<AbortHandle>>,
    invalidated: Notify,
    registry: Option<WeakRegistry>,
}

impl NodeCore {
    /// Create a node in the `Computing` state.
    pub(crate) fn new(key: InputKey, registry: Option<WeakRegistry>) -> Arc<Self> {
        Arc::new(Self {
            key,
            tag: VersionTag::next(),
            state: AtomicU8::new(ConsistencyState::Computing as u8),
            output: OnceLock::new(),
            remote_tag: OnceLock::new(),
            used: Mutex::new(Vec::new()),
            used_by: Mutex::new(Vec::new()),
            hooks: Mutex::new(Some(Vec::new())),
            drop_hooks: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            invalidated: Notify::new(),
            registry,
        })
    }

    /// The input key this node caches.
    pub fn key(&self) -> &InputKey {
        &self.key
    }

    /// The version tag of this node.
    pub fn version_tag(&self) -> VersionTag {
        self.tag
    }

    /// Tag of the remote node this node replicates, if it is remote-backed.
    pub fn remote_tag(&self) -> Option<VersionTag> {
        self.remote_tag.get().copied()
    }

    pub(crate) fn set_remote_tag(&self, tag: VersionTag) {
        let _ = self.remote_tag.set(tag);
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        ConsistencyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns `true` if the node is `Consistent`.
    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Returns `true` if the node reached the terminal `Invalidated` state.
    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }

    pub(crate) fn set_output<T: Send + Sync + 'static>(&self, output: Output<T>) -> bool {
        self.output.set(Arc::new(output)).is_ok()
    }

    pub(crate) fn output_any(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.output.get()
    }

    /// Move `Computing -> Consistent`. Fails if the node was invalidated meanwhile.
    pub(crate) fn try_complete(&self) -> bool {
        self.state
            .compare_exchange(
                ConsistencyState::Computing as u8,
                ConsistencyState::Consistent as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Flip to `Invalidated`. Only the caller that performs the flip gets `true`.
    fn flip(&self) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == ConsistencyState::Invalidated as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConsistencyState::Invalidated as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Invalidate this node and everything that transitively used it.
    ///
    /// Idempotent: returns `true` only for the call that performed the flip.
    pub fn invalidate(self: &Arc<Self>, reason: InvalidationReason) -> bool {
        if !self.mark_invalidated(reason) {
            return false;
        }
        propagate(self);
        true
    }

    /// Flip this node without walking its dependents. Used by the propagator.
    pub(crate) fn mark_invalidated(self: &Arc<Self>, reason: InvalidationReason) -> bool {
        if !self.flip() {
            return false;
        }
        tracing::trace!(key = ?self.key, tag = %self.tag, ?reason, "invalidated");

        self.cancel_auto_invalidation();
        self.detach_from_dependencies();
        if let Some(registry) = self.registry.as_ref().and_then(WeakRegistry::upgrade) {
            registry.pseudo_unregister(self);
            registry.tracer().on_invalidated(&self.key, self.tag, reason);
        }
        let hooks = self.hooks.lock().take().unwrap_or_default();
        for hook in hooks {
            hook(self);
        }
        self.invalidated.notify_waiters();
        true
    }

    /// Drop this node's Used edges and the matching UsedBy edges on the other side.
    fn detach_from_dependencies(self: &Arc<Self>) {
        let dependencies = std::mem::take(&mut *self.used.lock());
        let me = Arc::downgrade(self);
        for dependency in dependencies {
            dependency
                .used_by
                .lock()
                .retain(|w| w.strong_count() > 0 && !w.ptr_eq(&me));
        }
    }

    /// Take the UsedBy edges out of this node. The caller walks them.
    pub(crate) fn take_dependents(&self) -> Vec<Weak<NodeCore>> {
        std::mem::take(&mut *self.used_by.lock())
    }

    /// Record that `self` read `dependency` while computing.
    ///
    /// The dependency's state is re-checked after the edge is in place: if it was
    /// invalidated concurrently, the propagation walk may already have passed, so
    /// `self` invalidates itself.
    pub(crate) fn add_dependency(self: &Arc<Self>, dependency: &Arc<NodeCore>) {
        if Arc::ptr_eq(self, dependency) || self.is_invalidated() {
            return;
        }
        dependency.used_by.lock().push(Arc::downgrade(self));
        self.used.lock().push(dependency.clone());

        if dependency.is_invalidated() {
            self.invalidate(InvalidationReason::DependencyInvalidated);
        }
    }

    /// Snapshot of the nodes this node read.
    pub fn used(&self) -> Vec<Arc<NodeCore>> {
        self.used.lock().clone()
    }

    /// Snapshot of the live nodes that read this node.
    pub fn used_by(&self) -> Vec<Arc<NodeCore>> {
        self.used_by
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Run `hook` once when this node is invalidated. Runs immediately if it already is.
    pub fn on_invalidated(self: &Arc<Self>, hook: impl FnOnce(&Arc<NodeCore>) + Send + 'static) {
        let mut hooks = self.hooks.lock();
        match hooks.as_mut() {
            Some(hooks) => hooks.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook(self);
            }
        }
    }

    /// Run `hook` when the last handle to this node is dropped.
    pub(crate) fn on_dropped(&self, hook: impl FnOnce() + Send + 'static) {
        self.drop_hooks.lock().push(Box::new(hook));
    }

    /// Wait until this node is invalidated.
    pub async fn when_invalidated(&self) {
        loop {
            let notified = self.invalidated.notified();
            if self.is_invalidated() {
                return;
            }
            notified.await;
        }
    }

    /// Invalidate this node after `delay`, unless it is invalidated earlier.
    ///
    /// Requires an ambient tokio runtime; without one the timer is skipped.
    pub fn start_auto_invalidation(self: &Arc<Self>, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = ?self.key, "no tokio runtime, auto-invalidation skipped");
            return;
        };
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(node) = weak.upgrade() {
                node.invalidate(InvalidationReason::AutoInvalidation);
            }
        });
        let previous = self.timer.lock().replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        // The node may have flipped while the timer was being installed.
        if self.is_invalidated() {
            self.cancel_auto_invalidation();
        }
    }

    /// Cancel a pending auto-invalidation timer.
    pub fn cancel_auto_invalidation(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        for hook in std::mem::take(self.drop_hooks.get_mut()) {
            hook();
        }
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

/// Typed handle to a computed node.
///
/// Clone is cheap: the node is shared, and the output is behind an `Arc`.
pub struct Computed<T> {
    core: Arc<NodeCore>,
    output: Arc<Output<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            output: self.output.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Computed<T> {
    /// Wrap a completed node. Returns `None` if the node has no output of type `T`.
    pub(crate) fn from_core(core: Arc<NodeCore>) -> Option<Self> {
        let output = core
            .output_any()?
            .clone()
            .downcast::<Output<T>>()
            .ok()?;
        Some(Self {
            core,
            output,
            _marker: PhantomData,
        })
    }

    /// The captured output.
    pub fn output(&self) -> &Output<T> {
        &self.output
    }

    /// The untyped node.
    pub fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    /// Version tag of this node.
    pub fn version_tag(&self) -> VersionTag {
        self.core.version_tag()
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        self.core.state()
    }

    /// Returns `true` if the node is `Consistent`.
    pub fn is_consistent(&self) -> bool {
        self.core.is_consistent()
    }

    /// Invalidate this node and its dependents. Idempotent.
    pub fn invalidate(&self) -> bool {
        self.core.invalidate(InvalidationReason::Manual)
    }

    /// Wait until this node is invalidated.
    pub async fn when_invalidated(&self) {
        self.core.when_invalidated().await
    }

    /// Returns `true` if both handles point at the same node.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: Clone + Send + Sync + 'static> Computed<T> {
    /// The value, or the captured failure re-raised as [`ComputeError::Failed`].
    pub fn value(&self) -> Result<T, ComputeError> {
        match &*self.output {
            Ok(value) => Ok(value.clone()),
            Err(failure) => Err(ComputeError::Failed(failure.clone())),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("key", self.core.key())
            .field("tag", &self.core.version_tag())
            .field("state", &self.core.state())
            .field("output", &self.output)
            .finish()
    }
}
