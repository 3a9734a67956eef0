//! Compute runtime and context.
//!
//! Every call goes through [`ComputedRuntime::get_or_compute`]: a registry lookup,
//! and on a miss a single-flight computation whose nested calls are recorded
//! as dependencies of the node being computed.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use papaya::{HashMap, Operation};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, Failure, RpcError};
use crate::invalidation::InvalidationReason;
use crate::key::InputKey;
use crate::method::{ComputeMethod, MethodDef};
use crate::node::{Computed, NodeCore};
use crate::registry::ComputedRegistry;
use crate::tracer::{ExecutionResult, NoopTracer, SpanId, Tracer};

/// What the callers waiting on a computation receive.
///
/// The node is weak so a finished flight never outlives the last handle to it.
#[derive(Clone)]
struct Landed {
    node: Weak<NodeCore>,
    /// Set when the computation failed transiently; every waiter gets the same error.
    error: Option<RpcError>,
}

type Flight = OnceCell<Landed>;

struct RuntimeShared {
    registry: ComputedRegistry,
    flights: HashMap<InputKey, Arc<Flight>, ahash::RandomState>,
    tracer: Arc<dyn Tracer>,
}

/// The compute runtime owns the registry and runs computations.
///
/// This is cheap to clone - all data is behind `Arc`.
///
/// # Example
///
/// ```
/// use computed_flow::{async_trait, ComputeContext, ComputeError, ComputeMethod, ComputedRuntime, MethodDef};
///
/// #[derive(Clone, Debug, Hash, PartialEq, Eq)]
/// struct Square(i64);
///
/// #[async_trait]
/// impl ComputeMethod for Square {
///     type Output = i64;
///     const DEFINITION: MethodDef = MethodDef::new("square");
///
///     async fn compute(&self, _ctx: &ComputeContext) -> Result<i64, ComputeError> {
///         Ok(self.0 * self.0)
///     }
/// }
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let runtime = ComputedRuntime::new();
/// let first = runtime.call(Square(7)).await?;
/// let second = runtime.call(Square(7)).await?;
/// assert_eq!(first.value()?, 49);
/// assert!(first.ptr_eq(&second));
/// # Ok::<(), ComputeError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct ComputedRuntime {
    shared: Arc<RuntimeShared>,
}

impl Default for ComputedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<ComputedRuntime>();
    assert_sync::<ComputedRuntime>();
    assert_send::<ComputeContext>();
    assert_sync::<ComputeContext>();
}

/// One frame of the chain of keys currently being computed.
struct CallFrame {
    key: InputKey,
    parent: Option<Arc<CallFrame>>,
}

impl CallFrame {
    fn contains(frame: &Option<Arc<CallFrame>>, key: &InputKey) -> bool {
        let mut current = frame.as_deref();
        while let Some(frame) = current {
            if &frame.key == key {
                return true;
            }
            current = frame.parent.as_deref();
        }
        false
    }

    fn path(frame: &Option<Arc<CallFrame>>, key: &InputKey) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = frame.as_deref();
        while let Some(frame) = current {
            path.push(frame.key.debug_repr());
            current = frame.parent.as_deref();
        }
        path.reverse();
        path.push(key.debug_repr());
        path
    }
}

/// Context passed to a compute body.
///
/// Calls made through the context are recorded as dependencies of the node
/// being computed, and share its cancellation token.
#[derive(Clone)]
pub struct ComputeContext {
    runtime: ComputedRuntime,
    current: Option<Arc<NodeCore>>,
    chain: Option<Arc<CallFrame>>,
    cancel: CancellationToken,
}

impl ComputeContext {
    /// The runtime this context belongs to.
    pub fn runtime(&self) -> &ComputedRuntime {
        &self.runtime
    }

    /// The node being computed, if any.
    pub fn current_node(&self) -> Option<&Arc<NodeCore>> {
        self.current.as_ref()
    }

    /// The cancellation token of the computation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` if the computation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`ComputeError::Cancelled`] if the computation has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), ComputeError> {
        if self.cancel.is_cancelled() {
            Err(ComputeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Call a method as a dependency of the current computation.
    pub async fn call<M: ComputeMethod>(
        &self,
        method: M,
    ) -> Result<Computed<M::Output>, ComputeError> {
        let key = method.input_key();
        let core = self
            .runtime
            .get_or_compute::<M::Output, _, _>(self, key, &M::DEFINITION, move |ctx, _node| {
                let method = method.clone();
                async move { method.compute(&ctx).await }
            })
            .await?;
        typed(core)
    }

    /// Call a method and return its value.
    pub async fn value<M: ComputeMethod>(&self, method: M) -> Result<M::Output, ComputeError> {
        self.call(method).await?.value()
    }
}

pub(crate) fn typed<T: Send + Sync + 'static>(
    core: Arc<NodeCore>,
) -> Result<Computed<T>, ComputeError> {
    let key = core.key().debug_repr();
    Computed::from_core(core).ok_or_else(|| {
        ComputeError::Failed(Failure::new(
            "type",
            format!(
                "node {} does not hold a {}",
                key,
                std::any::type_name::<T>()
            ),
        ))
    })
}

/// Invalidates the node if the computation is dropped before it finishes.
struct ComputingGuard<'a> {
    node: Arc<NodeCore>,
    span_id: SpanId,
    tracer: &'a Arc<dyn Tracer>,
    armed: bool,
}

impl ComputingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.node.invalidate(InvalidationReason::Cancelled);
            self.tracer
                .on_compute_end(self.span_id, self.node.key(), ExecutionResult::Cancelled);
            tracing::debug!(key = ?self.node.key(), "computation cancelled");
        }
    }
}

impl ComputedRuntime {
    /// Create a new runtime with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the runtime.
    ///
    /// # Example
    ///
    /// ```
    /// use computed_flow::ComputedRuntime;
    /// use std::time::Duration;
    ///
    /// let runtime = ComputedRuntime::builder()
    ///     .shard_count(64)
    ///     .grace_period(Duration::from_secs(10))
    ///     .build();
    /// assert_eq!(runtime.registry().shard_count(), 64);
    /// ```
    pub fn builder() -> ComputedRuntimeBuilder {
        ComputedRuntimeBuilder::new()
    }

    /// The registry of computed nodes.
    pub fn registry(&self) -> &ComputedRegistry {
        &self.shared.registry
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.shared.tracer
    }

    /// A context with no current node, for top-level calls.
    pub fn root_context(&self, cancel: CancellationToken) -> ComputeContext {
        ComputeContext {
            runtime: self.clone(),
            current: None,
            chain: None,
            cancel,
        }
    }

    /// Call a method without a dependent.
    ///
    /// Returns the cached node if a consistent one exists, otherwise computes it.
    ///
    /// # Errors
    ///
    /// - `ComputeError::Cancelled` - the computation was cancelled
    /// - `ComputeError::Cycle` - dependency cycle detected
    /// - `ComputeError::Rpc` - a remote dependency failed transiently
    ///
    /// Application failures are not errors here: they are captured in the node's output.
    pub async fn call<M: ComputeMethod>(
        &self,
        method: M,
    ) -> Result<Computed<M::Output>, ComputeError> {
        self.call_with(method, CancellationToken::new()).await
    }

    /// Like [`Self::call`], cancelled by `cancel`.
    pub async fn call_with<M: ComputeMethod>(
        &self,
        method: M,
        cancel: CancellationToken,
    ) -> Result<Computed<M::Output>, ComputeError> {
        self.root_context(cancel).call(method).await
    }

    /// Call a method and return its value.
    pub async fn value<M: ComputeMethod>(&self, method: M) -> Result<M::Output, ComputeError> {
        self.call(method).await?.value()
    }

    /// The consistent node cached for `method`, without computing it.
    pub fn get_existing<M: ComputeMethod>(&self, method: &M) -> Option<Computed<M::Output>> {
        self.shared
            .registry
            .get_or_none(&method.input_key())
            .and_then(Computed::from_core)
    }

    /// Invalidate the node cached for `method`, if there is one.
    pub fn invalidate<M: ComputeMethod>(&self, method: &M) -> bool {
        self.shared
            .registry
            .peek(&method.input_key())
            .is_some_and(|node| node.invalidate(InvalidationReason::Manual))
    }

    /// Invalidate every cached node.
    pub fn invalidate_all(&self) -> usize {
        self.shared
            .registry
            .invalidate_all(InvalidationReason::Manual)
    }

    /// Lookup-or-compute for `key`.
    ///
    /// `body` receives the child context and the node it produces the output for.
    /// It may run more than once if a concurrent computation of the same key was
    /// invalidated before this caller could use it.
    pub(crate) async fn get_or_compute<T, F, Fut>(
        &self,
        parent: &ComputeContext,
        key: InputKey,
        def: &MethodDef,
        body: F,
    ) -> Result<Arc<NodeCore>, ComputeError>
    where
        T: Send + Sync + 'static,
        F: Fn(ComputeContext, Arc<NodeCore>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ComputeError>> + Send,
    {
        parent.check_cancelled()?;

        if !def.cache_enabled {
            return self.compute_uncached(parent, key, body).await;
        }

        if CallFrame::contains(&parent.chain, &key) {
            let path = CallFrame::path(&parent.chain, &key);
            tracing::warn!(path = ?path, "dependency cycle detected");
            return Err(ComputeError::Cycle { path });
        }

        let registry = &self.shared.registry;
        loop {
            if let Some(node) = registry.get_or_none(&key) {
                link(parent, &node);
                return Ok(node);
            }

            let flight = {
                let flights = self.shared.flights.pin();
                flights
                    .get_or_insert_with(key.clone(), || Arc::new(OnceCell::new()))
                    .clone()
            };

            // Only the caller that runs the computation fills this.
            let owned: Mutex<Option<Arc<NodeCore>>> = Mutex::new(None);
            let landed = {
                let (owned, key, body) = (&owned, &key, &body);
                tokio::select! {
                    biased;
                    _ = parent.cancel.cancelled() => Err(ComputeError::Cancelled),
                    landed = flight.get_or_try_init(move || async move {
                        let (node, error) = self.compute_owned(parent, key, def, body).await?;
                        let landed = Landed {
                            node: Arc::downgrade(&node),
                            error,
                        };
                        *owned.lock() = Some(node);
                        Ok::<_, ComputeError>(landed)
                    }) => landed.cloned(),
                }
            };

            if flight.initialized() {
                self.release_flight(&key, &flight);
            }

            let landed = landed?;
            let owned = owned.lock().take();
            let ran = owned.is_some();
            let node = owned.or_else(|| landed.node.upgrade());

            if let Some(err) = landed.error {
                if let Some(node) = &node {
                    link(parent, node);
                }
                return Err(ComputeError::Rpc(err));
            }
            let Some(node) = node else {
                tracing::trace!(key = ?key, "shared computation was dropped, retrying");
                continue;
            };
            if !ran && node.is_invalidated() {
                tracing::trace!(key = ?key, "shared computation was invalidated, retrying");
                continue;
            }
            link(parent, &node);
            return Ok(node);
        }
    }

    async fn compute_owned<T, F, Fut>(
        &self,
        parent: &ComputeContext,
        key: &InputKey,
        def: &MethodDef,
        body: &F,
    ) -> Result<(Arc<NodeCore>, Option<RpcError>), ComputeError>
    where
        T: Send + Sync + 'static,
        F: Fn(ComputeContext, Arc<NodeCore>) -> Fut,
        Fut: Future<Output = Result<T, ComputeError>>,
    {
        let registry = &self.shared.registry;
        // A computation that completed between the lookup and taking the flight.
        if let Some(node) = registry.peek(key) {
            return Ok((node, None));
        }

        let tracer = &self.shared.tracer;
        let node = NodeCore::new(key.clone(), Some(registry.downgrade()));
        let span_id = tracer.new_span_id();
        let mut guard = ComputingGuard {
            node: node.clone(),
            span_id,
            tracer,
            armed: true,
        };
        let ctx = ComputeContext {
            runtime: self.clone(),
            current: Some(node.clone()),
            chain: Some(Arc::new(CallFrame {
                key: key.clone(),
                parent: parent.chain.clone(),
            })),
            cancel: parent.cancel.clone(),
        };

        tracer.on_compute_start(span_id, key);
        tracing::debug!(key = ?key, tag = %node.version_tag(), "computing");

        let outcome = body(ctx, node.clone()).await;
        let result = match outcome {
            Ok(value) => {
                node.set_output::<T>(Ok(value));
                ExecutionResult::Computed
            }
            Err(ComputeError::Failed(failure)) => {
                node.set_output::<T>(Err(failure));
                ExecutionResult::Failed
            }
            Err(ComputeError::Rpc(err)) => {
                guard.disarm();
                node.set_output::<T>(Err(ComputeError::Rpc(err.clone()).into_failure()));
                node.try_complete();
                node.invalidate(InvalidationReason::TransientFailure);
                tracer.on_compute_end(span_id, key, ExecutionResult::Failed);
                tracing::debug!(key = ?key, error = %err, "transient failure");
                return Ok((node, Some(err)));
            }
            // Cancelled or cycle: the guard invalidates the node.
            Err(err) => return Err(err),
        };
        guard.disarm();

        if node.try_complete() {
            registry.register(&node, def.min_cache_duration);
            if let Some(delay) = def.auto_invalidation_delay {
                node.start_auto_invalidation(delay);
            }
            tracer.on_compute_end(span_id, key, result);
        } else {
            tracer.on_compute_end(span_id, key, ExecutionResult::InvalidatedWhileComputing);
            tracing::debug!(key = ?key, "invalidated while computing");
        }
        Ok((node, None))
    }

    async fn compute_uncached<T, F, Fut>(
        &self,
        parent: &ComputeContext,
        key: InputKey,
        body: F,
    ) -> Result<Arc<NodeCore>, ComputeError>
    where
        T: Send + Sync + 'static,
        F: Fn(ComputeContext, Arc<NodeCore>) -> Fut,
        Fut: Future<Output = Result<T, ComputeError>>,
    {
        let node = NodeCore::new(key, None);
        let outcome = tokio::select! {
            biased;
            _ = parent.cancel.cancelled() => Err(ComputeError::Cancelled),
            outcome = body(parent.clone(), node.clone()) => outcome,
        };
        match outcome {
            Ok(value) => node.set_output::<T>(Ok(value)),
            Err(ComputeError::Failed(failure)) => node.set_output::<T>(Err(failure)),
            Err(err) => {
                node.invalidate(InvalidationReason::Cancelled);
                return Err(err);
            }
        };
        node.try_complete();
        Ok(node)
    }

    fn release_flight(&self, key: &InputKey, flight: &Arc<Flight>) {
        let flights = self.shared.flights.pin();
        flights.compute(key.clone(), |entry| match entry {
            Some((_, current)) if Arc::ptr_eq(current, flight) => Operation::Remove,
            _ => Operation::Abort(()),
        });
    }
}

/// Record that the context's current node read `node`.
fn link(parent: &ComputeContext, node: &Arc<NodeCore>) {
    if let Some(current) = &parent.current {
        current.add_dependency(node);
    }
}

/// Builder for [`ComputedRuntime`] with customizable settings.
pub struct ComputedRuntimeBuilder {
    shard_count: usize,
    grace_period: Duration,
    sweep_every_ops: usize,
    tracer: Arc<dyn Tracer>,
}

impl Default for ComputedRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputedRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(16);
        Self {
            shard_count,
            grace_period: Duration::from_secs(5),
            sweep_every_ops: 1024,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Number of registry shards. Rounded up to a power of two.
    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// How long an invalidated node stays discoverable as the latest node of its key.
    ///
    /// Remote calls use it to send the previous version tag and skip the payload
    /// when the value did not change. Zero removes invalidated nodes immediately.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sweep a registry shard after this many registrations on it.
    pub fn sweep_every_ops(mut self, ops: usize) -> Self {
        self.sweep_every_ops = ops;
        self
    }

    /// Set the tracer receiving graph events.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the runtime with the configured settings.
    pub fn build(self) -> ComputedRuntime {
        let registry = ComputedRegistry::new(
            self.shard_count,
            self.grace_period,
            self.sweep_every_ops,
            self.tracer.clone(),
        );
        ComputedRuntime {
            shared: Arc::new(RuntimeShared {
                registry,
                flights: HashMap::with_hasher(ahash::RandomState::new()),
                tracer: self.tracer,
            }),
        }
    }
}
