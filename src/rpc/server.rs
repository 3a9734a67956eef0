//! Serving inbound calls.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use papaya::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, RpcError};
use crate::key::ReceiverId;
use crate::method::RemoteMethod;
use crate::node::{NodeCore, VersionTag};
use crate::rpc::message::{ReplyPayload, RpcMessage};
use crate::rpc::peer::{InboundCall, PeerInner};
use crate::rpc::CallId;
use crate::runtime::ComputedRuntime;

/// Type-erased handler for one method.
#[async_trait]
trait InboundHandler: Send + Sync {
    async fn handle(
        &self,
        runtime: &ComputedRuntime,
        args: &[u8],
        known_tag: Option<VersionTag>,
        cancel: CancellationToken,
    ) -> Result<(Arc<NodeCore>, ReplyPayload), RpcError>;
}

struct MethodHandler<M>(PhantomData<fn() -> M>);

#[async_trait]
impl<M: RemoteMethod> InboundHandler for MethodHandler<M> {
    async fn handle(
        &self,
        runtime: &ComputedRuntime,
        args: &[u8],
        known_tag: Option<VersionTag>,
        cancel: CancellationToken,
    ) -> Result<(Arc<NodeCore>, ReplyPayload), RpcError> {
        let method: M = bincode::deserialize(args)?;
        let computed = runtime
            .call_with(method, cancel)
            .await
            .map_err(|err| match err {
                ComputeError::Rpc(err) => err,
                other => RpcError::Remote(other.to_string()),
            })?;

        let tag = computed.version_tag();
        let payload = if known_tag == Some(tag) {
            ReplyPayload::Unchanged { tag }
        } else {
            match computed.output() {
                Ok(value) => ReplyPayload::Value {
                    tag,
                    type_tag: M::type_tag().to_string(),
                    bytes: M::encode_output(value)?,
                },
                Err(failure) => ReplyPayload::Failed {
                    tag,
                    failure: failure.clone(),
                },
            }
        };
        Ok((computed.core().clone(), payload))
    }
}

/// The methods a peer serves, by name.
///
/// Cheap to clone; clones share the same table.
///
/// ```
/// use computed_flow::rpc::ServiceRegistry;
/// # use computed_flow::{async_trait, ComputeContext, ComputeError, ComputeMethod, MethodDef};
/// # #[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// # struct Increment(i64);
/// # #[async_trait]
/// # impl ComputeMethod for Increment {
/// #     type Output = i64;
/// #     const DEFINITION: MethodDef = MethodDef::new("increment");
/// #     async fn compute(&self, _ctx: &ComputeContext) -> Result<i64, ComputeError> { Ok(self.0 + 1) }
/// # }
///
/// let services = ServiceRegistry::new();
/// services.register::<Increment>();
/// assert!(services.contains("increment"));
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    handlers: Arc<HashMap<String, Arc<dyn InboundHandler>, ahash::RandomState>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(HashMap::with_hasher(ahash::RandomState::new())),
        }
    }

    /// Serve `M` under its method name. Replaces an earlier registration of that name.
    pub fn register<M: RemoteMethod>(&self) -> &Self {
        let handler: Arc<dyn InboundHandler> = Arc::new(MethodHandler::<M>(PhantomData));
        self.handlers
            .pin()
            .insert(M::DEFINITION.id.name().to_string(), handler);
        self
    }

    /// Returns `true` if a method with this name is served.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.pin().contains_key(method)
    }

    /// Number of served methods.
    pub fn len(&self) -> usize {
        self.handlers.pin().len()
    }

    /// Returns `true` if no methods are served.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, method: &str) -> Option<Arc<dyn InboundHandler>> {
        self.handlers.pin().get(method).cloned()
    }
}

impl PeerInner {
    /// Run an inbound call on its own task and reply on the session it arrived on.
    pub(crate) fn handle_call(
        self: &Arc<Self>,
        session: u64,
        call_id: CallId,
        method: String,
        receiver: ReceiverId,
        args: Vec<u8>,
        known_tag: Option<VersionTag>,
    ) {
        self.count_inbound_call();
        let Some(handler) = self.services.get(&method) else {
            tracing::warn!(peer = %self.name, %call_id, method, "call for unknown method");
            self.send_on(
                session,
                &RpcMessage::Reply {
                    call_id,
                    result: ReplyPayload::Error(RpcError::MethodNotFound(method)),
                },
            );
            return;
        };
        tracing::trace!(peer = %self.name, %call_id, method, receiver = receiver.0, "inbound call");

        let token = CancellationToken::new();
        self.inbound
            .lock()
            .insert((session, call_id), InboundCall::Running(token.clone()));

        let peer = self.clone();
        tokio::spawn(async move {
            let outcome = handler
                .handle(&peer.runtime, &args, known_tag, token.clone())
                .await;
            if token.is_cancelled() {
                return;
            }
            match outcome {
                Ok((node, payload)) => {
                    {
                        let mut inbound = peer.inbound.lock();
                        match inbound.get_mut(&(session, call_id)) {
                            Some(entry) => *entry = InboundCall::Replied(node.clone()),
                            None => return,
                        }
                    }
                    peer.send_on(
                        session,
                        &RpcMessage::Reply {
                            call_id,
                            result: payload,
                        },
                    );
                    let weak = Arc::downgrade(&peer);
                    node.on_invalidated(move |_| {
                        if let Some(peer) = weak.upgrade() {
                            peer.push_invalidation(session, call_id);
                        }
                    });
                }
                Err(err) => {
                    peer.inbound.lock().remove(&(session, call_id));
                    tracing::debug!(peer = %peer.name, %call_id, error = %err, "inbound call failed");
                    peer.send_on(
                        session,
                        &RpcMessage::Reply {
                            call_id,
                            result: ReplyPayload::Error(err),
                        },
                    );
                }
            }
        });
    }

    /// Tell the caller its result went stale. Sends at most once per call.
    fn push_invalidation(&self, session: u64, call_id: CallId) {
        let replied = matches!(
            self.inbound.lock().remove(&(session, call_id)),
            Some(InboundCall::Replied(_))
        );
        if replied && self.send_on(session, &RpcMessage::Invalidate { call_id }) {
            self.count_invalidation_sent();
            tracing::trace!(peer = %self.name, %call_id, "invalidation sent");
        }
    }
}
