//! Calling remote methods through the local registry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, IntoComputeResult, RpcError};
use crate::invalidation::InvalidationReason;
use crate::key::{CacheKey, InputKey, WireKey};
use crate::method::RemoteMethod;
use crate::node::{Computed, NodeCore, VersionTag};
use crate::rpc::message::ReplyPayload;
use crate::rpc::peer::{PeerInner, RpcPeer};
use crate::rpc::CallId;
use crate::runtime::{typed, ComputeContext, ComputedRuntime};

/// Registry key of a remote call: the method value and the peer it is routed to.
#[derive(Clone)]
struct RemoteCall<M> {
    peer: u64,
    method: M,
}

impl<M: CacheKey> Hash for RemoteCall<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        self.method.dyn_hash(state);
    }
}

impl<M: CacheKey + 'static> PartialEq for RemoteCall<M> {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.method.dyn_eq(other.method.as_any())
    }
}

impl<M: CacheKey + 'static> Eq for RemoteCall<M> {}

impl<M: fmt::Debug> fmt::Debug for RemoteCall<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} via peer-{}", self.method, self.peer)
    }
}

/// Remote result as written to the persisted cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedRemote {
    tag: VersionTag,
    type_tag: String,
    bytes: Vec<u8>,
}

impl ComputedRuntime {
    /// Call a method on `peer`, caching the result locally.
    ///
    /// The cached node stays consistent until the peer reports that its own node
    /// was invalidated, or the connection is lost.
    pub async fn call_remote<M: RemoteMethod>(
        &self,
        peer: &RpcPeer,
        method: M,
    ) -> Result<Computed<M::Output>, ComputeError> {
        self.call_remote_with(peer, method, CancellationToken::new())
            .await
    }

    /// Like [`Self::call_remote`], cancelled by `cancel`. Cancelling sends `Cancel` to the peer.
    pub async fn call_remote_with<M: RemoteMethod>(
        &self,
        peer: &RpcPeer,
        method: M,
        cancel: CancellationToken,
    ) -> Result<Computed<M::Output>, ComputeError> {
        self.root_context(cancel).call_remote(peer, method).await
    }

    /// Call a method on `peer` and return its value.
    pub async fn value_remote<M: RemoteMethod>(
        &self,
        peer: &RpcPeer,
        method: M,
    ) -> Result<M::Output, ComputeError> {
        self.call_remote(peer, method).await?.value()
    }
}

impl ComputeContext {
    /// Call a method on `peer` as a dependency of the current computation.
    pub async fn call_remote<M: RemoteMethod>(
        &self,
        peer: &RpcPeer,
        method: M,
    ) -> Result<Computed<M::Output>, ComputeError> {
        let key = InputKey::new(
            M::DEFINITION.id,
            method.receiver(),
            RemoteCall {
                peer: peer.id(),
                method: method.clone(),
            },
        );
        let peer = peer.inner.clone();
        let core = self
            .runtime()
            .get_or_compute::<M::Output, _, _>(self, key, &M::DEFINITION, move |ctx, node| {
                let peer = peer.clone();
                let method = method.clone();
                async move { peer.compute_remote(&ctx, &node, &method).await }
            })
            .await?;
        typed(core)
    }

    /// Call a method on `peer` and return its value.
    pub async fn value_remote<M: RemoteMethod>(
        &self,
        peer: &RpcPeer,
        method: M,
    ) -> Result<M::Output, ComputeError> {
        self.call_remote(peer, method).await?.value()
    }
}

impl PeerInner {
    async fn compute_remote<M: RemoteMethod>(
        self: &Arc<Self>,
        ctx: &ComputeContext,
        node: &Arc<NodeCore>,
        method: &M,
    ) -> Result<M::Output, ComputeError> {
        let wire = method.wire_key().into_compute()?;
        let registry = ctx.runtime().registry();
        let previous = registry
            .get_latest(node.key())
            .filter(|previous| !Arc::ptr_eq(previous, node) && previous.remote_tag().is_some());

        if previous.is_none() {
            if let Some((tag, value)) = self.load_cached::<M>(&wire).await {
                tracing::debug!(peer = %self.name, key = ?node.key(), "serving persisted value");
                node.set_remote_tag(tag);
                self.spawn_revalidation::<M>(ctx.runtime().clone(), node.clone(), wire, tag);
                return Ok(value);
            }
        }

        let known_tag = previous.as_ref().and_then(|previous| previous.remote_tag());
        let (call_id, reply) = self
            .invoke(
                &wire.method,
                wire.receiver,
                wire.args.clone(),
                known_tag,
                Some(node),
                ctx.cancellation(),
            )
            .await?;
        let output = self.accept_reply::<M>(call_id, reply, node, previous.as_ref(), &wire);
        if !matches!(output, Err(ComputeError::Rpc(_))) {
            self.release_with_node(call_id, node);
        }
        output
    }

    /// Turn a reply into the output of `node`.
    fn accept_reply<M: RemoteMethod>(
        &self,
        call_id: CallId,
        reply: ReplyPayload,
        node: &Arc<NodeCore>,
        previous: Option<&Arc<NodeCore>>,
        wire: &WireKey,
    ) -> Result<M::Output, ComputeError> {
        match reply {
            ReplyPayload::Value {
                tag,
                type_tag,
                bytes,
            } => {
                if !M::DEFINITION.polymorphic_result && type_tag != M::type_tag() {
                    self.forget(call_id);
                    return Err(ComputeError::Rpc(RpcError::TypeMismatch {
                        expected: M::type_tag().to_string(),
                        actual: type_tag,
                    }));
                }
                let value = match M::decode_output(&bytes) {
                    Ok(value) => value,
                    Err(err) => {
                        self.forget(call_id);
                        return Err(ComputeError::Rpc(err));
                    }
                };
                node.set_remote_tag(tag);
                self.write_back(wire, tag, type_tag, bytes);
                Ok(value)
            }
            ReplyPayload::Unchanged { tag } => {
                let previous =
                    previous.and_then(|previous| Computed::<M::Output>::from_core(previous.clone()));
                let Some(previous) = previous else {
                    self.forget(call_id);
                    return Err(ComputeError::Rpc(RpcError::Codec(
                        "unchanged reply without a previous value".to_string(),
                    )));
                };
                tracing::trace!(peer = %self.name, %call_id, "remote value unchanged");
                node.set_remote_tag(tag);
                previous.output().clone().map_err(ComputeError::Failed)
            }
            ReplyPayload::Failed { tag, failure } => {
                node.set_remote_tag(tag);
                if let Some(cache) = &self.cache {
                    cache.remove(&wire.cache_key());
                }
                Err(ComputeError::Failed(failure))
            }
            ReplyPayload::Error(err) => Err(ComputeError::Rpc(err)),
        }
    }

    /// Drop the call from the tables once the client node is invalidated or dropped.
    fn release_with_node(self: &Arc<Self>, call_id: CallId, node: &Arc<NodeCore>) {
        let peer = Arc::downgrade(self);
        node.on_invalidated(move |node| {
            if let Some(peer) = peer.upgrade() {
                peer.release(call_id, node);
            }
        });
        let peer = Arc::downgrade(self);
        node.on_dropped(move || {
            if let Some(peer) = peer.upgrade() {
                peer.release_orphaned(call_id);
            }
        });
    }

    fn write_back(&self, wire: &WireKey, tag: VersionTag, type_tag: String, bytes: Vec<u8>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let record = CachedRemote {
            tag,
            type_tag,
            bytes,
        };
        match bincode::serialize(&record) {
            Ok(encoded) => cache.set(wire.cache_key(), encoded),
            Err(err) => tracing::warn!(peer = %self.name, error = %err, "failed to encode cache record"),
        }
    }

    async fn load_cached<M: RemoteMethod>(&self, wire: &WireKey) -> Option<(VersionTag, M::Output)> {
        let cache = self.cache.as_ref()?;
        let key = wire.cache_key();
        let bytes = cache.get(&key).await?;
        let record: CachedRemote = match bincode::deserialize(&bytes) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(peer = %self.name, key, error = %err, "dropping corrupt cache record");
                cache.remove(&key);
                return None;
            }
        };
        if !M::DEFINITION.polymorphic_result && record.type_tag != M::type_tag() {
            return None;
        }
        match M::decode_output(&record.bytes) {
            Ok(value) => Some((record.tag, value)),
            Err(err) => {
                tracing::warn!(peer = %self.name, key, error = %err, "dropping undecodable cache record");
                cache.remove(&key);
                None
            }
        }
    }

    /// Ask the server whether a persisted value is still current.
    ///
    /// `Unchanged` binds the cold node to the call. Any other result replaces
    /// it with a fresh node built from the reply.
    fn spawn_revalidation<M: RemoteMethod>(
        self: &Arc<Self>,
        runtime: ComputedRuntime,
        node: Arc<NodeCore>,
        wire: WireKey,
        tag: VersionTag,
    ) {
        let peer = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let reply = peer
                .invoke(
                    &wire.method,
                    wire.receiver,
                    wire.args.clone(),
                    Some(tag),
                    Some(&node),
                    &cancel,
                )
                .await;
            let (call_id, payload) = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::debug!(peer = %peer.name, error = %err, "revalidation failed");
                    node.invalidate(InvalidationReason::TransientFailure);
                    return;
                }
            };
            if let ReplyPayload::Unchanged { .. } = payload {
                tracing::trace!(peer = %peer.name, %call_id, "persisted value confirmed");
                peer.release_with_node(call_id, &node);
                return;
            }

            let registry = runtime.registry();
            let fresh = NodeCore::new(node.key().clone(), Some(registry.downgrade()));
            match peer.accept_reply::<M>(call_id, payload, &fresh, None, &wire) {
                Ok(value) => {
                    fresh.set_output::<M::Output>(Ok(value));
                }
                Err(ComputeError::Failed(failure)) => {
                    fresh.set_output::<M::Output>(Err(failure));
                }
                Err(err) => {
                    tracing::debug!(peer = %peer.name, error = %err, "revalidation failed");
                    node.invalidate(InvalidationReason::TransientFailure);
                    return;
                }
            }
            peer.rebind(call_id, &fresh);
            node.invalidate(InvalidationReason::RemoteInvalidation);
            if fresh.try_complete() {
                registry.register(&fresh, M::DEFINITION.min_cache_duration);
                peer.release_with_node(call_id, &fresh);
            }
            tracing::debug!(peer = %peer.name, key = ?fresh.key(), "persisted value replaced");
        });
    }
}
