use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, RpcError};
use crate::invalidation::InvalidationReason;
use crate::key::ReceiverId;
use crate::node::{NodeCore, VersionTag};
use crate::persist::PersistedCache;
use crate::rpc::message::{ReplyPayload, RpcMessage};
use crate::rpc::server::ServiceRegistry;
use crate::rpc::transport::Connection;
use crate::rpc::CallId;
use crate::runtime::ComputedRuntime;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Peer settings, loadable from configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcPeerOptions {
    /// Name used in log records.
    pub name: String,
    /// Fail outbound calls that get no reply within this many milliseconds.
    pub call_timeout_ms: Option<u64>,
}

impl RpcPeerOptions {
    /// The outbound call timeout.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Whether a peer currently has a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection is attached.
    Disconnected,
    /// A connection is attached.
    Connected {
        /// Session number of the attached connection.
        session: u64,
    },
}

/// Snapshot of a peer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Outbound calls sent.
    pub calls_sent: u64,
    /// Inbound calls received.
    pub calls_received: u64,
    /// Replies matched to a pending outbound call.
    pub replies_received: u64,
    /// Replies, invalidations and cancels that referenced an unknown call id.
    pub unknown_replies: u64,
    /// Inbound calls cancelled by the caller while running.
    pub inbound_cancelled: u64,
    /// Invalidations pushed to the caller.
    pub invalidations_sent: u64,
    /// Invalidations received from the server.
    pub invalidations_received: u64,
}

#[derive(Default)]
struct Counters {
    calls_sent: AtomicU64,
    calls_received: AtomicU64,
    replies_received: AtomicU64,
    unknown_replies: AtomicU64,
    inbound_cancelled: AtomicU64,
    invalidations_sent: AtomicU64,
    invalidations_received: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct OutboundCall {
    session: u64,
    reply: Option<oneshot::Sender<ReplyPayload>>,
    /// Client node invalidated when the server reports a change.
    bound: Option<Weak<NodeCore>>,
}

pub(crate) enum InboundCall {
    Running(CancellationToken),
    /// Holds the server node so its invalidation can be pushed to the caller.
    Replied(Arc<NodeCore>),
}

struct Link {
    session: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
}

pub(crate) struct PeerInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) runtime: ComputedRuntime,
    pub(crate) services: ServiceRegistry,
    pub(crate) cache: Option<PersistedCache>,
    options: RpcPeerOptions,
    next_call_id: AtomicU64,
    next_session: AtomicU64,
    link: Mutex<Option<Link>>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<ahash::HashMap<CallId, OutboundCall>>,
    pub(crate) inbound: Mutex<ahash::HashMap<(u64, CallId), InboundCall>>,
    counters: Counters,
}

/// One side of a replication link.
///
/// A peer can call methods on the other side (client role) and serve the methods
/// registered in its [`ServiceRegistry`] (server role) over the same connection.
/// Cheap to clone.
#[derive(Clone)]
pub struct RpcPeer {
    pub(crate) inner: Arc<PeerInner>,
}

/// Builder for [`RpcPeer`].
#[derive(Default)]
pub struct RpcPeerBuilder {
    runtime: Option<ComputedRuntime>,
    services: ServiceRegistry,
    cache: Option<PersistedCache>,
    options: RpcPeerOptions,
}

impl RpcPeerBuilder {
    /// The runtime remote results are cached in and inbound calls computed with.
    pub fn runtime(mut self, runtime: ComputedRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Methods this peer serves.
    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Persisted cache for remote results.
    pub fn cache(mut self, cache: PersistedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace all options.
    pub fn options(mut self, options: RpcPeerOptions) -> Self {
        self.options = options;
        self
    }

    /// Name used in log records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Outbound call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.options.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Build the peer. It starts disconnected.
    pub fn build(self) -> RpcPeer {
        let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
        let name = if self.options.name.is_empty() {
            format!("peer-{}", id)
        } else {
            self.options.name.clone()
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        RpcPeer {
            inner: Arc::new(PeerInner {
                id,
                name,
                runtime: self.runtime.unwrap_or_default(),
                services: self.services,
                cache: self.cache,
                options: self.options,
                next_call_id: AtomicU64::new(0),
                next_session: AtomicU64::new(0),
                link: Mutex::new(None),
                state,
                outbound: Mutex::new(ahash::HashMap::default()),
                inbound: Mutex::new(ahash::HashMap::default()),
                counters: Counters::default(),
            }),
        }
    }
}

impl RpcPeer {
    /// Create a builder.
    pub fn builder() -> RpcPeerBuilder {
        RpcPeerBuilder::default()
    }

    /// Create a peer using `runtime`, serving no methods.
    pub fn new(runtime: ComputedRuntime) -> Self {
        Self::builder().runtime(runtime).build()
    }

    /// Process-unique id of this peer.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name used in log records.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The runtime this peer caches into and computes with.
    pub fn runtime(&self) -> &ComputedRuntime {
        &self.inner.runtime
    }

    /// The methods this peer serves.
    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    /// The persisted cache, if configured.
    pub fn cache(&self) -> Option<&PersistedCache> {
        self.inner.cache.as_ref()
    }

    /// Attach a connection, replacing the current one. Returns the new session number.
    ///
    /// The previous session, if any, is torn down as if the connection was lost.
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, connection: Connection) -> u64 {
        let Connection {
            sender,
            mut receiver,
        } = connection;
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let weak = Arc::downgrade(&self.inner);

        let previous = {
            let mut link = self.inner.link.lock();
            let reader = tokio::spawn(async move {
                while let Some(frame) = receiver.recv().await {
                    let Some(peer) = weak.upgrade() else {
                        return;
                    };
                    peer.handle_frame(session, &frame);
                }
                if let Some(peer) = weak.upgrade() {
                    peer.connection_lost(session);
                }
            });
            link.replace(Link {
                session,
                sender,
                reader: reader.abort_handle(),
            })
        };

        if let Some(previous) = previous {
            previous.reader.abort();
            self.inner.disconnected(previous.session);
        }
        self.inner
            .state
            .send_replace(ConnectionState::Connected { session });
        tracing::debug!(peer = %self.inner.name, session, "connection attached");
        session
    }

    /// Drop the current connection, as if it was lost.
    pub fn detach(&self) {
        let link = self.inner.link.lock().take();
        if let Some(link) = link {
            link.reader.abort();
            self.inner.state.send_replace(ConnectionState::Disconnected);
            self.inner.disconnected(link.session);
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Returns `true` if a connection is attached.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected { .. })
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PeerStats {
        let c = &self.inner.counters;
        PeerStats {
            calls_sent: c.calls_sent.load(Ordering::Relaxed),
            calls_received: c.calls_received.load(Ordering::Relaxed),
            replies_received: c.replies_received.load(Ordering::Relaxed),
            unknown_replies: c.unknown_replies.load(Ordering::Relaxed),
            inbound_cancelled: c.inbound_cancelled.load(Ordering::Relaxed),
            invalidations_sent: c.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: c.invalidations_received.load(Ordering::Relaxed),
        }
    }

    /// Number of outbound calls awaiting a reply or bound to a client node.
    pub fn outbound_calls(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    /// Number of inbound calls running or holding a server node.
    pub fn inbound_calls(&self) -> usize {
        self.inner.inbound.lock().len()
    }
}

/// Sends `Cancel` for the call if dropped before the reply arrives.
struct PendingCall<'a> {
    peer: &'a PeerInner,
    call_id: CallId,
    armed: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.peer.forget(self.call_id);
        }
    }
}

impl PeerInner {
    fn handle_frame(self: &Arc<Self>, session: u64, frame: &[u8]) {
        let message = match RpcMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(peer = %self.name, session, error = %err, "dropping undecodable frame");
                return;
            }
        };
        match message {
            RpcMessage::Call {
                call_id,
                method,
                receiver,
                args,
                known_tag,
            } => self.handle_call(session, call_id, method, receiver, args, known_tag),
            RpcMessage::Reply { call_id, result } => self.on_reply(call_id, result),
            RpcMessage::Invalidate { call_id } => self.on_invalidate(call_id),
            RpcMessage::Cancel { call_id } => self.on_cancel(session, call_id),
        }
    }

    fn on_reply(&self, call_id: CallId, result: ReplyPayload) {
        let sender = {
            let mut outbound = self.outbound.lock();
            match outbound.get_mut(&call_id) {
                Some(call) => {
                    let sender = call.reply.take();
                    if call.bound.is_none() || matches!(result, ReplyPayload::Error(_)) {
                        outbound.remove(&call_id);
                    }
                    sender
                }
                None => None,
            }
        };
        match sender {
            Some(sender) => {
                bump(&self.counters.replies_received);
                let _ = sender.send(result);
            }
            None => {
                bump(&self.counters.unknown_replies);
                let err = RpcError::UnknownCall(call_id);
                tracing::warn!(peer = %self.name, error = %err, "dropping reply");
            }
        }
    }

    fn on_invalidate(&self, call_id: CallId) {
        let call = self.outbound.lock().remove(&call_id);
        let Some(call) = call else {
            bump(&self.counters.unknown_replies);
            let err = RpcError::UnknownCall(call_id);
            tracing::warn!(peer = %self.name, error = %err, "dropping invalidation");
            return;
        };
        bump(&self.counters.invalidations_received);
        tracing::trace!(peer = %self.name, %call_id, "remote invalidation");
        if let Some(node) = call.bound.and_then(|node| node.upgrade()) {
            node.invalidate(InvalidationReason::RemoteInvalidation);
        }
    }

    fn on_cancel(&self, session: u64, call_id: CallId) {
        let call = self.inbound.lock().remove(&(session, call_id));
        match call {
            Some(InboundCall::Running(token)) => {
                token.cancel();
                bump(&self.counters.inbound_cancelled);
                tracing::debug!(peer = %self.name, %call_id, "inbound call cancelled");
            }
            // The caller dropped interest in a finished call.
            Some(InboundCall::Replied(_)) => {}
            None => tracing::trace!(peer = %self.name, %call_id, "cancel for finished call"),
        }
    }

    pub(crate) fn count_inbound_call(&self) {
        bump(&self.counters.calls_received);
    }

    pub(crate) fn count_invalidation_sent(&self) {
        bump(&self.counters.invalidations_sent);
    }

    fn connection_lost(&self, session: u64) {
        let link = {
            let mut link = self.link.lock();
            if link.as_ref().is_some_and(|link| link.session == session) {
                link.take()
            } else {
                None
            }
        };
        if link.is_some() {
            self.state.send_replace(ConnectionState::Disconnected);
            self.disconnected(session);
        }
    }

    /// Fail the outbound calls of `session`, invalidate the nodes bound to them
    /// and cancel its inbound calls.
    fn disconnected(&self, session: u64) {
        let outbound: Vec<OutboundCall> = {
            let mut outbound = self.outbound.lock();
            let ids: Vec<CallId> = outbound
                .iter()
                .filter(|(_, call)| call.session == session)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| outbound.remove(id)).collect()
        };
        let inbound: Vec<InboundCall> = {
            let mut inbound = self.inbound.lock();
            let ids: Vec<(u64, CallId)> = inbound
                .keys()
                .filter(|(s, _)| *s == session)
                .copied()
                .collect();
            ids.iter().filter_map(|id| inbound.remove(id)).collect()
        };

        let mut invalidated = 0;
        for call in outbound {
            // Dropping the reply sender fails the waiting caller.
            drop(call.reply);
            if let Some(node) = call.bound.and_then(|node| node.upgrade()) {
                if node.invalidate(InvalidationReason::PeerDisconnected) {
                    invalidated += 1;
                }
            }
        }
        for call in inbound {
            if let InboundCall::Running(token) = call {
                token.cancel();
            }
        }
        tracing::debug!(peer = %self.name, session, invalidated, "session closed");
    }

    /// Send on `session` only. Returns `false` if that session is gone.
    pub(crate) fn send_on(&self, session: u64, message: &RpcMessage) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(peer = %self.name, error = %err, "failed to encode message");
                return false;
            }
        };
        let link = self.link.lock();
        match link.as_ref() {
            Some(link) if link.session == session => link.sender.send(frame).is_ok(),
            _ => false,
        }
    }

    fn send_current(&self, message: &RpcMessage) -> bool {
        let session = match self.link.lock().as_ref() {
            Some(link) => link.session,
            None => return false,
        };
        self.send_on(session, message)
    }

    /// Send a call and wait for its reply.
    ///
    /// With `bound` set, the call stays in the outbound table after a successful
    /// reply, and a later `Invalidate` for it invalidates that node. Dropping the
    /// returned future or cancelling `cancel` sends `Cancel` to the server.
    pub(crate) async fn invoke(
        &self,
        method: &str,
        receiver: ReceiverId,
        args: Vec<u8>,
        known_tag: Option<VersionTag>,
        bound: Option<&Arc<NodeCore>>,
        cancel: &CancellationToken,
    ) -> Result<(CallId, ReplyPayload), ComputeError> {
        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1);
        let frame = RpcMessage::Call {
            call_id,
            method: method.to_string(),
            receiver,
            args,
            known_tag,
        }
        .encode()
        .map_err(ComputeError::Rpc)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let link = self.link.lock();
            let Some(link) = link.as_ref() else {
                return Err(ComputeError::Rpc(RpcError::Disconnected));
            };
            // Bound before sending, so an early invalidation finds the node.
            self.outbound.lock().insert(
                call_id,
                OutboundCall {
                    session: link.session,
                    reply: Some(reply_tx),
                    bound: bound.map(Arc::downgrade),
                },
            );
            if link.sender.send(frame).is_err() {
                self.outbound.lock().remove(&call_id);
                return Err(ComputeError::Rpc(RpcError::Disconnected));
            }
        }
        bump(&self.counters.calls_sent);
        tracing::trace!(peer = %self.name, %call_id, method, ?known_tag, "call sent");

        let mut pending = PendingCall {
            peer: self,
            call_id,
            armed: true,
        };
        let timeout = self.options.call_timeout();
        let reply = async move {
            match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, reply_rx).await {
                    Ok(reply) => reply.map_err(|_| RpcError::Disconnected),
                    Err(_) => Err(RpcError::Timeout),
                },
                None => reply_rx.await.map_err(|_| RpcError::Disconnected),
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ComputeError::Cancelled),
            reply = reply => reply.map_err(ComputeError::Rpc),
        };
        if outcome.is_ok() {
            pending.armed = false;
        }
        outcome.map(|payload| (call_id, payload))
    }

    /// Stop tracking `call_id` and tell the server, if the call was still tracked.
    pub(crate) fn forget(&self, call_id: CallId) {
        let removed = self.outbound.lock().remove(&call_id).is_some();
        if removed && self.send_current(&RpcMessage::Cancel { call_id }) {
            tracing::trace!(peer = %self.name, %call_id, "cancel sent");
        }
    }

    /// Like [`Self::forget`], only if the call is still bound to `node`.
    pub(crate) fn release(&self, call_id: CallId, node: &NodeCore) {
        let removed = {
            let mut outbound = self.outbound.lock();
            let bound_here = outbound
                .get(&call_id)
                .and_then(|call| call.bound.as_ref())
                .is_some_and(|bound| std::ptr::eq(bound.as_ptr(), node));
            bound_here && outbound.remove(&call_id).is_some()
        };
        if removed && self.send_current(&RpcMessage::Cancel { call_id }) {
            tracing::trace!(peer = %self.name, %call_id, "released call");
        }
    }

    /// Like [`Self::forget`], only if the node bound to the call is gone.
    pub(crate) fn release_orphaned(&self, call_id: CallId) {
        let removed = {
            let mut outbound = self.outbound.lock();
            let orphaned = outbound
                .get(&call_id)
                .and_then(|call| call.bound.as_ref())
                .is_some_and(|bound| bound.strong_count() == 0);
            orphaned && outbound.remove(&call_id).is_some()
        };
        if removed && self.send_current(&RpcMessage::Cancel { call_id }) {
            tracing::trace!(peer = %self.name, %call_id, "released call of dropped node");
        }
    }

    /// Point an outbound call at a different client node.
    pub(crate) fn rebind(&self, call_id: CallId, node: &Arc<NodeCore>) -> bool {
        match self.outbound.lock().get_mut(&call_id) {
            Some(call) => {
                call.bound = Some(Arc::downgrade(node));
                true
            }
            None => false,
        }
    }
}
