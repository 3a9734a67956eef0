//! Replication between a client and a server peer over in-process connections.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use computed_flow::rpc::transport::memory;
use computed_flow::rpc::{CallId, Connection, ReplyPayload, RpcMessage, RpcPeer, ServiceRegistry};
use computed_flow::{
    compute_method, ComputeContext, ComputeError, ComputedRuntime, RemoteMethod, RpcError,
    VersionTag,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Served methods
// ============================================================================

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_RUNS: AtomicUsize = AtomicUsize::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const ZERO_BUMP: AtomicI64 = AtomicI64::new(0);

/// Executions of `increment(x)` per `x`.
static RUNS: [AtomicUsize; 16] = [ZERO_RUNS; 16];
/// Extra amount added by `increment(x)` per `x`.
static BUMP: [AtomicI64; 16] = [ZERO_BUMP; 16];

fn slot(x: i64) -> usize {
    x as usize % 16
}

fn runs(x: i64) -> usize {
    RUNS[slot(x)].load(Ordering::SeqCst)
}

#[compute_method(remote)]
async fn increment(_ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
    RUNS[slot(x)].fetch_add(1, Ordering::SeqCst);
    Ok(x + 1 + BUMP[slot(x)].load(Ordering::SeqCst))
}

#[compute_method(remote)]
async fn remote_hang(_ctx: &ComputeContext, id: u32) -> Result<u32, ComputeError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(id)
}

#[compute_method(remote)]
async fn sensor(_ctx: &ComputeContext, id: u32) -> Result<f64, ComputeError> {
    Err(anyhow::anyhow!("sensor {} offline", id).into())
}

#[compute_method(remote)]
async fn echo(_ctx: &ComputeContext, id: u32) -> Result<u32, ComputeError> {
    Ok(id)
}

#[compute_method(remote)]
async fn unserved(_ctx: &ComputeContext) -> Result<(), ComputeError> {
    Ok(())
}

fn services() -> ServiceRegistry {
    let services = ServiceRegistry::new();
    services
        .register::<Increment>()
        .register::<RemoteHang>()
        .register::<Sensor>()
        .register::<Echo>();
    services
}

fn peers() -> (RpcPeer, RpcPeer) {
    let server = RpcPeer::builder()
        .name("server")
        .services(services())
        .build();
    let client = RpcPeer::builder().name("client").build();
    (server, client)
}

fn connect(server: &RpcPeer, client: &RpcPeer) {
    let (a, b) = memory::pair();
    server.attach(a);
    client.attach(b);
}

/// Connect through a relay that records every frame.
fn connect_tapped(server: &RpcPeer, client: &RpcPeer) -> Arc<Mutex<Vec<RpcMessage>>> {
    let (server_end, server_tap) = memory::pair();
    let (client_end, client_tap) = memory::pair();
    let log = Arc::new(Mutex::new(Vec::new()));

    fn relay(
        log: Arc<Mutex<Vec<RpcMessage>>>,
        mut from: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        to: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = from.recv().await {
                log.lock().push(RpcMessage::decode(&frame).unwrap());
                if to.send(frame).is_err() {
                    break;
                }
            }
        });
    }

    let Connection {
        sender: to_server,
        receiver: from_server,
    } = server_tap;
    let Connection {
        sender: to_client,
        receiver: from_client,
    } = client_tap;
    relay(log.clone(), from_client, to_server);
    relay(log.clone(), from_server, to_client);

    server.attach(server_end);
    client.attach(client_end);
    log
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_remote_call_is_cached_locally() {
    let (server, client) = peers();
    connect(&server, &client);
    let runtime = client.runtime().clone();

    let six = runtime.call_remote(&client, Increment::new(5)).await.unwrap();
    assert_eq!(six.value().unwrap(), 6);
    assert!(six.core().remote_tag().is_some());

    let again = runtime.call_remote(&client, Increment::new(5)).await.unwrap();
    assert!(six.ptr_eq(&again));
    assert_eq!(client.stats().calls_sent, 1);
    assert_eq!(server.stats().calls_received, 1);
    assert_eq!(runs(5), 1);

    // Remote and local calls of the same method are distinct keys.
    assert!(runtime.get_existing(&Increment::new(5)).is_none());
}

#[tokio::test]
async fn test_server_invalidation_is_pushed_without_payload() {
    let (server, client) = peers();
    let log = connect_tapped(&server, &client);
    let runtime = client.runtime().clone();

    let first = runtime.call_remote(&client, Increment::new(6)).await.unwrap();
    assert_eq!(first.value().unwrap(), 7);

    BUMP[slot(6)].store(10, Ordering::SeqCst);
    assert!(server.runtime().invalidate(&Increment::new(6)));
    tokio::time::timeout(Duration::from_secs(5), first.when_invalidated())
        .await
        .expect("client node invalidated");
    assert_eq!(server.stats().invalidations_sent, 1);
    assert_eq!(client.stats().invalidations_received, 1);

    // Exactly one round trip to refresh.
    let refreshed = runtime.call_remote(&client, Increment::new(6)).await.unwrap();
    assert_eq!(refreshed.value().unwrap(), 17);
    assert_eq!(client.stats().calls_sent, 2);
    assert_eq!(runs(6), 2);

    let log = log.lock().clone();
    assert_eq!(log.len(), 5, "unexpected frames: {:?}", log);
    let first_call = log[0].call_id();
    assert!(matches!(log[0], RpcMessage::Call { known_tag: None, .. }));
    assert!(matches!(
        log[1],
        RpcMessage::Reply {
            result: ReplyPayload::Value { .. },
            ..
        }
    ));
    assert_eq!(log[2], RpcMessage::Invalidate { call_id: first_call });
    assert!(matches!(log[3], RpcMessage::Call { known_tag: Some(_), .. }));
    assert!(matches!(
        log[4],
        RpcMessage::Reply {
            result: ReplyPayload::Value { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_unchanged_value_skips_payload() {
    let (server, client) = peers();
    let log = connect_tapped(&server, &client);
    let runtime = client.runtime().clone();

    let first = runtime.call_remote(&client, Increment::new(7)).await.unwrap();
    assert_eq!(first.value().unwrap(), 8);
    // Keep the server node alive independently of the call.
    let server_node = server.runtime().get_existing(&Increment::new(7)).unwrap();

    // Invalidate only the client copy.
    assert!(first.invalidate());
    let second = runtime.call_remote(&client, Increment::new(7)).await.unwrap();
    assert!(!first.ptr_eq(&second));
    assert_eq!(second.value().unwrap(), 8);
    assert_eq!(second.core().remote_tag(), Some(server_node.version_tag()));
    assert_eq!(runs(7), 1);

    let log = log.lock().clone();
    let replies: Vec<&ReplyPayload> = log
        .iter()
        .filter_map(|m| match m {
            RpcMessage::Reply { result, .. } => Some(result),
            _ => None,
        })
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(
        replies[1],
        &ReplyPayload::Unchanged {
            tag: server_node.version_tag()
        }
    );
}

#[tokio::test]
async fn test_disconnect_invalidates_and_reconnect_recovers() {
    let (server, client) = peers();
    connect(&server, &client);
    let runtime = client.runtime().clone();

    let node = runtime.call_remote(&client, Increment::new(8)).await.unwrap();
    assert_eq!(client.outbound_calls(), 1);

    client.detach();
    assert!(!client.is_connected());
    assert!(node.core().is_invalidated());
    assert_eq!(client.outbound_calls(), 0);

    let err = runtime
        .call_remote(&client, Increment::new(8))
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::Rpc(RpcError::Disconnected)));
    assert!(err.is_transient());

    connect(&server, &client);
    let again = runtime.call_remote(&client, Increment::new(8)).await.unwrap();
    assert_eq!(again.value().unwrap(), 9);
    assert!(again.is_consistent());
    assert_eq!(client.stats().calls_sent, 2);
}

#[tokio::test]
async fn test_messages_for_calls_of_a_closed_session_are_ignored() {
    let client = RpcPeer::builder().name("client").build();
    let runtime = client.runtime().clone();
    let (local, mut remote) = memory::pair();
    client.attach(local);

    let call = {
        let runtime = runtime.clone();
        let client = client.clone();
        tokio::spawn(async move { runtime.call_remote(&client, Increment::new(11)).await })
    };
    // Hand-rolled server.
    let frame = remote.receiver.recv().await.unwrap();
    let call_id = RpcMessage::decode(&frame).unwrap().call_id();
    let reply = RpcMessage::Reply {
        call_id,
        result: ReplyPayload::Value {
            tag: VersionTag(1),
            type_tag: Increment::type_tag().to_string(),
            bytes: Increment::encode_output(&12).unwrap(),
        },
    };
    remote.sender.send(reply.encode().unwrap()).unwrap();
    let node = call.await.unwrap().unwrap();
    assert_eq!(node.value().unwrap(), 12);

    let (local, remote) = memory::pair();
    client.attach(local);
    assert!(node.core().is_invalidated());

    remote
        .sender
        .send(RpcMessage::Invalidate { call_id }.encode().unwrap())
        .unwrap();
    remote
        .sender
        .send(
            RpcMessage::Reply {
                call_id: CallId(call_id.0 + 100),
                result: ReplyPayload::Unchanged { tag: VersionTag(1) },
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
    wait_until(|| client.stats().unknown_replies == 2).await;
    assert_eq!(client.stats().invalidations_received, 0);
}

#[tokio::test]
async fn test_cancel_reaches_server() {
    let (server, client) = peers();
    connect(&server, &client);
    let cancel = CancellationToken::new();

    let call = {
        let runtime = client.runtime().clone();
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            runtime
                .call_remote_with(&client, RemoteHang::new(1), cancel)
                .await
        })
    };
    wait_until(|| server.stats().calls_received == 1).await;
    cancel.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ComputeError::Cancelled));
    wait_until(|| server.stats().inbound_cancelled == 1).await;
    wait_until(|| server.inbound_calls() == 0).await;
    assert_eq!(client.outbound_calls(), 0);
}

#[tokio::test]
async fn test_call_timeout_fails_and_cancels_server_call() {
    let (server, _) = peers();
    let client = RpcPeer::builder()
        .name("client")
        .call_timeout(Duration::from_millis(100))
        .build();
    connect(&server, &client);

    let err = client
        .runtime()
        .call_remote(&client, RemoteHang::new(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::Rpc(RpcError::Timeout)));
    assert!(err.is_transient());
    assert_eq!(client.outbound_calls(), 0);

    wait_until(|| server.stats().inbound_cancelled == 1).await;
    wait_until(|| server.inbound_calls() == 0).await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_transient_failure() {
    let (server, _) = peers();
    let client = RpcPeer::builder()
        .name("client")
        .call_timeout(Duration::from_millis(200))
        .build();
    connect(&server, &client);

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let runtime = client.runtime().clone();
            let client = client.clone();
            tokio::spawn(async move { runtime.call_remote(&client, RemoteHang::new(3)).await })
        })
        .collect();
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ComputeError::Rpc(RpcError::Timeout)));
    }
    assert_eq!(client.stats().calls_sent, 1);
    assert_eq!(server.stats().calls_received, 1);
}

#[tokio::test]
async fn test_dropped_remote_nodes_release_call_tables() {
    let (server, client) = peers();
    connect(&server, &client);
    let runtime = client.runtime().clone();

    for id in 0..50 {
        let node = runtime.call_remote(&client, Echo::new(id)).await.unwrap();
        assert_eq!(node.value().unwrap(), id);
    }
    wait_until(|| client.outbound_calls() == 0).await;
    wait_until(|| server.inbound_calls() == 0).await;

    // Nothing keeps the nodes alive on either side.
    for registry in [runtime.registry(), server.runtime().registry()] {
        wait_until(|| {
            registry.sweep();
            registry.is_empty()
        })
        .await;
    }
}

#[tokio::test]
async fn test_unknown_method_is_an_rpc_error() {
    let (server, client) = peers();
    connect(&server, &client);

    let err = client
        .runtime()
        .call_remote(&client, Unserved::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComputeError::Rpc(RpcError::MethodNotFound(ref name)) if name == "unserved"
    ));
    assert!(client
        .runtime()
        .get_existing(&Unserved::new())
        .is_none());
}

#[tokio::test]
async fn test_remote_failure_is_replicated() {
    let (server, client) = peers();
    connect(&server, &client);
    let runtime = client.runtime().clone();

    let reading = runtime.call_remote(&client, Sensor::new(3)).await.unwrap();
    let failure = reading.output().as_ref().unwrap_err();
    assert_eq!(failure.message, "sensor 3 offline");

    let again = runtime.call_remote(&client, Sensor::new(3)).await.unwrap();
    assert!(reading.ptr_eq(&again));
    assert_eq!(client.stats().calls_sent, 1);
}

static DEPENDENT_CLIENT: OnceLock<RpcPeer> = OnceLock::new();

#[compute_method]
async fn doubled(ctx: &ComputeContext, x: i64) -> Result<i64, ComputeError> {
    let peer = DEPENDENT_CLIENT
        .get()
        .ok_or_else(|| anyhow::anyhow!("client peer not set"))?;
    Ok(ctx.value_remote(peer, Increment::new(x)).await? * 2)
}

#[tokio::test]
async fn test_local_node_depending_on_remote_node() {
    let (server, client) = peers();
    connect(&server, &client);
    DEPENDENT_CLIENT.set(client.clone()).ok().unwrap();
    let runtime: ComputedRuntime = client.runtime().clone();

    let doubled = runtime.call(Doubled::new(10)).await.unwrap();
    assert_eq!(doubled.value().unwrap(), 22);

    BUMP[slot(10)].store(1, Ordering::SeqCst);
    server.runtime().invalidate(&Increment::new(10));
    tokio::time::timeout(Duration::from_secs(5), doubled.when_invalidated())
        .await
        .expect("local dependent invalidated");

    assert_eq!(runtime.value(Doubled::new(10)).await.unwrap(), 24);
}
