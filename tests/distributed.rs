//! Cross-node group behavior over a shared in-memory backplane
//!
//! Two repositories with their own node ids stand in for two server
//! processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use hubcast::backplane::{counter_key, Backplane, Subscription};
use hubcast::error::BackplaneError;
use hubcast::group::{DistributedGroupFactory, GroupRepositoryFactory, Recipients};
use hubcast::protocol::{FrameReader, ServerMessage};
use hubcast::stats::HubMetrics;
use hubcast::{BroadcastSerializer, ConnectionHandle, GroupConfig, GroupRepository, MemoryBackplane};

const WAIT: Duration = Duration::from_secs(2);

fn node(backplane: &MemoryBackplane) -> GroupRepository {
    DistributedGroupFactory::new(GroupConfig::default(), Arc::new(backplane.clone()))
        .create_repository(Arc::new(HubMetrics::new()))
}

/// Decode the broadcast carried by one queued frame
async fn next_broadcast(rx: &mut mpsc::Receiver<Bytes>) -> (i32, String) {
    let frame = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no frame delivered")
        .expect("queue closed");
    let mut reader = FrameReader::new(&frame[..]);
    let body = reader.read_frame().await.unwrap().unwrap();
    match ServerMessage::decode(body).unwrap() {
        ServerMessage::Broadcast(message) => {
            let text = BroadcastSerializer::default().decode(message.payload()).unwrap();
            (message.method_id(), text)
        }
        other => panic!("expected broadcast, got {:?}", other),
    }
}

#[tokio::test]
async fn test_member_count_spans_nodes() {
    let backplane = MemoryBackplane::new();
    let first = node(&backplane);
    let second = node(&backplane);
    assert_ne!(first.node_id(), second.node_id());

    let (alice, _alice_rx) = ConnectionHandle::channel(8);
    let (bob, _bob_rx) = ConnectionHandle::channel(8);
    let bob_id = bob.id();

    let on_first = first.join("G", alice).await;
    let on_second = second.join("G", bob).await;

    assert_eq!(on_first.member_count().await, 2);
    assert_eq!(on_second.member_count().await, 2);
    assert_eq!(on_first.local_member_count(), 1);

    second.leave("G", bob_id).await;
    assert_eq!(on_first.member_count().await, 1);
}

#[tokio::test]
async fn test_counter_key_removed_when_last_member_leaves() {
    let backplane = MemoryBackplane::new();
    let repository = node(&backplane);
    let key = counter_key(&GroupConfig::default().key_prefix, "G");

    let (handle, _rx) = ConnectionHandle::channel(8);
    let id = handle.id();
    repository.join("G", handle).await;
    assert!(backplane.has_counter(&key));

    assert!(repository.leave("G", id).await);
    assert!(!backplane.has_counter(&key));
    assert!(repository.get("G").is_none());
}

#[tokio::test]
async fn test_broadcast_reaches_other_node() {
    let backplane = MemoryBackplane::new();
    let first = node(&backplane);
    let second = node(&backplane);

    let (alice, mut alice_rx) = ConnectionHandle::channel(8);
    let (bob, mut bob_rx) = ConnectionHandle::channel(8);
    let alice_id = alice.id();

    let group = first.join("G", alice).await;
    second.join("G", bob).await;

    let report = group
        .broadcast(Recipients::Except(vec![alice_id]), 7, "hello")
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);
    assert!(report.published);

    assert_eq!(next_broadcast(&mut bob_rx).await, (7, "hello".to_string()));
    assert!(tokio::time::timeout(Duration::from_millis(50), alice_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_local_members_receive_once() {
    let backplane = MemoryBackplane::new();
    let first = node(&backplane);
    let second = node(&backplane);

    let (alice, mut alice_rx) = ConnectionHandle::channel(8);
    let (bob, mut bob_rx) = ConnectionHandle::channel(8);

    let group = first.join("G", alice).await;
    second.join("G", bob).await;

    group.broadcast(Recipients::All, 1, "first").await.unwrap();
    group.broadcast(Recipients::All, 1, "second").await.unwrap();

    assert_eq!(next_broadcast(&mut alice_rx).await.1, "first");
    assert_eq!(next_broadcast(&mut alice_rx).await.1, "second");
    assert_eq!(next_broadcast(&mut bob_rx).await.1, "first");
    assert_eq!(next_broadcast(&mut bob_rx).await.1, "second");

    // The origin node drops its own envelope
    assert!(tokio::time::timeout(Duration::from_millis(50), alice_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_targeted_broadcast_across_nodes() {
    let backplane = MemoryBackplane::new();
    let first = node(&backplane);
    let second = node(&backplane);

    let (alice, _alice_rx) = ConnectionHandle::channel(8);
    let (bob, mut bob_rx) = ConnectionHandle::channel(8);
    let (carol, mut carol_rx) = ConnectionHandle::channel(8);
    let carol_id = carol.id();

    let group = first.join("G", alice).await;
    second.join("G", bob).await;
    second.join("G", carol).await;

    group.broadcast(Recipients::Only(vec![carol_id]), 3, "psst").await.unwrap();

    assert_eq!(next_broadcast(&mut carol_rx).await, (3, "psst".to_string()));
    assert!(tokio::time::timeout(Duration::from_millis(50), bob_rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_emptied_node_stops_relaying() {
    let backplane = MemoryBackplane::new();
    let first = node(&backplane);
    let second = node(&backplane);

    let (alice, _alice_rx) = ConnectionHandle::channel(8);
    let (bob, _bob_rx) = ConnectionHandle::channel(8);
    let bob_id = bob.id();

    let group = first.join("G", alice).await;
    second.join("G", bob).await;
    second.leave("G", bob_id).await;
    assert!(second.get("G").is_none());

    let report = group.broadcast(Recipients::All, 1, "anyone?").await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.published);
    assert!(second.get("G").is_none());
}

/// Backplane whose every operation fails
struct Unreachable;

#[async_trait]
impl Backplane for Unreachable {
    async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BackplaneError> {
        Err(BackplaneError::Unavailable("down".to_string()))
    }

    async fn subscribe(&self, _channel: &str) -> Result<Subscription, BackplaneError> {
        Err(BackplaneError::Unavailable("down".to_string()))
    }

    async fn increment(&self, _key: &str) -> Result<i64, BackplaneError> {
        Err(BackplaneError::Unavailable("down".to_string()))
    }

    async fn decrement(&self, _key: &str) -> Result<i64, BackplaneError> {
        Err(BackplaneError::Unavailable("down".to_string()))
    }

    async fn count(&self, _key: &str) -> Result<i64, BackplaneError> {
        Err(BackplaneError::Unavailable("down".to_string()))
    }
}

#[tokio::test]
async fn test_backplane_failure_degrades_to_local() {
    let metrics = Arc::new(HubMetrics::new());
    let repository = GroupRepository::with_backplane(GroupConfig::default(), Arc::new(Unreachable))
        .with_metrics(Arc::clone(&metrics));

    let (alice, mut alice_rx) = ConnectionHandle::channel(8);
    let (bob, mut bob_rx) = ConnectionHandle::channel(8);
    let alice_id = alice.id();

    let group = repository.join("G", alice).await;
    repository.join("G", bob).await;
    assert_eq!(group.member_count().await, 2);

    let report = group.broadcast(Recipients::All, 9, "local").await.unwrap();
    assert_eq!(report.delivered, 2);
    assert!(!report.published);

    assert_eq!(next_broadcast(&mut alice_rx).await.1, "local");
    assert_eq!(next_broadcast(&mut bob_rx).await.1, "local");

    assert!(!repository.leave("G", alice_id).await);
    assert_eq!(group.member_count().await, 1);
    assert!(metrics.snapshot().backplane_errors > 0);
}

/// Memory backplane whose first subscription is already closed
struct DroppedFirstSubscription {
    inner: MemoryBackplane,
    subscribes: AtomicUsize,
}

#[async_trait]
impl Backplane for DroppedFirstSubscription {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError> {
        if self.subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
            let (_tx, rx) = mpsc::channel(1);
            return Ok(Subscription::new(channel, rx, tokio_util::sync::CancellationToken::new()));
        }
        self.inner.subscribe(channel).await
    }

    async fn increment(&self, key: &str) -> Result<i64, BackplaneError> {
        self.inner.increment(key).await
    }

    async fn decrement(&self, key: &str) -> Result<i64, BackplaneError> {
        self.inner.decrement(key).await
    }

    async fn count(&self, key: &str) -> Result<i64, BackplaneError> {
        self.inner.count(key).await
    }
}

#[tokio::test]
async fn test_relay_resubscribes_after_channel_closes() {
    let backplane = MemoryBackplane::new();
    let flaky = Arc::new(DroppedFirstSubscription {
        inner: backplane.clone(),
        subscribes: AtomicUsize::new(0),
    });
    let first = GroupRepository::with_backplane(GroupConfig::default(), flaky.clone());
    let second = node(&backplane);

    let (alice, mut alice_rx) = ConnectionHandle::channel(8);
    let (bob, _bob_rx) = ConnectionHandle::channel(8);
    first.join("G", alice).await;
    let group = second.join("G", bob).await;

    tokio::time::timeout(WAIT, async {
        while flaky.subscribes.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never resubscribed");

    group.broadcast(Recipients::All, 5, "again").await.unwrap();
    assert_eq!(next_broadcast(&mut alice_rx).await, (5, "again".to_string()));
}

mod servers {
    use futures::future::BoxFuture;
    use hubcast::client::{ClientEvent, HubClient};
    use hubcast::hub::{MethodTable, StreamingHub};
    use hubcast::{HubContext, HubServer, ServerConfig, Status};

    use super::*;

    struct RoomHub;

    impl StreamingHub for RoomHub {
        fn method_table() -> MethodTable<Self> {
            MethodTable::new().register(1, "join", join).register(2, "say", say)
        }
    }

    fn join<'a>(_hub: &'a mut RoomHub, ctx: HubContext, args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
        Box::pin(async move {
            let room: String = ctx.decode(&args)?;
            let group = ctx.groups().join(&room).await?;
            ctx.encode(&(group.member_count().await as u32))
        })
    }

    fn say<'a>(_hub: &'a mut RoomHub, ctx: HubContext, args: Bytes) -> BoxFuture<'a, Result<Bytes, Status>> {
        Box::pin(async move {
            let (room, text): (String, String) = ctx.decode(&args)?;
            let group = ctx.groups().get(&room).ok_or_else(|| Status::not_found("not joined"))?;
            group
                .broadcast_except_self(ctx.connection_id(), &ctx.message(50, &text)?)
                .await;
            ctx.encode(&())
        })
    }

    fn server(backplane: &MemoryBackplane) -> Arc<HubServer<RoomHub>> {
        let factory = DistributedGroupFactory::new(GroupConfig::default(), Arc::new(backplane.clone()));
        Arc::new(HubServer::with_group_factory(ServerConfig::default(), || RoomHub, &factory))
    }

    async fn connect(server: &Arc<HubServer<RoomHub>>) -> (HubClient, mpsc::Receiver<ClientEvent>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let server = Arc::clone(server);
        tokio::spawn(async move { server.serve_stream(server_side, None).await });
        HubClient::from_stream(client_side).await.unwrap()
    }

    #[tokio::test]
    async fn test_clients_on_two_servers_share_a_room() {
        let backplane = MemoryBackplane::new();
        let first = server(&backplane);
        let second = server(&backplane);

        let (alice, _alice_events) = connect(&first).await;
        let (bob, mut bob_events) = connect(&second).await;

        let count: u32 = alice.invoke(1, "G").await.unwrap();
        assert_eq!(count, 1);
        let count: u32 = bob.invoke(1, "G").await.unwrap();
        assert_eq!(count, 2);

        let () = alice
            .invoke(2, &("G".to_string(), "over the wire".to_string()))
            .await
            .unwrap();

        match tokio::time::timeout(WAIT, bob_events.recv()).await.unwrap() {
            Some(ClientEvent::Broadcast(message)) => {
                assert_eq!(message.method_id(), 50);
                let text: String = bob.serializer().decode(message.payload()).unwrap();
                assert_eq!(text, "over the wire");
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
        assert!(second.stats().remote_relays >= 1);
    }
}
