//! End-to-end behavior of the hub over in-process connections.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use huddle_core::{
    HistoryEntry, Hub, HubConfig, HubError, MembershipError, MemoryStore, MessageStore,
    PersistError, Session,
};
use huddle_protocol::{Body, Envelope};
use huddle_transport::{MemoryConnection, MemoryPeer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

async fn hub_with(store: Arc<MemoryStore>) -> Arc<Hub> {
    Hub::start(HubConfig::default(), store).await
}

fn connect(hub: &Hub, id: &str) -> (Arc<Session>, MemoryPeer) {
    let (conn, peer) = MemoryConnection::pair(id);
    let (sink, _source) = conn.into_parts();
    let session = hub.register(peer.id().clone(), Box::new(sink), None);
    (session, peer)
}

async fn joined(hub: &Hub, id: &str, name: &str, channel: &str) -> (Arc<Session>, MemoryPeer) {
    let (session, peer) = connect(hub, id);
    hub.dispatch(&session, Envelope::join(name, channel))
        .await
        .unwrap();
    (session, peer)
}

async fn next(peer: &mut MemoryPeer) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), peer.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("peer channel closed")
}

fn kinds(envelopes: &[Envelope]) -> Vec<&'static str> {
    envelopes.iter().map(Envelope::kind).collect()
}

#[tokio::test]
async fn test_broadcast_reaches_exactly_the_members() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    let (_carol, mut c) = joined(&hub, "c3", "carol", "random").await;
    a.drain();
    b.drain();
    c.drain();

    let report = hub
        .broadcaster()
        .broadcast_to_channel("general", &Envelope::chat("general", "x"), Some(alice.id()))
        .await;
    assert_eq!(report.delivered, 1);

    assert!(a.drain().is_empty());
    assert_eq!(kinds(&b.drain()), ["message"]);
    assert!(c.drain().is_empty());
}

#[tokio::test]
async fn test_chat_is_persisted_and_echoed_to_all() {
    let store = Arc::new(MemoryStore::new());
    let hub = hub_with(Arc::clone(&store)).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    a.drain();
    b.drain();

    let spoofed = Envelope::chat("general", "hello").with_username("mallory");
    hub.dispatch(&alice, spoofed).await.unwrap();

    for peer in [&mut a, &mut b] {
        let received = next(peer).await;
        assert_eq!(received.username, "alice");
        assert!(received.timestamp.is_some());
        assert!(matches!(received.body, Body::Chat { ref content, .. } if content == "hello"));
    }
    assert_eq!(store.message_count("general"), 1);
}

#[tokio::test]
async fn test_chat_requires_membership() {
    let store = Arc::new(MemoryStore::new());
    let hub = hub_with(Arc::clone(&store)).await;
    let (outsider, _o) = connect(&hub, "c1");
    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    b.drain();

    let result = hub
        .dispatch(&outsider, Envelope::chat("general", "hi"))
        .await;
    assert!(matches!(
        result,
        Err(HubError::Membership(MembershipError::NotMember(_)))
    ));
    assert!(!result.unwrap_err().is_fatal());
    assert_eq!(store.message_count("general"), 0);
}

#[tokio::test]
async fn test_media_frame_never_reaches_sender() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;

    // Alone in the channel: relayed to nobody
    hub.dispatch(&alice, Envelope::media_frame("general", "AAAA", Some(16_000)))
        .await
        .unwrap();
    assert_eq!(kinds(&a.drain()), ["user_list"]);

    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    a.drain();
    b.drain();

    hub.dispatch(&alice, Envelope::media_frame("general", "AAAA", Some(16_000)))
        .await
        .unwrap();
    assert!(a.drain().is_empty());
    let received = b.drain();
    assert_eq!(kinds(&received), ["media_frame"]);
    assert_eq!(received[0].username, "alice");
}

#[tokio::test]
async fn test_join_then_leave_restores_membership() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    let (bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    let general = hub.directory().get("general").unwrap();
    assert_eq!(general.lock().await.len(), 2);
    a.drain();
    b.drain();

    hub.dispatch(&bob, Envelope::leave("general")).await.unwrap();
    assert_eq!(general.lock().await.len(), 1);
    assert_eq!(kinds(&a.drain()), ["user_left"]);

    hub.dispatch(&alice, Envelope::chat("general", "still here?"))
        .await
        .unwrap();
    assert_eq!(kinds(&[next(&mut a).await]), ["message"]);
    assert!(b.drain().is_empty());

    // Leaving again is a no-op
    hub.dispatch(&bob, Envelope::leave("general")).await.unwrap();
    assert!(a.drain().is_empty());
}

#[tokio::test]
async fn test_history_replays_in_append_order() {
    let store = Arc::new(MemoryStore::new());
    let t1 = Utc::now();
    let t2 = t1 + ChronoDuration::seconds(5);
    store
        .append("general", &HistoryEntry::new("a", "hi", t1))
        .await
        .unwrap();
    store
        .append("general", &HistoryEntry::new("b", "yo", t2))
        .await
        .unwrap();

    let hub = hub_with(store).await;
    let (_carol, mut c) = joined(&hub, "c1", "carol", "general").await;

    let received = c.drain();
    assert_eq!(kinds(&received), ["user_list", "message", "message"]);
    let rows: Vec<_> = received[1..]
        .iter()
        .map(|e| match &e.body {
            Body::Chat { content, .. } => (e.username.as_str(), content.as_str(), e.timestamp),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(rows, [("a", "hi", Some(t1)), ("b", "yo", Some(t2))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_all_land() {
    const N: usize = 32;
    let hub = hub_with(Arc::new(MemoryStore::new())).await;

    let mut handles = Vec::new();
    let mut peers = Vec::new();
    for i in 0..N {
        let (session, peer) = connect(&hub, &format!("c{i}"));
        peers.push(peer);
        let hub = Arc::clone(&hub);
        handles.push(tokio::spawn(async move {
            hub.dispatch(&session, Envelope::join(format!("user{i}"), "fresh"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let channel = hub.directory().get("fresh").unwrap();
    assert_eq!(channel.lock().await.len(), N);
    assert_eq!(hub.stats().participant_count, N);

    // Every joiner saw itself in its own snapshot
    for peer in &mut peers {
        let received = peer.drain();
        assert!(matches!(&received[0].body, Body::UserList { data, .. } if !data.is_empty()));
    }
}

#[tokio::test]
async fn test_failing_recipient_is_isolated_and_removed_once() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    let (bob, b) = joined(&hub, "c2", "bob", "general").await;
    let (_carol, mut c) = joined(&hub, "c3", "carol", "general").await;
    a.drain();
    c.drain();

    b.fail_writes();
    hub.dispatch(&alice, Envelope::chat("general", "ping"))
        .await
        .unwrap();

    for peer in [&mut a, &mut c] {
        assert_eq!(next(peer).await.kind(), "message");
        let notice = next(peer).await;
        assert_eq!(notice.kind(), "user_left");
        assert_eq!(notice.username, "bob");
    }

    let general = hub.directory().get("general").unwrap();
    assert_eq!(general.lock().await.usernames(), ["alice", "carol"]);
    assert!(!bob.is_alive());

    // The receive loop's cleanup finds nothing left to announce
    assert!(hub.disconnect(bob.id()).await.is_empty());
    assert!(a.drain().is_empty());
    assert!(c.drain().is_empty());
}

#[tokio::test]
async fn test_joining_another_channel_leaves_the_first() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    a.drain();
    b.drain();

    hub.dispatch(&alice, Envelope::join("alice", "random"))
        .await
        .unwrap();

    let notice = b.drain();
    assert_eq!(kinds(&notice), ["user_left"]);
    assert_eq!(notice[0].username, "alice");
    assert_eq!(
        hub.directory().channel_of(alice.id()).as_deref(),
        Some("random")
    );
    assert_eq!(hub.stats().participant_count, 2);
}

#[tokio::test]
async fn test_disconnect_removes_everywhere() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, _a) = joined(&hub, "c1", "alice", "general").await;
    let (_bob, mut b) = joined(&hub, "c2", "bob", "general").await;
    b.drain();

    let left = hub.disconnect(alice.id()).await;
    assert_eq!(left, ["general"]);
    assert_eq!(kinds(&b.drain()), ["user_left"]);

    let stats = hub.stats();
    assert_eq!(stats.session_count, 1);
    assert_eq!(stats.participant_count, 1);
    assert!(!alice.is_alive());

    // Idempotent
    assert!(hub.disconnect(alice.id()).await.is_empty());
}

#[tokio::test]
async fn test_server_only_kinds_are_rejected() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, _a) = joined(&hub, "c1", "alice", "general").await;

    let result = hub
        .dispatch(&alice, Envelope::user_joined("general", "alice"))
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.kind(), "protocol");
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_channel_limit_applies_to_new_channels() {
    let config = HubConfig {
        max_channels: 2,
        ..HubConfig::default()
    };
    let hub = Hub::start(config, Arc::new(MemoryStore::new())).await;
    let (alice, _a) = joined(&hub, "c1", "alice", "second").await;

    let result = hub.dispatch(&alice, Envelope::join("alice", "third")).await;
    assert!(matches!(
        result,
        Err(HubError::Membership(MembershipError::MaxChannelsReached))
    ));
    // Still in the channel it had
    assert_eq!(
        hub.directory().channel_of(alice.id()).as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_shutdown_closes_chat_queue() {
    let hub = hub_with(Arc::new(MemoryStore::new())).await;
    let (alice, _a) = joined(&hub, "c1", "alice", "general").await;

    hub.shutdown().await;
    let result = hub.dispatch(&alice, Envelope::chat("general", "late")).await;
    assert!(matches!(result, Err(HubError::QueueClosed)));
    // The session is ended by shutdown itself, not by this error
    assert!(!result.unwrap_err().is_fatal());
    assert!(!alice.is_alive());
}

/// Memory store whose `append` stalls after writing until released.
struct StallingStore {
    inner: MemoryStore,
    appended: Notify,
    release: Notify,
}

impl StallingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            appended: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MessageStore for StallingStore {
    async fn ensure_channel(&self, channel_id: &str, name: &str) -> Result<(), PersistError> {
        self.inner.ensure_channel(channel_id, name).await
    }

    async fn append(&self, channel_id: &str, entry: &HistoryEntry) -> Result<(), PersistError> {
        self.inner.append(channel_id, entry).await?;
        self.appended.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn recent_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PersistError> {
        self.inner.recent_history(channel_id, limit).await
    }
}

#[tokio::test]
async fn test_join_during_persist_sees_message_once() {
    let store = Arc::new(StallingStore::new());
    let hub = Hub::start(HubConfig::default(), Arc::clone(&store) as Arc<dyn MessageStore>).await;
    let (alice, mut a) = joined(&hub, "c1", "alice", "general").await;
    a.drain();
    let (bob, mut b) = connect(&hub, "c2");

    hub.dispatch(&alice, Envelope::chat("general", "M")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), store.appended.notified())
        .await
        .expect("message never persisted");

    let join = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move { hub.dispatch(&bob, Envelope::join("bob", "general")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.release.notify_one();
    join.await.unwrap().unwrap();

    // Alice's copy proves the live delivery already happened
    loop {
        if next(&mut a).await.kind() == "message" {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let copies = b
        .drain()
        .into_iter()
        .filter(|e| matches!(e.body, Body::Chat { ref content, .. } if content == "M"))
        .count();
    assert_eq!(copies, 1);
}
