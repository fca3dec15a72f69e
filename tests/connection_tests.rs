//! Tests for the connection manager: identity transitions, teardown before
//! re-create, supervised reconnect, and end-to-end routing into a chat session.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use justjio_client::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

fn alice() -> Identity {
    Identity::new("1", "alice")
}

fn bob() -> Identity {
    Identity::new("2", "bob")
}

fn manager(policy: ReconnectPolicy) -> (ConnectionManager, MemoryConnector) {
    let connector = MemoryConnector::new();
    let config = ClientConfig::default().with_ws_url("ws://chat.test/ws").with_reconnect(policy);
    let manager = ConnectionManager::new(config, Arc::new(connector.clone()), Arc::new(MemoryToken::new("tok")));
    (manager, connector)
}

async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Identity transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_none_to_user_to_none() {
    let (manager, connector) = manager(ReconnectPolicy::default());

    manager.set_identity(None).await.unwrap();
    assert_eq!(connector.attempts(), 0);

    manager.set_identity(Some(alice())).await.unwrap();
    assert_eq!(connector.attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Open);

    let mut events = manager.events();
    manager.set_identity(None).await.unwrap();
    assert_eq!(connector.attempts(), 1);
    assert!(connector.latest_peer().unwrap().closed_by_client());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed { reason: CloseReason::Client });
}

#[test]
fn test_logged_out_never_connects() {
    tokio_test::block_on(async {
        let (manager, connector) = manager(ReconnectPolicy::poll(Duration::from_millis(10)));
        let supervisor = manager.spawn_supervisor();
        manager.set_identity(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(connector.attempts(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        supervisor.abort();
    });
}

#[tokio::test]
async fn test_identity_change_closes_old_socket_first() {
    let (manager, connector) = manager(ReconnectPolicy::default());
    manager.set_identity(Some(alice())).await.unwrap();
    let first = connector.latest_peer().unwrap();

    manager.set_identity(Some(bob())).await.unwrap();

    assert_eq!(connector.connections(), 2);
    assert!(first.closed_by_client());
    let second = connector.latest_peer().unwrap();
    assert!(!second.closed_by_client());
    assert_eq!(manager.identity().await, Some(bob()));
}

#[tokio::test]
async fn test_setting_same_identity_is_noop() {
    let (manager, connector) = manager(ReconnectPolicy::default());
    manager.set_identity(Some(alice())).await.unwrap();
    manager.set_identity(Some(alice())).await.unwrap();
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_token_is_read_at_connect_time() {
    let connector = MemoryConnector::new();
    let token = MemoryToken::new("first");
    let manager = ConnectionManager::new(
        ClientConfig::default().with_ws_url("ws://chat.test/ws"),
        Arc::new(connector.clone()),
        Arc::new(token.clone()),
    );
    manager.connect(alice()).await.unwrap();
    token.set(Some("second".into()));
    manager.connect(bob()).await.unwrap();

    let urls: Vec<String> = connector.peers().iter().map(|p| p.url().to_string()).collect();
    assert_eq!(urls, vec!["ws://chat.test/ws?token=first", "ws://chat.test/ws?token=second"]);
}

/// Dials through a memory connector after a fixed delay.
struct SlowConnector {
    inner: MemoryConnector,
    delay: Duration,
}

impl Connector for SlowConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn Transport>>> {
        let inner = self.inner.clone();
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            inner.connect(url).await
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_slow_dial_abandons_it() {
    let memory = MemoryConnector::new();
    let slow = SlowConnector { inner: memory.clone(), delay: Duration::from_secs(3) };
    let manager = ConnectionManager::new(
        ClientConfig::default().with_ws_url("ws://chat.test/ws"),
        Arc::new(slow),
        Arc::new(MemoryToken::new("tok")),
    );
    let mut events = manager.events();

    let dialing = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(alice()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let logout_started = tokio::time::Instant::now();
    manager.set_identity(None).await.unwrap();
    assert!(logout_started.elapsed() < Duration::from_secs(1), "took {:?}", logout_started.elapsed());

    assert!(matches!(dialing.await.unwrap(), Err(ClientError::ConnectCancelled)));
    assert_eq!(memory.attempts(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.identity().await, None);
    assert!(events.try_recv().is_err());

    // A fresh login afterwards is not affected.
    manager.connect(bob()).await.unwrap();
    assert_eq!(memory.connections(), 1);
    assert_eq!(manager.state(), ConnectionState::Open);
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnects_within_one_default_poll_interval() {
    let (manager, connector) = manager(ReconnectPolicy::default());
    let supervisor = manager.spawn_supervisor();
    manager.connect(alice()).await.unwrap();

    let dropped_at = tokio::time::Instant::now();
    connector.latest_peer().unwrap().disconnect();

    let mut reconnected = false;
    for _ in 0..120 {
        if connector.connections() == 2 {
            reconnected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(reconnected);
    assert!(dropped_at.elapsed() <= Duration::from_millis(5_100), "took {:?}", dropped_at.elapsed());
    assert_eq!(manager.state(), ConnectionState::Open);

    manager.shutdown().await;
    supervisor.await.unwrap();
}

#[tokio::test]
async fn test_backoff_reports_lost_then_recovers_on_connect() {
    let policy = ReconnectPolicy::backoff(Duration::from_millis(5), Duration::from_millis(10), 2);
    let (manager, connector) = manager(policy);
    let supervisor = manager.spawn_supervisor();
    manager.connect(alice()).await.unwrap();

    connector.refuse_all(true);
    connector.latest_peer().unwrap().disconnect();
    assert!(wait_until(|| manager.state() == ConnectionState::Lost).await);

    connector.refuse_all(false);
    manager.connect(alice()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Open);
    supervisor.abort();
}

// ---------------------------------------------------------------------------
// End to end: socket → router → chat session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct History {
    page_one: Mutex<Vec<Message>>,
}

impl MessageSource for History {
    fn fetch_page(&self, _room_id: RoomId, page: u32) -> BoxFuture<'_, Result<MessagePage>> {
        let messages = self.page_one.lock().unwrap().clone();
        async move { Ok(MessagePage { messages, page, page_count: 1 }) }.boxed()
    }

    fn send_message(&self, _room_id: RoomId, _content: String) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }
}

fn stored(id: u64, content: &str, sent_at: &str) -> Message {
    Message {
        id: Some(id),
        room_id: "r1".into(),
        sender_id: "2".into(),
        sender_name: "bob".into(),
        content: content.into(),
        sent_at: sent_at.parse().unwrap(),
    }
}

fn live_frame(content: &str, sent_at: &str) -> String {
    json!({
        "type": "CREATE_MESSAGE",
        "data": {"roomId": "r1", "senderId": "2", "senderName": "bob", "content": content, "sentAt": sent_at}
    })
    .to_string()
}

#[tokio::test]
async fn test_live_frames_reach_open_chat_session() {
    let (manager, connector) = manager(ReconnectPolicy::default());
    let history = Arc::new(History::default());
    *history.page_one.lock().unwrap() = vec![stored(1, "first", "2024-05-01T10:00:00Z")];

    let (session, mut events) = ChatSession::open(manager.registry(), history, "r1").await;
    assert!(matches!(events.recv().await, Some(ChatEvent::PageLoaded { page: 1, .. })));
    manager.connect(alice()).await.unwrap();

    connector.latest_peer().unwrap().send_text(live_frame("second", "2024-05-01T10:05:00Z"));
    assert!(matches!(events.recv().await, Some(ChatEvent::Live(m)) if m.content == "second"));

    let contents: Vec<String> = session.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["first", "second"]);

    session.close();
    connector.latest_peer().unwrap().send_text(live_frame("after close", "2024-05-01T10:06:00Z"));
    assert!(wait_until(|| manager.router_stats().frames_dropped == 1).await);
    assert_eq!(session.messages().len(), 2);
}

#[tokio::test]
async fn test_reconnect_resync_backfills_missed_messages() {
    let (manager, connector) = manager(ReconnectPolicy::poll(Duration::from_millis(20)));
    let supervisor = manager.spawn_supervisor();
    let history = Arc::new(History::default());
    *history.page_one.lock().unwrap() = vec![stored(1, "first", "2024-05-01T10:00:00Z")];

    let (session, mut events) =
        ChatSession::open(manager.registry(), Arc::clone(&history) as Arc<dyn MessageSource>, "r1").await;
    let _ = events.recv().await;
    let session = Arc::new(session);
    manager.connect(alice()).await.unwrap();
    let follower = session.follow_reconnects(manager.events());

    // Delivered live, then the socket drops and one message is missed.
    connector.latest_peer().unwrap().send_text(live_frame("second", "2024-05-01T10:05:00Z"));
    assert!(matches!(events.recv().await, Some(ChatEvent::Live(_))));
    connector.latest_peer().unwrap().disconnect();
    *history.page_one.lock().unwrap() = vec![
        stored(3, "missed", "2024-05-01T10:07:00Z"),
        stored(2, "second", "2024-05-01T10:05:00Z"),
        stored(1, "first", "2024-05-01T10:00:00Z"),
    ];

    assert!(wait_until(|| session.messages().len() == 3).await);
    let ids: Vec<Option<u64>> = session.messages().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);

    session.close();
    follower.await.unwrap();
    manager.shutdown().await;
    supervisor.await.unwrap();
}
