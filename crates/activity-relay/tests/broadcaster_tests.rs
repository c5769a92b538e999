//! Broadcaster and dispatcher scenarios against in-memory stores

use activity_relay::{
    async_trait,
    protocol::{
        ReaderEventRequest, RecentEventsRequest, RoomRequest, SubscribeRequest, UnsubscribeRequest,
    },
    session::{ActiveSession, CleanupReport, ConsultantSubscription, DashboardBucket, OnlineReader},
    target_rooms, AuthGate, ClientMessage, Handshake, Connection, Dispatcher, DurableEventStore, Error,
    EventBroadcaster, EventQueue, Identity, MemoryEventStore, MemoryPresenceStore, PresenceStore,
    RateLimitConfig, RealtimeEvent, Result, Role, RoomDelivery, RoomRegistry, RoomRelay,
    ServerMessage,
};
use activity_relay::CancellationToken;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

const INSTANCE: &str = "test-instance";

struct Harness {
    broadcaster: EventBroadcaster,
    presence: MemoryPresenceStore,
    store: MemoryEventStore,
}

fn harness() -> Harness {
    let presence = MemoryPresenceStore::new();
    let store = MemoryEventStore::default();
    let broadcaster = EventBroadcaster::new(
        RoomRegistry::new(INSTANCE),
        Arc::new(presence.clone()),
        Arc::new(store.clone()),
    );
    Harness {
        broadcaster,
        presence,
        store,
    }
}

fn identity(id: &str, role: Role) -> Identity {
    Identity::new(id, format!("{}@example.com", id), role)
}

async fn connect(broadcaster: &EventBroadcaster, id: &str, role: Role) -> (Connection, Receiver<ServerMessage>) {
    let (conn, rx) = Connection::new(
        identity(id, role),
        INSTANCE.to_string(),
        Some("10.0.0.7".to_string()),
        Some("Mozilla/5.0 Firefox/126".to_string()),
    );
    broadcaster.handle_user_connection(conn.clone()).await;
    (conn, rx)
}

fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn activities(messages: &[ServerMessage]) -> Vec<&activity_relay::ActivityPayload> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ReaderActivity(payload) => Some(payload),
            _ => None,
        })
        .collect()
}

fn snapshots(messages: &[ServerMessage]) -> Vec<&activity_relay::OnlineReadersSnapshot> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::OnlineReaders(snapshot) => Some(snapshot),
            _ => None,
        })
        .collect()
}

fn error_codes(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::EventError(e) => e.code.clone(),
            _ => None,
        })
        .collect()
}

// ============== Fan-out Tests ==============

#[tokio::test]
async fn test_every_target_room_receives_exactly_one_activity() {
    let h = harness();
    let (reader, mut reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    let (reader_tablet, mut tablet_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    let (consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    let (topic_admin, mut topic_rx) = connect(&h.broadcaster, "a1", Role::Admin).await;
    let (_bystander, mut bystander_rx) = connect(&h.broadcaster, "a2", Role::Admin).await;
    h.broadcaster.join_room(&topic_admin.id, "event:PAGE_SYNC").await;
    // Overlapping memberships still yield one delivery
    h.broadcaster.join_room(&consultant.id, "event:PAGE_SYNC").await;

    for rx in [&mut reader_rx, &mut tablet_rx, &mut consultant_rx, &mut topic_rx, &mut bystander_rx] {
        drain(rx);
    }

    let event = RealtimeEvent::new("r1", "PAGE_SYNC", json!({"page": 5}), reader.session_id());
    let delivered = h.broadcaster.broadcast_event(&event).await.unwrap();
    assert_eq!(delivered, 4);

    for rx in [&mut reader_rx, &mut tablet_rx, &mut consultant_rx, &mut topic_rx] {
        let messages = drain(rx);
        let received = activities(&messages);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].user_id, "r1");
        assert_eq!(received[0].event_type.as_str(), "PAGE_SYNC");
        assert_eq!(received[0].data, json!({"page": 5}));
        assert_eq!(received[0].timestamp, event.timestamp);
    }
    assert!(activities(&drain(&mut bystander_rx)).is_empty());
    assert_ne!(reader.id, reader_tablet.id);
}

#[tokio::test]
async fn test_event_is_persisted_before_delivery() {
    let h = harness();
    let event = RealtimeEvent::new("r1", "NOTE_CREATED", json!({"content": "margin note"}), "s1");
    h.broadcaster.broadcast_event(&event).await.unwrap();

    let stored = h.store.get_recent_events(10, Some("r1")).await.unwrap();
    assert_eq!(stored, vec![event]);
}

#[tokio::test]
async fn test_support_room_gets_help_requests_only() {
    let h = harness();
    let (support, mut support_rx) = connect(&h.broadcaster, "a1", Role::Admin).await;
    h.broadcaster.join_room(&support.id, "support").await;
    let (_consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut consultant_rx);

    let help = RealtimeEvent::new("r1", "HELP_REQUEST", json!({"type": "navigation"}), "s1");
    h.broadcaster.broadcast_event(&help).await.unwrap();
    let page = RealtimeEvent::new("r1", "PAGE_SYNC", json!({}), "s1");
    h.broadcaster.broadcast_event(&page).await.unwrap();

    let support_seen = drain(&mut support_rx);
    let support_seen = activities(&support_seen);
    assert_eq!(support_seen.len(), 1);
    assert_eq!(support_seen[0].event_type.as_str(), "HELP_REQUEST");

    // Consultant sits in both consultants and support
    assert_eq!(activities(&drain(&mut consultant_rx)).len(), 2);
}

#[test]
fn test_target_rooms() {
    let event = RealtimeEvent::new("r1", "FEEDBACK_SUBMISSION", json!({"rating": 4}), "s1");
    assert_eq!(
        target_rooms(&event),
        vec!["consultants", "user:r1", "event:FEEDBACK_SUBMISSION", "support"]
    );

    let event = RealtimeEvent::new("r1", "AI_QUERY", json!({"query": "why"}), "s1");
    assert_eq!(target_rooms(&event), vec!["consultants", "user:r1", "event:AI_QUERY"]);
}

#[tokio::test]
async fn test_topic_subscription_overlaps_blanket_room() {
    let h = harness();
    let (consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    let (reader, _reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;

    let resolved = h
        .broadcaster
        .subscribe(&consultant.id, "c1", &["HELP_REQUEST".to_string()])
        .await;
    assert_eq!(resolved, vec!["HELP_REQUEST"]);
    drain(&mut consultant_rx);

    let event = RealtimeEvent::new("r1", "PAGE_SYNC", json!({"page": 5}), reader.session_id());
    h.broadcaster.broadcast_event(&event).await.unwrap();

    let rooms = h.broadcaster.rooms();
    assert!(!rooms.is_member(&consultant.id, "event:PAGE_SYNC"));
    assert!(rooms.is_member(&consultant.id, "event:HELP_REQUEST"));
    assert!(rooms.is_member(&consultant.id, "consultants"));

    let messages = drain(&mut consultant_rx);
    let received = activities(&messages);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event_type.as_str(), "PAGE_SYNC");
}

#[tokio::test]
async fn test_stalled_consultant_does_not_block_fan_out() {
    let h = harness();
    // Never read from
    let (_stalled, mut stalled_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    let (_live, mut live_rx) = connect(&h.broadcaster, "c2", Role::Consultant).await;
    drain(&mut live_rx);

    let mut received = 0;
    for page in 0..400 {
        let event = RealtimeEvent::new("r1", "PAGE_SYNC", json!({"page": page}), "s1");
        let delivered = tokio::time::timeout(Duration::from_secs(2), h.broadcaster.broadcast_event(&event))
            .await
            .expect("broadcast blocked on a full connection")
            .unwrap();
        assert!(delivered >= 1);
        received += activities(&drain(&mut live_rx)).len();
    }

    assert_eq!(received, 400);
    assert_eq!(h.store.event_count().await, 400);
    // Snapshot on connect plus activities up to the buffer size
    assert_eq!(drain(&mut stalled_rx).len(), 256);
}

// ============== Presence Tests ==============

#[tokio::test]
async fn test_login_logout_presence_idempotent() {
    let h = harness();

    for _ in 0..2 {
        let login = RealtimeEvent::new("u1", "LOGIN", json!({}), "s1");
        h.broadcaster.broadcast_event(&login).await.unwrap();
        assert_eq!(h.presence.get_online_users().await.unwrap(), vec!["u1"]);
    }

    for _ in 0..2 {
        let logout = RealtimeEvent::new("u1", "LOGOUT", json!({}), "s1");
        h.broadcaster.broadcast_event(&logout).await.unwrap();
        assert!(h.presence.get_online_users().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_login_publishes_snapshot_to_consultants() {
    let h = harness();
    let (_consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut consultant_rx);

    let login = RealtimeEvent::new("r9", "LOGIN", json!({"device": "tablet"}), "s1");
    h.broadcaster.broadcast_event(&login).await.unwrap();

    let messages = drain(&mut consultant_rx);
    let snapshots = snapshots(&messages);
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].readers.iter().any(|r| r.user_id == "r9"));
    assert_eq!(snapshots[0].count, snapshots[0].readers.len());
}

#[tokio::test]
async fn test_joining_consultants_sends_snapshot_immediately() {
    let h = harness();
    let (_reader, _reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    let (admin, mut admin_rx) = connect(&h.broadcaster, "a1", Role::Admin).await;
    drain(&mut admin_rx);

    assert!(h.broadcaster.join_room(&admin.id, "consultants").await);

    let messages = drain(&mut admin_rx);
    let snapshots = snapshots(&messages);
    assert_eq!(snapshots.len(), 1);
    let users: Vec<&str> = snapshots[0].readers.iter().map(|r| r.user_id.as_str()).collect();
    assert!(users.contains(&"r1"));
    assert!(users.contains(&"a1"));
    assert_eq!(snapshots[0].count, 2);
}

#[tokio::test]
async fn test_consultant_connect_auto_joins() {
    let h = harness();
    let (consultant, mut rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;

    let rooms = h.broadcaster.rooms();
    assert!(rooms.is_member(&consultant.id, "consultants"));
    assert!(rooms.is_member(&consultant.id, "support"));
    assert_eq!(snapshots(&drain(&mut rx)).len(), 1);
    assert!(h.presence.is_online("c1"));
}

#[tokio::test]
async fn test_reader_connect_and_disconnect_republish() {
    let h = harness();
    let (_consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut consultant_rx);

    let (reader, _reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    assert!(h.broadcaster.rooms().is_member(&reader.id, "user:r1"));
    let on_connect = drain(&mut consultant_rx);
    assert!(snapshots(&on_connect)[0].readers.iter().any(|r| r.user_id == "r1"));

    h.broadcaster.handle_user_disconnection(&reader.id).await;
    let on_disconnect = drain(&mut consultant_rx);
    let snapshot = snapshots(&on_disconnect);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].readers.iter().all(|r| r.user_id != "r1"));
    assert!(!h.presence.is_online("r1"));
}

#[tokio::test]
async fn test_snapshot_prefers_store_view() {
    let h = harness();
    let (reader, _reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;

    let mut metadata = serde_json::Map::new();
    metadata.insert("firstName".to_string(), json!("Ada"));
    let event = RealtimeEvent::new("r1", "PAGE_SYNC", json!({"bookId": "b1", "pageNumber": 9}), reader.session_id())
        .with_metadata(metadata);
    h.broadcaster.broadcast_event(&event).await.unwrap();
    h.broadcaster.record_session_activity(&reader).await;

    let snapshot = h.broadcaster.online_readers().await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.readers[0].first_name.as_deref(), Some("Ada"));
    assert_eq!(snapshot.readers[0].current_book.as_deref(), Some("b1"));
    assert_eq!(snapshot.readers[0].current_page, Some(9));
}

// ============== Room Lifecycle Tests ==============

#[tokio::test]
async fn test_disconnect_leaves_every_room_once() {
    let h = harness();
    let (leaving, _rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    let (_staying, _rx2) = connect(&h.broadcaster, "c2", Role::Consultant).await;
    h.broadcaster.join_room(&leaving.id, "event:HELP_REQUEST").await;

    let before: Vec<(String, usize)> = ["consultants", "support", "event:HELP_REQUEST"]
        .iter()
        .map(|room| (room.to_string(), h.broadcaster.get_room_occupants(room)))
        .collect();

    let mut left = h.broadcaster.handle_user_disconnection(&leaving.id).await;
    left.sort();
    assert_eq!(left, vec!["consultants", "event:HELP_REQUEST", "support"]);

    for (room, count) in before {
        assert_eq!(h.broadcaster.get_room_occupants(&room), count - 1, "{}", room);
    }
    assert!(!h.broadcaster.get_all_rooms().contains(&"event:HELP_REQUEST".to_string()));

    // A second disconnect is a no-op
    assert!(h.broadcaster.handle_user_disconnection(&leaving.id).await.is_empty());
    assert_eq!(h.broadcaster.get_room_occupants("consultants"), 1);
}

#[tokio::test]
async fn test_leave_room_keeps_presence() {
    let h = harness();
    let (consultant, _rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;

    assert!(h.broadcaster.leave_room(&consultant.id, "consultants"));
    assert!(h.presence.is_online("c1"));
    assert_eq!(h.broadcaster.get_room_occupants("consultants"), 0);
}

#[tokio::test]
async fn test_sweep_dead_connections() {
    let h = harness();
    let (reader, reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drop(reader_rx);

    assert_eq!(h.broadcaster.sweep_dead_connections().await, 1);
    assert!(h.broadcaster.rooms().connection(&reader.id).is_none());
    assert!(!h.presence.is_online("r1"));
}

#[tokio::test]
async fn test_disconnect_deactivates_session() {
    let h = harness();
    let (reader, _rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    h.broadcaster.record_session_activity(&reader).await;

    let sessions = h.store.get_active_sessions(Some("r1")).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, reader.id);
    assert_eq!(sessions[0].ip_address.as_deref(), Some("10.0.0.7"));

    h.broadcaster.handle_user_disconnection(&reader.id).await;
    assert!(h.store.get_active_sessions(Some("r1")).await.unwrap().is_empty());
}

// ============== Subscription Tests ==============

#[tokio::test]
async fn test_per_topic_unsubscribe() {
    let h = harness();
    let (consultant, _rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    h.broadcaster
        .subscribe(
            &consultant.id,
            "c1",
            &["HELP_REQUEST".to_string(), "PAGE_SYNC".to_string(), "HELP_REQUEST".to_string()],
        )
        .await;

    let dropped = h
        .broadcaster
        .unsubscribe(&consultant.id, "c1", Some(&["PAGE_SYNC".to_string()]))
        .await;
    assert_eq!(dropped, vec!["PAGE_SYNC"]);

    let rooms = h.broadcaster.rooms();
    assert!(rooms.is_member(&consultant.id, "consultants"));
    assert!(rooms.is_member(&consultant.id, "event:HELP_REQUEST"));
    assert!(!rooms.is_member(&consultant.id, "event:PAGE_SYNC"));

    let subscriptions = h.store.get_consultant_subscriptions("c1").await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(
        subscriptions[0].event_types.iter().collect::<Vec<_>>(),
        vec!["HELP_REQUEST"]
    );
}

#[tokio::test]
async fn test_coarse_unsubscribe_leaves_consultants() {
    let h = harness();
    let (consultant, _rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    h.broadcaster
        .subscribe(&consultant.id, "c1", &["HELP_REQUEST".to_string()])
        .await;

    h.broadcaster.unsubscribe(&consultant.id, "c1", None).await;

    let rooms = h.broadcaster.rooms();
    assert!(!rooms.is_member(&consultant.id, "consultants"));
    // Topic rooms are left alone
    assert!(rooms.is_member(&consultant.id, "event:HELP_REQUEST"));
    assert!(h.store.get_consultant_subscriptions("c1").await.unwrap().is_empty());
}

// ============== Relay Tests ==============

#[derive(Default)]
struct RecordingRelay {
    published: Arc<Mutex<Vec<RoomDelivery>>>,
}

#[async_trait]
impl RoomRelay for RecordingRelay {
    async fn publish(&self, delivery: &RoomDelivery) -> Result<()> {
        self.published.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn start(&self, _registry: RoomRegistry, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Recording"
    }
}

#[tokio::test]
async fn test_deliveries_are_relayed() {
    let h = harness();
    let relay = RecordingRelay::default();
    let published = relay.published.clone();
    let broadcaster = h.broadcaster.with_relay(Arc::new(relay));

    let event = RealtimeEvent::new("r1", "QUIZ_ATTEMPT", json!({"score": 8, "total": 10}), "s1");
    broadcaster.broadcast_event(&event).await.unwrap();

    let published = published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].origin, INSTANCE);
    assert_eq!(published[0].rooms, target_rooms(&event));
    assert!(matches!(published[0].message, ServerMessage::ReaderActivity(_)));
}

// ============== Dispatcher Tests ==============

#[derive(Default)]
struct FailingStore {
    inner: MemoryEventStore,
}

#[async_trait]
impl DurableEventStore for FailingStore {
    async fn store_event(&self, _event: &RealtimeEvent) -> Result<()> {
        Err(Error::Persistence("connection reset".to_string()))
    }

    async fn get_recent_events(&self, limit: usize, user_id: Option<&str>) -> Result<Vec<RealtimeEvent>> {
        self.inner.get_recent_events(limit, user_id).await
    }

    async fn get_online_users(&self) -> Result<Vec<OnlineReader>> {
        self.inner.get_online_users().await
    }

    async fn update_active_session(&self, session: &ActiveSession) -> Result<()> {
        self.inner.update_active_session(session).await
    }

    async fn deactivate_session(&self, session_id: &str) -> Result<()> {
        self.inner.deactivate_session(session_id).await
    }

    async fn get_active_sessions(&self, user_id: Option<&str>) -> Result<Vec<ActiveSession>> {
        self.inner.get_active_sessions(user_id).await
    }

    async fn store_subscription(&self, subscription: &ConsultantSubscription) -> Result<()> {
        self.inner.store_subscription(subscription).await
    }

    async fn get_consultant_subscriptions(&self, consultant_id: &str) -> Result<Vec<ConsultantSubscription>> {
        self.inner.get_consultant_subscriptions(consultant_id).await
    }

    async fn get_dashboard_stats(&self) -> Result<Vec<DashboardBucket>> {
        self.inner.get_dashboard_stats().await
    }

    async fn reap_idle_sessions(&self, max_idle: Duration) -> Result<usize> {
        self.inner.reap_idle_sessions(max_idle).await
    }

    async fn cleanup_old_sessions(&self, retention: Duration) -> Result<CleanupReport> {
        self.inner.cleanup_old_sessions(retention).await
    }

    async fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "Failing"
    }
}

fn dispatcher_with(broadcaster: EventBroadcaster, rate_limit: RateLimitConfig) -> Dispatcher {
    Dispatcher::new(
        AuthGate::new("test-secret").with_rate_limit(rate_limit),
        broadcaster,
        EventQueue::default(),
    )
}

fn dispatcher(h: &Harness) -> Dispatcher {
    dispatcher_with(h.broadcaster.clone(), RateLimitConfig::default())
}

fn reader_event(event_type: &str, data: serde_json::Value) -> ClientMessage {
    ClientMessage::ReaderEvent(ReaderEventRequest {
        event_type: event_type.to_string(),
        data,
    })
}

#[tokio::test]
async fn test_reader_event_is_queued_then_broadcast() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (reader, mut reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    let (_consultant, mut consultant_rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut reader_rx);
    drain(&mut consultant_rx);

    dispatcher
        .handle_message(&reader, reader_event("DEFINITION_LOOKUP", json!({"word": "liminal"})))
        .await;

    let acks = drain(&mut reader_rx);
    let event_id = match &acks[..] {
        [ServerMessage::ReaderEventReceived(ack)] => {
            assert_eq!(ack.message, "Event received and queued");
            ack.event_id.clone()
        }
        other => panic!("unexpected replies: {:?}", other),
    };
    assert!(activities(&drain(&mut consultant_rx)).is_empty());
    assert_eq!(dispatcher.queue().len(), 1);

    dispatcher.queue().process_pending(&dispatcher.queue_handler()).await;

    let delivered = drain(&mut consultant_rx);
    assert_eq!(activities(&delivered).len(), 1);

    let stored = h.store.get_recent_events(1, Some("r1")).await.unwrap();
    assert_eq!(stored[0].id, event_id);
    assert_eq!(stored[0].session_id, reader.id);
    assert_eq!(stored[0].metadata_str("email"), Some("r1@example.com"));
    assert_eq!(stored[0].metadata_str("role"), Some("reader"));
    assert_eq!(stored[0].metadata_str("instanceId"), Some(INSTANCE));
    assert_eq!(h.store.get_active_sessions(Some("r1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_persistence_failure_reaches_sender_and_nothing_is_delivered() {
    let presence = MemoryPresenceStore::new();
    let broadcaster = EventBroadcaster::new(
        RoomRegistry::new(INSTANCE),
        Arc::new(presence),
        Arc::new(FailingStore::default()),
    );
    let dispatcher = dispatcher_with(broadcaster.clone(), RateLimitConfig::default());
    let (reader, mut reader_rx) = connect(&broadcaster, "r1", Role::Reader).await;
    let (_consultant, mut consultant_rx) = connect(&broadcaster, "c1", Role::Consultant).await;
    drain(&mut reader_rx);
    drain(&mut consultant_rx);

    dispatcher
        .handle_message(&reader, reader_event("PAGE_SYNC", json!({"page": 5})))
        .await;
    drain(&mut reader_rx);
    dispatcher.queue().process_pending(&dispatcher.queue_handler()).await;

    assert_eq!(error_codes(&drain(&mut reader_rx)), vec!["PERSISTENCE_ERROR"]);
    assert!(activities(&drain(&mut consultant_rx)).is_empty());
    assert_eq!(dispatcher.queue().dead_letters().len(), 1);
    assert!(broadcaster.rooms().connection(&reader.id).is_some());
}

struct FailingPresence;

#[async_trait]
impl PresenceStore for FailingPresence {
    async fn set_user_online(&self, _user_id: &str, _online: bool) -> Result<()> {
        Err(Error::Presence("presence backend down".to_string()))
    }

    async fn get_online_users(&self) -> Result<Vec<String>> {
        Err(Error::Presence("presence backend down".to_string()))
    }

    async fn get_user_last_seen(&self, _user_id: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Err(Error::Presence("presence backend down".to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "FailingPresence"
    }
}

#[tokio::test]
async fn test_presence_failure_keeps_fan_out_running() {
    let broadcaster = EventBroadcaster::new(
        RoomRegistry::new(INSTANCE),
        Arc::new(FailingPresence),
        Arc::new(MemoryEventStore::default()),
    );
    let (consultant, mut consultant_rx) = connect(&broadcaster, "c1", Role::Consultant).await;
    let (reader, mut reader_rx) = connect(&broadcaster, "r1", Role::Reader).await;
    let (admin, mut admin_rx) = connect(&broadcaster, "a1", Role::Admin).await;

    let rooms = broadcaster.rooms();
    assert!(rooms.is_member(&consultant.id, "consultants"));
    assert!(rooms.is_member(&reader.id, "user:r1"));
    assert!(snapshots(&drain(&mut consultant_rx)).is_empty());
    drain(&mut reader_rx);

    assert!(broadcaster.join_room(&admin.id, "consultants").await);
    assert!(snapshots(&drain(&mut admin_rx)).is_empty());

    let login = RealtimeEvent::new("r1", "LOGIN", json!({}), reader.session_id());
    assert_eq!(broadcaster.broadcast_event(&login).await.unwrap(), 3);

    let messages = drain(&mut consultant_rx);
    assert_eq!(activities(&messages).len(), 1);
    assert!(snapshots(&messages).is_empty());
    assert_eq!(activities(&drain(&mut admin_rx)).len(), 1);
    assert_eq!(activities(&drain(&mut reader_rx)).len(), 1);

    let left = broadcaster.handle_user_disconnection(&reader.id).await;
    assert_eq!(left, vec!["user:r1".to_string()]);
    assert!(rooms.connection(&reader.id).is_none());
}

#[tokio::test]
async fn test_error_rate_never_exceeds_requests() {
    let broadcaster = EventBroadcaster::new(
        RoomRegistry::new(INSTANCE),
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(FailingStore::default()),
    );
    let dispatcher = dispatcher_with(broadcaster.clone(), RateLimitConfig::default());

    assert!(dispatcher.authenticate(&Handshake::default()).is_err());
    assert_eq!(dispatcher.monitoring().error_rate(), 100.0);

    let (reader, _reader_rx) = connect(&broadcaster, "r1", Role::Reader).await;
    dispatcher
        .handle_message(&reader, reader_event("PAGE_SYNC", json!({"page": 5})))
        .await;
    dispatcher.queue().process_pending(&dispatcher.queue_handler()).await;

    let stats = dispatcher.monitoring().get_stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.error_count, 2);
    assert!(dispatcher.monitoring().error_rate() <= 100.0);
}

#[tokio::test]
async fn test_reader_cannot_use_consultant_actions() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (reader, mut reader_rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drain(&mut reader_rx);

    dispatcher
        .handle_message(
            &reader,
            ClientMessage::SubscribeConsultant(SubscribeRequest {
                consultant_id: "r1".to_string(),
                event_types: vec!["PAGE_SYNC".to_string()],
            }),
        )
        .await;
    dispatcher.handle_message(&reader, ClientMessage::GetOnlineReaders).await;

    assert_eq!(
        error_codes(&drain(&mut reader_rx)),
        vec!["AUTHORIZATION_ERROR", "AUTHORIZATION_ERROR"]
    );
    assert!(!h.broadcaster.rooms().is_member(&reader.id, "consultants"));
    assert!(h.broadcaster.rooms().connection(&reader.id).is_some());
}

#[tokio::test]
async fn test_consultant_cannot_emit_reader_events() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (consultant, mut rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut rx);

    dispatcher
        .handle_message(&consultant, reader_event("PAGE_SYNC", json!({})))
        .await;

    assert_eq!(error_codes(&drain(&mut rx)), vec!["AUTHORIZATION_ERROR"]);
    assert!(dispatcher.queue().is_empty());
}

#[tokio::test]
async fn test_empty_event_type_rejected() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (reader, mut rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drain(&mut rx);

    dispatcher.handle_message(&reader, reader_event("  ", json!({}))).await;
    assert_eq!(error_codes(&drain(&mut rx)), vec!["INVALID_MESSAGE"]);
}

#[tokio::test]
async fn test_subscription_must_be_own() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (consultant, mut rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut rx);

    dispatcher
        .handle_message(
            &consultant,
            ClientMessage::UnsubscribeConsultant(UnsubscribeRequest {
                consultant_id: "c2".to_string(),
                event_types: None,
            }),
        )
        .await;
    assert_eq!(error_codes(&drain(&mut rx)), vec!["AUTHORIZATION_ERROR"]);
    assert!(h.broadcaster.rooms().is_member(&consultant.id, "consultants"));

    dispatcher
        .handle_message(
            &consultant,
            ClientMessage::SubscribeConsultant(SubscribeRequest {
                consultant_id: "c1".to_string(),
                event_types: vec!["HELP_REQUEST".to_string()],
            }),
        )
        .await;
    let replies = drain(&mut rx);
    assert!(replies.iter().any(|m| matches!(
        m,
        ServerMessage::SubscribeConsultantSuccess(ack) if ack.event_types == vec!["HELP_REQUEST".to_string()]
    )));
}

#[tokio::test]
async fn test_room_join_rules() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (reader, mut rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drain(&mut rx);

    let join = |room: &str| {
        ClientMessage::JoinRoom(RoomRequest {
            room: room.to_string(),
        })
    };

    for room in ["consultants", "support", "event:PAGE_SYNC", "user:r2"] {
        let replies = dispatcher.dispatch(&reader, join(room)).await;
        assert!(
            matches!(replies, Err(Error::Authorization { .. })),
            "reader joined {}",
            room
        );
    }

    for room in ["user:r1", "book-club"] {
        let replies = dispatcher.dispatch(&reader, join(room)).await.unwrap();
        assert!(matches!(&replies[..], [ServerMessage::RoomJoined(ack)] if ack.room == room));
    }

    let replies = dispatcher
        .dispatch(
            &reader,
            ClientMessage::LeaveRoom(RoomRequest {
                room: "book-club".to_string(),
            }),
        )
        .await
        .unwrap();
    assert!(matches!(&replies[..], [ServerMessage::RoomLeft(ack)] if ack.room == "book-club"));
    assert!(!h.broadcaster.rooms().is_member(&reader.id, "book-club"));
}

#[tokio::test]
async fn test_recent_events_scoping() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    for user in ["r1", "r1", "r2"] {
        h.store
            .store_event(&RealtimeEvent::new(user, "PAGE_SYNC", json!({}), "s1"))
            .await
            .unwrap();
    }
    let (reader, _rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    let (consultant, _crx) = connect(&h.broadcaster, "c1", Role::Consultant).await;

    let own = dispatcher
        .dispatch(&reader, ClientMessage::GetRecentEvents(RecentEventsRequest::default()))
        .await
        .unwrap();
    assert!(matches!(&own[..], [ServerMessage::RecentEvents(p)] if p.events.len() == 2 && p.events.iter().all(|e| e.user_id == "r1")));

    let foreign = dispatcher
        .dispatch(
            &reader,
            ClientMessage::GetRecentEvents(RecentEventsRequest {
                limit: None,
                user_id: Some("r2".to_string()),
            }),
        )
        .await;
    assert!(matches!(foreign, Err(Error::Authorization { .. })));

    let all = dispatcher
        .dispatch(
            &consultant,
            ClientMessage::GetRecentEvents(RecentEventsRequest {
                limit: Some(2),
                user_id: None,
            }),
        )
        .await
        .unwrap();
    assert!(matches!(&all[..], [ServerMessage::RecentEvents(p)] if p.events.len() == 2));
}

#[tokio::test]
async fn test_rate_limited_request_keeps_connection() {
    let h = harness();
    let dispatcher = dispatcher_with(
        h.broadcaster.clone(),
        RateLimitConfig {
            window_ms: 60_000,
            max_requests: 5,
        },
    );
    let (consultant, mut rx) = connect(&h.broadcaster, "c1", Role::Consultant).await;
    drain(&mut rx);

    for _ in 0..6 {
        dispatcher.handle_message(&consultant, ClientMessage::GetOnlineReaders).await;
    }

    let replies = drain(&mut rx);
    assert_eq!(snapshots(&replies).len(), 5);
    assert_eq!(error_codes(&replies), vec!["RATE_LIMITED"]);
    assert!(h.broadcaster.rooms().connection(&consultant.id).is_some());
}

#[tokio::test]
async fn test_malformed_frame_answered_with_error() {
    let h = harness();
    let dispatcher = dispatcher(&h);
    let (reader, mut rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drain(&mut rx);

    dispatcher.handle_text(&reader, "{not json").await;
    dispatcher
        .handle_text(&reader, r#"{"event":"join-room","data":{"room":"user:r1"}}"#)
        .await;

    let replies = drain(&mut rx);
    assert_eq!(error_codes(&replies), vec!["INVALID_MESSAGE"]);
    assert!(matches!(replies.last(), Some(ServerMessage::RoomJoined(_))));
    assert_eq!(dispatcher.monitoring().get_metrics().errors_by_code.get("INVALID_MESSAGE"), Some(&1));
}

#[tokio::test]
async fn test_queue_full_reported_to_reader() {
    let h = harness();
    let dispatcher = Dispatcher::new(
        AuthGate::new("test-secret"),
        h.broadcaster.clone(),
        EventQueue::new(activity_relay::QueueConfig {
            max_size: 1,
            ..Default::default()
        }),
    );
    let (reader, mut rx) = connect(&h.broadcaster, "r1", Role::Reader).await;
    drain(&mut rx);

    dispatcher.handle_message(&reader, reader_event("PAGE_SYNC", json!({}))).await;
    dispatcher.handle_message(&reader, reader_event("PAGE_SYNC", json!({}))).await;

    assert_eq!(error_codes(&drain(&mut rx)), vec!["QUEUE_FULL"]);
}
