use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};

use super::message::{
    EventKind, FleetUpdateEvent, LineStatus, Notice, Occupancy, TrainPosition, TrainStatus,
};
use super::topic::{LineId, Topic};
use super::{Publisher, TopicRegistry};
use crate::client::ConnectionHandle;
use crate::persistence::{
    NewNotification, NotificationId, NotificationRecord, NotificationStore, PersistenceError,
    SledNotificationStore,
};
use crate::utils::error::FeedError;
use crate::utils::report::RecordingErrorSink;

fn train(id: &str, line: &str, latitude: f64, longitude: f64) -> FleetUpdateEvent {
    FleetUpdateEvent::train_update(TrainPosition {
        train_id: id.to_string(),
        line_id: LineId::from(line),
        latitude,
        longitude,
        status: TrainStatus::Operacional,
        occupancy: Occupancy::Media,
        speed: 60.0,
        current_station: None,
        next_station: None,
        next_station_eta: None,
        direction: None,
    })
}

fn arrival(user: u64) -> FleetUpdateEvent {
    FleetUpdateEvent::arrival(Notice {
        recipient: user,
        title: "Trem chegando na Brás".into(),
        body: "O trem T1101 chegará na estação Brás em 3 minutos.".into(),
        line_id: Some(LineId::from("11")),
        station: Some("Brás".into()),
        train_id: Some("T1101".into()),
        minutes: Some(3),
        reason: None,
    })
}

fn train_id(conn: &ConnectionHandle) -> Option<String> {
    conn.try_next().and_then(|d| match &d.event.body {
        super::message::EventBody::Train(p) => Some(p.train_id.clone()),
        _ => None,
    })
}

struct Fixture {
    registry: Arc<TopicRegistry>,
    store: Arc<SledNotificationStore>,
    errors: Arc<RecordingErrorSink>,
    publisher: Publisher,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let store =
        Arc::new(SledNotificationStore::open(dir.path().to_str().unwrap(), None).unwrap());
    let registry = Arc::new(TopicRegistry::new());
    let errors = Arc::new(RecordingErrorSink::new());
    let publisher = Publisher::new(registry.clone(), store.clone(), errors.clone());
    Fixture {
        registry,
        store,
        errors,
        publisher,
        _dir: dir,
    }
}

/// Store whose writes always fail.
struct FailingStore;

#[async_trait]
impl NotificationStore for FailingStore {
    async fn record_notification(
        &self,
        _notification: NewNotification,
    ) -> Result<NotificationId, PersistenceError> {
        Err(PersistenceError::Io(std::io::Error::other("database unavailable")))
    }

    async fn mark_delivered(&self, _: u64, id: NotificationId) -> Result<(), PersistenceError> {
        Err(PersistenceError::NotFound(id))
    }

    async fn mark_read(&self, _: u64, id: NotificationId) -> Result<(), PersistenceError> {
        Err(PersistenceError::NotFound(id))
    }

    async fn notifications_for(
        &self,
        _: u64,
        _: bool,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        Ok(Vec::new())
    }
}

/// Store whose writes never finish in time.
struct StalledStore;

#[async_trait]
impl NotificationStore for StalledStore {
    async fn record_notification(
        &self,
        _notification: NewNotification,
    ) -> Result<NotificationId, PersistenceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(1)
    }

    async fn mark_delivered(&self, _: u64, _: NotificationId) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn mark_read(&self, _: u64, _: NotificationId) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn notifications_for(
        &self,
        _: u64,
        _: bool,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        Ok(Vec::new())
    }
}

#[test]
fn test_topic_display_and_parse() {
    assert_eq!(Topic::Fleet.to_string(), "fleet");
    assert_eq!(Topic::line("7").to_string(), "line:7");
    assert_eq!(Topic::user(42).to_string(), "user:42");

    assert_eq!("fleet".parse::<Topic>().unwrap(), Topic::Fleet);
    assert_eq!("line:11".parse::<Topic>().unwrap(), Topic::line("11"));
    assert_eq!("user:5".parse::<Topic>().unwrap(), Topic::user(5));
}

#[test]
fn test_malformed_topics_are_rejected() {
    for raw in ["", "trens_real_time", "line:", "user:abc", "line:1:2", "station:3"] {
        assert!(
            matches!(raw.parse::<Topic>(), Err(FeedError::MalformedTopic(_))),
            "{raw} should be malformed"
        );
    }
}

#[test]
fn test_line_id_accepts_number_or_string() {
    let from_number: LineId = serde_json::from_str("7").unwrap();
    let from_text: LineId = serde_json::from_str("\"7\"").unwrap();
    assert_eq!(from_number, from_text);
    assert!(serde_json::from_str::<LineId>("\"\"").is_err());
}

#[test]
fn test_event_kinds_and_default_targets() {
    let update = train("T701", "7", -23.53, -46.63);
    assert_eq!(update.kind(), EventKind::TrainUpdate);
    assert_eq!(update.targets, vec![Topic::Fleet, Topic::line("7")]);

    let notice = arrival(5);
    assert_eq!(notice.kind(), EventKind::NotificationArrival);
    assert!(notice.kind().is_notification());
    assert_eq!(notice.targets, vec![Topic::user(5)]);
    assert_eq!(EventKind::NotificationDelay.wire_type(), "notificacao_atraso");
}

#[test]
fn test_join_is_idempotent() {
    let registry = TopicRegistry::new();
    let conn = ConnectionHandle::new(None, 10);

    registry.join(&Topic::Fleet, &conn).unwrap();
    registry.join(&Topic::Fleet, &conn).unwrap();

    assert_eq!(registry.subscriber_count(&Topic::Fleet), 1);
    assert_eq!(conn.topics(), vec![Topic::Fleet]);
}

#[test]
fn test_leave_removes_and_is_noop_when_absent() {
    let registry = TopicRegistry::new();
    let conn = ConnectionHandle::new(None, 10);
    let topic = Topic::line("7");

    registry.leave(&topic, &conn);
    registry.join(&topic, &conn).unwrap();
    registry.leave(&topic, &conn);

    assert!(!registry.is_subscribed(&topic, &conn));
    assert_eq!(registry.topic_count(), 0, "empty topics are collected");
    assert!(conn.topics().is_empty());
}

#[test]
fn test_racing_join_and_leave_keep_both_sides_consistent() {
    let registry = TopicRegistry::new();
    let conn = ConnectionHandle::new(None, 10);
    let topic = Topic::line("11");

    for _ in 0..500 {
        let barrier = std::sync::Barrier::new(2);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                registry.join(&topic, &conn).unwrap();
            });
            scope.spawn(|| {
                barrier.wait();
                registry.leave(&topic, &conn);
            });
        });

        assert_eq!(
            conn.topics().contains(&topic),
            registry.is_subscribed(&topic, &conn),
            "connection and registry disagree on {topic}"
        );
    }
}

#[test]
fn test_leave_all_removes_from_every_topic() {
    let registry = TopicRegistry::new();
    let conn = ConnectionHandle::new(Some(5), 10);
    let other = ConnectionHandle::new(None, 10);
    let topics = [Topic::Fleet, Topic::line("7"), Topic::line("11"), Topic::user(5)];
    for topic in &topics {
        registry.join(topic, &conn).unwrap();
    }
    registry.join(&Topic::Fleet, &other).unwrap();

    let mut removed = registry.leave_all(&conn);
    removed.sort_by_key(|t| t.to_string());

    assert_eq!(removed.len(), topics.len());
    for topic in &topics {
        assert!(!registry.is_subscribed(topic, &conn));
    }
    assert!(registry.is_subscribed(&Topic::Fleet, &other));
    assert!(conn.is_closed());
    assert!(!other.is_closed(), "registry never closes connections it merely references");
}

#[test]
fn test_join_after_leave_all_fails() {
    let registry = TopicRegistry::new();
    let conn = ConnectionHandle::new(None, 10);
    registry.leave_all(&conn);

    let err = registry.join(&Topic::Fleet, &conn).unwrap_err();
    assert!(matches!(err, FeedError::ConnectionClosed(_)));
    assert_eq!(registry.subscriber_count(&Topic::Fleet), 0);
}

#[test]
fn test_unauthorized_user_topic_join_does_not_mutate() {
    let registry = TopicRegistry::new();
    let seven = ConnectionHandle::new(Some(7), 10);
    let anonymous = ConnectionHandle::new(None, 10);

    let err = registry.join(&Topic::user(42), &seven).unwrap_err();
    assert!(matches!(err, FeedError::Unauthorized(_)));
    assert!(registry.join(&Topic::user(42), &anonymous).is_err());

    assert_eq!(registry.topic_count(), 0);
    assert!(seven.topics().is_empty());
    registry.join(&Topic::user(7), &seven).unwrap();
}

#[test]
fn test_subscribers_of_is_a_snapshot() {
    let registry = TopicRegistry::new();
    let a = ConnectionHandle::new(None, 10);
    let b = ConnectionHandle::new(None, 10);
    registry.join(&Topic::Fleet, &a).unwrap();

    let snapshot = registry.subscribers_of(&Topic::Fleet);
    registry.join(&Topic::Fleet, &b).unwrap();

    assert_eq!(snapshot.len(), 1);
    assert_eq!(registry.subscribers_of(&Topic::Fleet).len(), 2);
}

#[tokio::test]
async fn test_end_to_end_fleet_and_line_delivery() {
    let fx = fixture();
    let a = ConnectionHandle::new(None, 10);
    let b = ConnectionHandle::new(None, 10);
    let c = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::Fleet, &a).unwrap();
    fx.registry.join(&Topic::line("7"), &b).unwrap();

    let report = fx.publisher.publish(train("T701", "7", -23.53, -46.63)).await;

    assert_eq!(report.delivered, 2);
    assert_eq!(train_id(&a).as_deref(), Some("T701"));
    assert_eq!(train_id(&b).as_deref(), Some("T701"));
    assert!(c.try_next().is_none());
}

#[tokio::test]
async fn test_overlapping_subscriptions_receive_once() {
    let fx = fixture();
    let conn = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::Fleet, &conn).unwrap();
    fx.registry.join(&Topic::line("7"), &conn).unwrap();

    let report = fx.publisher.publish(train("T701", "7", -23.53, -46.63)).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(conn.pending(), 1);
}

#[tokio::test]
async fn test_per_topic_fifo_and_sequence_numbers() {
    let fx = fixture();
    let conn = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::line("11"), &conn).unwrap();

    for i in 1..=5 {
        fx.publisher
            .publish(train(&format!("T11{i:02}"), "11", -23.5, -46.6))
            .await;
    }

    let seqs: Vec<u64> = std::iter::from_fn(|| conn.try_next()).map(|d| d.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(fx.publisher.last_seq(&Topic::line("11")), 5);
}

#[tokio::test]
async fn test_no_delivery_after_leave() {
    let fx = fixture();
    let conn = ConnectionHandle::new(None, 10);
    let topic = Topic::line("7");
    fx.registry.join(&topic, &conn).unwrap();

    fx.publisher.publish(train("T701", "7", -23.53, -46.63)).await;
    fx.registry.leave(&topic, &conn);
    fx.publisher.publish(train("T702", "7", -23.53, -46.63)).await;

    assert_eq!(train_id(&conn).as_deref(), Some("T701"));
    assert!(conn.try_next().is_none());
}

#[tokio::test]
async fn test_join_after_publish_misses_the_event() {
    let fx = fixture();
    let late = ConnectionHandle::new(None, 10);

    fx.publisher.publish(train("T701", "7", -23.53, -46.63)).await;
    fx.registry.join(&Topic::Fleet, &late).unwrap();
    fx.publisher.publish(train("T702", "7", -23.53, -46.63)).await;

    assert_eq!(train_id(&late).as_deref(), Some("T702"));
    assert!(late.try_next().is_none());
}

#[tokio::test]
async fn test_slow_consumer_drops_oldest_and_keeps_newest() {
    let fx = fixture();
    let slow = ConnectionHandle::new(None, 2);
    let healthy = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::Fleet, &slow).unwrap();
    fx.registry.join(&Topic::Fleet, &healthy).unwrap();

    for id in ["T701", "T702", "T703"] {
        fx.publisher.publish(train(id, "7", -23.53, -46.63)).await;
    }

    assert!(slow.dropped() >= 1);
    let received: Vec<String> = std::iter::from_fn(|| train_id(&slow)).collect();
    assert_eq!(received.last().map(String::as_str), Some("T703"));
    assert_eq!(healthy.pending(), 3, "one slow client does not affect the others");
    assert!(
        fx.errors
            .count_matching(|e| matches!(e, FeedError::SlowConsumer { .. }))
            >= 1
    );
}

#[tokio::test]
async fn test_closed_connection_is_skipped() {
    let fx = fixture();
    let closed = ConnectionHandle::new(None, 10);
    let open = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::Fleet, &closed).unwrap();
    fx.registry.join(&Topic::Fleet, &open).unwrap();
    closed.close();

    let report = fx.publisher.publish(train("T701", "7", -23.53, -46.63)).await;

    assert_eq!(report.skipped, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(open.pending(), 1);
}

#[tokio::test]
async fn test_notification_is_persisted_and_marked_delivered() {
    let fx = fixture();
    let conn = ConnectionHandle::new(Some(5), 10);
    fx.registry.join(&Topic::user(5), &conn).unwrap();

    let report = fx.publisher.publish(arrival(5)).await;

    assert_eq!(report.records.len(), 1);
    let (user, id) = report.records[0];
    assert_eq!(user, 5);
    assert_eq!(conn.try_next().and_then(|d| d.record_id), Some(id));

    let records = fx.store.notifications_for(5, false).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].delivered);
}

#[tokio::test]
async fn test_notification_without_listener_stays_undelivered() {
    let fx = fixture();

    let report = fx.publisher.publish(arrival(9)).await;

    assert_eq!(report.records.len(), 1);
    let records = fx.store.notifications_for(9, false).await.unwrap();
    assert!(!records[0].delivered);
}

#[tokio::test]
async fn test_persistence_failure_still_delivers_live() {
    let registry = Arc::new(TopicRegistry::new());
    let errors = Arc::new(RecordingErrorSink::new());
    let publisher = Publisher::new(registry.clone(), Arc::new(FailingStore), errors.clone());
    let conn = ConnectionHandle::new(Some(5), 10);
    registry.join(&Topic::user(5), &conn).unwrap();

    let report = publisher.publish(arrival(5)).await;

    assert_eq!(report.delivered, 1);
    assert!(report.records.is_empty());
    let delivery = conn.try_next().expect("live delivery despite store failure");
    assert_eq!(delivery.record_id, None);
    assert_eq!(
        errors.count_matching(|e| matches!(e, FeedError::PersistenceFailure { user: 5, .. })),
        1
    );
}

#[tokio::test]
async fn test_stalled_store_is_bounded_by_timeout() {
    let registry = Arc::new(TopicRegistry::new());
    let errors = Arc::new(RecordingErrorSink::new());
    let publisher = Publisher::new(registry.clone(), Arc::new(StalledStore), errors.clone())
        .with_persist_timeout(Duration::from_millis(50));
    let conn = ConnectionHandle::new(Some(5), 10);
    registry.join(&Topic::user(5), &conn).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), publisher.publish(arrival(5)))
        .await
        .expect("publish must not wait on the stalled store");

    assert_eq!(report.delivered, 1);
    assert_eq!(
        errors.count_matching(|e| matches!(e, FeedError::PersistenceFailure { .. })),
        1
    );
}

#[test]
fn test_slow_sled_write_is_bounded_by_timeout() {
    // one blocking thread, held busy so the sled write has to queue behind it
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(SledNotificationStore::open(dir.path().to_str().unwrap(), None).unwrap());
        let registry = Arc::new(TopicRegistry::new());
        let errors = Arc::new(RecordingErrorSink::new());
        let publisher = Publisher::new(registry.clone(), store.clone(), errors.clone())
            .with_persist_timeout(Duration::from_millis(50));
        let conn = ConnectionHandle::new(Some(5), 10);
        registry.join(&Topic::user(5), &conn).unwrap();

        let (release, gate) = std::sync::mpsc::channel::<()>();
        let blocker = tokio::task::spawn_blocking(move || {
            let _ = gate.recv();
        });

        let report = tokio::time::timeout(Duration::from_secs(2), publisher.publish(arrival(5)))
            .await
            .expect("publish must not wait on the busy store");

        assert_eq!(report.delivered, 1);
        let delivery = conn.try_next().expect("notice delivered without a record id");
        assert!(delivery.record_id.is_none());
        assert_eq!(
            errors.count_matching(|e| matches!(e, FeedError::PersistenceFailure { .. })),
            1
        );

        release.send(()).unwrap();
        blocker.await.unwrap();
    });
}

#[tokio::test]
async fn test_line_update_reaches_line_subscribers() {
    let fx = fixture();
    let conn = ConnectionHandle::new(None, 10);
    fx.registry.join(&Topic::line("10"), &conn).unwrap();

    fx.publisher
        .publish(FleetUpdateEvent::line_update(LineStatus {
            line_id: LineId::from("10"),
            name: "Linha 10-Turquesa".into(),
            status: "atrasado".into(),
            active_trains: 4,
            delayed_trains: 1,
            message: Some("Sinalização defeituosa".into()),
        }))
        .await;

    let delivery = conn.try_next().unwrap();
    assert_eq!(delivery.event.kind(), EventKind::LineUpdate);
    assert_eq!(delivery.topic, Topic::line("10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_keep_per_topic_order() {
    let fx = fixture();
    let publisher = Arc::new(fx.publisher);
    let conns: Vec<_> = (0..20).map(|_| ConnectionHandle::new(None, 1000)).collect();
    for conn in &conns {
        fx.registry.join(&Topic::line("7"), conn).unwrap();
    }

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let publisher = publisher.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                publisher
                    .publish(train(&format!("W{worker}-{i}"), "7", -23.5, -46.6))
                    .await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for conn in &conns {
        let seqs: Vec<u64> = std::iter::from_fn(|| conn.try_next()).map(|d| d.seq).collect();
        assert_eq!(seqs.len(), 200);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
