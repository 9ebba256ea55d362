use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use zone_monitor::{
    demo_batch, BrokerSettings, ControllerSettings, FetchOutcome, IngestError, IngestResult,
    IngestionController, LinkState, Session, SessionSettings, Transport, TransportEvent,
    TransportLink, Zone,
};

const TOPIC: &str = "Npersonas";

const TWO_PEOPLE: &str = r#"{
    "totalPeople": 2,
    "avgConfidence": 0.9,
    "detections": [
        {"id": "P001", "x": 100, "y": 120, "confidence": 0.95},
        {"id": "P003", "x": 500, "y": 150, "confidence": 0.85}
    ]
}"#;

#[derive(Default)]
struct FakeLink {
    client_id: String,
    events: Mutex<Option<Sender<TransportEvent>>>,
    subscriptions: Mutex<Vec<String>>,
    disconnected: AtomicBool,
}

impl FakeLink {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// The broker drops the link: the event loop reports it and exits.
    fn drop_link(&self, reason: &str) {
        self.emit(TransportEvent::Disconnect {
            reason: reason.to_string(),
        });
        self.events.lock().unwrap().take();
    }

    fn deliver(&self, payload: &str) {
        self.emit(TransportEvent::Message {
            topic: TOPIC.to_string(),
            payload: payload.as_bytes().to_vec(),
        });
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl TransportLink for FakeLink {
    fn subscribe(&self, topic: &str) -> IngestResult<()> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    /// Fails once the event loop is gone, like the rumqttc client does.
    fn disconnect(&self) -> IngestResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        match self.events.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(IngestError::Transport(
                "Failed to send mqtt requests to eventloop".to_string(),
            )),
        }
    }
}

#[derive(Default)]
struct FakeBroker {
    fail_connect: AtomicBool,
    on_connect: Mutex<Vec<TransportEvent>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeBroker {
    fn last_link(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap().last().cloned().expect("a link was opened")
    }

    fn set_on_connect(&self, events: Vec<TransportEvent>) {
        *self.on_connect.lock().unwrap() = events;
    }
}

#[derive(Clone, Default)]
struct FakeTransport {
    broker: Arc<FakeBroker>,
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        broker: &BrokerSettings,
        events: Sender<TransportEvent>,
    ) -> IngestResult<Arc<dyn TransportLink>> {
        if self.broker.fail_connect.load(Ordering::SeqCst) {
            return Err(IngestError::Transport("connection refused".to_string()));
        }
        let mut dropped = false;
        for event in self.broker.on_connect.lock().unwrap().iter() {
            dropped |= matches!(event, TransportEvent::Disconnect { .. });
            let _ = events.send(event.clone());
        }
        let link = Arc::new(FakeLink {
            client_id: broker.client_id.clone(),
            events: Mutex::new((!dropped).then_some(events)),
            ..FakeLink::default()
        });
        self.broker.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

fn accepted() -> TransportEvent {
    TransportEvent::ConnAck {
        accepted: true,
        code: "Success".to_string(),
    }
}

fn broker_settings() -> BrokerSettings {
    BrokerSettings::new("broker.test", 1883, TOPIC)
}

fn controller() -> (IngestionController<FakeTransport>, Arc<FakeBroker>) {
    let transport = FakeTransport::default();
    let broker = Arc::clone(&transport.broker);
    let settings = ControllerSettings {
        connect_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        ..ControllerSettings::default()
    };
    let controller = IngestionController::new(
        transport,
        Arc::new(Session::new(SessionSettings::default())),
        broker_settings(),
        settings,
    );
    (controller, broker)
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn log_lines(controller: &IngestionController<FakeTransport>) -> Vec<String> {
    controller
        .log_snapshot()
        .into_iter()
        .map(|entry| entry.message)
        .collect()
}

#[test]
fn failed_connect_can_be_retried() {
    let (controller, broker) = controller();
    broker.fail_connect.store(true, Ordering::SeqCst);

    let err = controller
        .start_session(broker_settings())
        .expect_err("connect must fail");
    assert!(matches!(err, IngestError::Transport(_)));
    assert!(!controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Disconnected);
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line.contains("connection to mqtt://broker.test:1883 failed")));

    broker.fail_connect.store(false, Ordering::SeqCst);
    broker.set_on_connect(vec![accepted()]);
    controller
        .start_session(broker_settings())
        .expect("retry succeeds");
    assert!(controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Connected);
}

#[test]
fn broker_drop_before_ack_fails_start() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![TransportEvent::Disconnect {
        reason: "I/O: Connection refused (os error 111)".to_string(),
    }]);

    let err = controller
        .start_session(broker_settings())
        .expect_err("unreachable broker must fail");
    assert!(matches!(err, IngestError::Transport(_)));
    assert!(err.to_string().contains("Connection refused"));
    assert!(!controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Disconnected);
    assert!(broker.last_link().is_disconnected());

    broker.set_on_connect(vec![accepted()]);
    controller
        .start_session(broker_settings())
        .expect("retry reaches the broker");
    assert_eq!(broker.links.lock().unwrap().len(), 2);
    assert!(controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Connected);
}

#[test]
fn silent_broker_fails_start_after_connect_timeout() {
    let (controller, broker) = controller();

    let started = Instant::now();
    let err = controller
        .start_session(broker_settings())
        .expect_err("no answer must fail");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(err.to_string().contains("no answer from mqtt://broker.test:1883"));
    assert!(broker.last_link().is_disconnected());
    assert!(!controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Disconnected);
}

#[test]
fn conn_ack_subscribes_and_marks_connected() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);

    controller.start_session(broker_settings()).unwrap();
    assert_eq!(controller.link_state(), LinkState::Connected);

    let link = broker.last_link();
    assert_eq!(link.client_id, "zone_monitor");
    assert_eq!(link.subscriptions(), vec![TOPIC.to_string()]);
    assert!(controller.is_live());
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line.contains("subscribed to Npersonas")));
}

#[test]
fn refused_conn_ack_leaves_session_disconnected() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![TransportEvent::ConnAck {
        accepted: false,
        code: "NotAuthorized".to_string(),
    }]);

    let err = controller
        .start_session(broker_settings())
        .expect_err("refusal must fail");
    assert!(err.to_string().contains("refused: code NotAuthorized"));
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line.contains("refused: code NotAuthorized")));
    assert_eq!(controller.link_state(), LinkState::Disconnected);
    assert!(!controller.is_live());
    assert!(!controller.is_subscribed());
    let link = broker.last_link();
    assert!(link.subscriptions().is_empty());
    assert!(link.is_disconnected());
}

#[test]
fn delivered_message_updates_aggregate_raw_store_and_liveness() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    wait_for("connected", || controller.link_state() == LinkState::Connected);

    broker.last_link().deliver(TWO_PEOPLE);
    wait_for("aggregate", || {
        controller.aggregation_state().total_detections() == 2
    });

    let aggregation = controller.aggregation_state();
    assert_eq!(aggregation.occupants(Zone { col: 0, row: 1 })[0].id, "P001");
    assert_eq!(aggregation.occupants(Zone { col: 4, row: 1 })[0].id, "P003");
    assert_eq!(aggregation.active_zones(), 2);

    let raw = controller.raw_message_snapshot();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].topic, TOPIC);
    assert_eq!(raw[0].payload, TWO_PEOPLE);

    assert!(controller.session().last_data_at().is_some());
    assert!(controller.last_update().is_some());
    let last = controller.session().last_payload().expect("last payload");
    assert_eq!(last.total_people(), Some(2));
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line == "processed 2 person detections"));
}

#[test]
fn disconnect_event_marks_link_down_but_recent_data_stays_live() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    wait_for("connected", || controller.link_state() == LinkState::Connected);

    let link = broker.last_link();
    link.deliver(TWO_PEOPLE);
    link.drop_link("KeepAliveTimeout");
    wait_for("disconnected", || {
        controller.link_state() == LinkState::Disconnected
    });
    wait_for("subscription closed", || !controller.is_subscribed());

    assert!(controller.is_live());
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line.contains("(code: KeepAliveTimeout)")));
}

#[test]
fn dropped_link_can_be_restarted() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    let first = broker.last_link();

    first.drop_link("I/O: connection reset by peer");
    wait_for("subscription closed", || !controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Disconnected);

    controller
        .start_session(broker_settings())
        .expect("restart after a drop connects afresh");
    let second = broker.last_link();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.subscriptions(), vec![TOPIC.to_string()]);
    assert!(controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Connected);
}

#[test]
fn stopping_a_dropped_link_succeeds() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();

    broker.last_link().drop_link("KeepAliveTimeout");
    wait_for("subscription closed", || !controller.is_subscribed());

    controller.stop_session().expect("dead link stops cleanly");
    assert_eq!(controller.link_state(), LinkState::Disconnected);
}

#[test]
fn malformed_payload_keeps_previous_aggregate() {
    let (controller, _broker) = controller();
    controller.on_message_arrival(TOPIC, TWO_PEOPLE.as_bytes());
    let before = controller.aggregation_state();
    let log_before = controller.log_snapshot().len();
    let raw_before = controller.raw_message_snapshot().len();

    controller.on_message_arrival(TOPIC, b"{not json");

    let after = controller.aggregation_state();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(controller.raw_message_snapshot().len(), raw_before);

    let lines = log_lines(&controller);
    assert_eq!(lines.len(), log_before + 1);
    assert!(lines.last().unwrap().contains("{not json"));
}

#[test]
fn invalid_utf8_is_logged_once() {
    let (controller, _broker) = controller();
    controller.on_message_arrival(TOPIC, &[0x7b, 0xff, 0xfe]);

    let lines = log_lines(&controller);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("decode error"));
    assert!(controller.aggregation_state().is_empty());
    assert!(!controller.is_live());
}

#[test]
fn fetch_times_out_and_releases_link() {
    let (controller, broker) = controller();

    let started = Instant::now();
    let outcome = controller.fetch_one(Duration::from_millis(150)).unwrap();
    assert_eq!(outcome, FetchOutcome::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let link = broker.last_link();
    assert_eq!(link.client_id, "zone_monitor-fetch");
    assert_eq!(link.subscriptions(), vec![TOPIC.to_string()]);
    assert!(link.is_disconnected());
    assert!(log_lines(&controller)
        .iter()
        .any(|line| line == "fetch link disconnected"));

    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    assert!(controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Connected);
}

#[test]
fn fetch_returns_first_decodable_message() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![
        accepted(),
        TransportEvent::Message {
            topic: TOPIC.to_string(),
            payload: b"{not json".to_vec(),
        },
        TransportEvent::Message {
            topic: TOPIC.to_string(),
            payload: TWO_PEOPLE.as_bytes().to_vec(),
        },
    ]);

    let batch = match controller.fetch_one(Duration::from_secs(2)).unwrap() {
        FetchOutcome::Message(batch) => batch,
        FetchOutcome::Timeout => panic!("expected a message"),
    };
    assert_eq!(batch.detections.len(), 2);
    assert_eq!(controller.aggregation_state().total_detections(), 2);
    assert!(controller.is_live());
    assert!(broker.last_link().is_disconnected());
    assert!(!controller.is_subscribed());
}

#[test]
fn fetch_reports_closed_link() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![TransportEvent::Disconnect {
        reason: "connection reset".to_string(),
    }]);

    let err = controller
        .fetch_one(Duration::from_secs(2))
        .expect_err("closed link is an error");
    assert!(err.to_string().contains("connection reset"));
    assert!(broker.last_link().is_disconnected());
}

#[test]
fn reset_clears_buffers_but_keeps_liveness() {
    let (controller, _broker) = controller();
    controller.on_message_arrival(TOPIC, TWO_PEOPLE.as_bytes());
    assert!(controller.is_live());
    let updated = controller.last_update();

    controller.reset();

    assert_eq!(log_lines(&controller), vec!["monitor cleared".to_string()]);
    assert!(controller.raw_message_snapshot().is_empty());
    assert!(controller.aggregation_state().is_empty());
    assert!(controller.session().last_payload().is_none());
    assert!(controller.is_live());
    assert_eq!(controller.last_update(), updated);
}

#[test]
fn synthetic_batch_does_not_touch_liveness() {
    let (controller, _broker) = controller();
    controller.inject_synthetic_batch(demo_batch().detections);

    let aggregation = controller.aggregation_state();
    assert_eq!(aggregation.total_detections(), 5);
    assert_eq!(aggregation.occupants(Zone { col: 4, row: 1 })[0].id, "P003");
    assert!(controller.last_update().is_some());
    assert!(!controller.is_live());
    assert_eq!(controller.link_state(), LinkState::Disconnected);
    assert!(controller.raw_message_snapshot().is_empty());
}

#[test]
fn stop_session_disconnects_link() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();

    controller.stop_session().unwrap();

    assert!(broker.last_link().is_disconnected());
    assert!(!controller.is_subscribed());
    assert_eq!(controller.link_state(), LinkState::Disconnected);
    assert_eq!(log_lines(&controller).last().unwrap(), "session stopped");
}

#[test]
fn restarting_replaces_previous_link() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    let first = broker.last_link();

    let mut moved = broker_settings();
    moved.topic = "lobby/people".to_string();
    controller.start_session(moved).unwrap();

    assert!(first.is_disconnected());
    assert!(!broker.last_link().is_disconnected());
    assert_eq!(controller.broker().topic, "lobby/people");
}

#[test]
fn dropping_controller_disconnects() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    controller.start_session(broker_settings()).unwrap();
    let link = broker.last_link();

    drop(controller);
    assert!(link.is_disconnected());
}

#[test]
fn concurrent_starts_leave_one_open_link() {
    let (controller, broker) = controller();
    broker.set_on_connect(vec![accepted()]);
    let controller = Arc::new(controller);

    let starters: Vec<_> = (0..8)
        .map(|_| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.start_session(broker_settings()))
        })
        .collect();
    for starter in starters {
        starter.join().unwrap().expect("start succeeds");
    }

    let links = broker.links.lock().unwrap();
    assert_eq!(links.len(), 8);
    let open = links.iter().filter(|link| !link.is_disconnected()).count();
    assert_eq!(open, 1);
    assert!(controller.is_subscribed());
}

#[test]
fn concurrent_ingest_and_reset_stay_consistent() {
    let (controller, _broker) = controller();
    let controller = Arc::new(controller);

    let mut workers = Vec::new();
    for i in 0..4 {
        let controller = Arc::clone(&controller);
        workers.push(thread::spawn(move || {
            for _ in 0..50 {
                if i == 0 {
                    controller.reset();
                } else {
                    controller.on_message_arrival(TOPIC, TWO_PEOPLE.as_bytes());
                }
            }
        }));
    }

    let reader = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            for _ in 0..200 {
                let aggregation = controller.aggregation_state();
                let total = aggregation.total_detections();
                assert!(total == 0 || total == 2, "torn aggregate: {total}");
                let summed: usize = aggregation.iter().map(|(_, o)| o.len()).sum();
                assert_eq!(summed, total);
                assert!(controller.log_snapshot().len() <= 50);
                assert!(controller.raw_message_snapshot().len() <= 20);
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    reader.join().unwrap();
}
