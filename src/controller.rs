//! Ingestion controller: subscription lifecycle and message dispatch.
//!
//! A persistent subscription runs two threads: the transport's own event
//! loop, and a dispatcher that drains the link's event channel and applies
//! each `TransportEvent` to the session. The dispatcher is only spawned once
//! the broker has accepted the connection, so `start_session` can report a
//! refused or unreachable broker to its caller. `fetch_one` instead drains a
//! private channel on the caller's thread.

use chrono::Local;
use serde_json::Map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{LogEntry, RawMessage};
use crate::detection::{decode_text, parse_batch, preview, Detection, DetectionBatch};
use crate::error::{IngestError, IngestResult};
use crate::grid::{AggregationState, FrameResolution, GridMapper};
use crate::liveness::LinkState;
use crate::session::Session;
use crate::transport::{BrokerSettings, Transport, TransportEvent, TransportLink};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Resolution the sensor reports coordinates in.
    pub frame: FrameResolution,
    /// How long `start_session` waits for the broker to answer.
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    /// How often `fetch_one` checks for a delivered message.
    pub poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            frame: FrameResolution::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Result of a one-shot fetch.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    Message(DetectionBatch),
    Timeout,
}

/// Applies decoded traffic to a session.
#[derive(Clone)]
struct Pipeline {
    session: Arc<Session>,
    mapper: GridMapper,
}

impl Pipeline {
    /// Decode, record and aggregate one message under a single lock.
    ///
    /// Returns the batch when it was accepted. Failures only add a log entry.
    fn ingest(&self, topic: &str, payload: &[u8]) -> Option<DetectionBatch> {
        let mut state = self.session.lock();

        let text = match decode_text(payload) {
            Ok(text) => text,
            Err(e) => {
                state.note(log::Level::Warn, e.to_string());
                return None;
            }
        };
        let batch = match parse_batch(text) {
            Ok(batch) => batch,
            Err(e) => {
                state.note(log::Level::Warn, e.to_string());
                return None;
            }
        };

        let now = Local::now();
        state.record_raw(topic, text, now);
        state.note(log::Level::Info, format!("message received on topic {topic}"));
        state.note(log::Level::Debug, format!("payload: {}", preview(text)));
        state.liveness.on_data_received(now);

        let aggregation = AggregationState::rebuild(&batch.detections, &self.mapper);
        let count = batch.detections.len();
        state.install(aggregation, batch.clone(), now);
        state.note(
            log::Level::Info,
            format!("processed {count} person detections"),
        );
        Some(batch)
    }

    /// Subscribe after an accepted connect-ack and mark the link connected.
    fn on_connected(&self, link: &dyn TransportLink, broker: &BrokerSettings) -> IngestResult<()> {
        let subscribed = link.subscribe(&broker.topic);
        let mut state = self.session.lock();
        state.liveness.on_connect_ack(true);
        match &subscribed {
            Ok(()) => state.note(
                log::Level::Info,
                format!(
                    "connected to {} and subscribed to {}",
                    broker.endpoint, broker.topic
                ),
            ),
            Err(e) => state.note(
                log::Level::Warn,
                format!(
                    "connected to {} but subscribing to {} failed: {}",
                    broker.endpoint, broker.topic, e
                ),
            ),
        }
        subscribed
    }

    fn handle_event(&self, event: TransportEvent, link: &dyn TransportLink, broker: &BrokerSettings) {
        match event {
            TransportEvent::ConnAck { accepted: true, .. } => {
                // Failure is already in the session log.
                let _ = self.on_connected(link, broker);
            }
            TransportEvent::ConnAck {
                accepted: false,
                code,
            } => {
                let mut state = self.session.lock();
                state.liveness.on_connect_ack(false);
                state.note(
                    log::Level::Warn,
                    format!("connection to {} refused: code {}", broker.endpoint, code),
                );
            }
            TransportEvent::Message { topic, payload } => {
                self.ingest(&topic, &payload);
            }
            TransportEvent::SubAck { granted } => {
                self.session.lock().note(
                    log::Level::Info,
                    format!("subscription confirmed: QoS {granted}"),
                );
            }
            TransportEvent::Disconnect { reason } => {
                let mut state = self.session.lock();
                state.liveness.on_disconnect();
                state.note(
                    log::Level::Info,
                    format!("disconnected from {} (code: {})", broker.endpoint, reason),
                );
            }
        }
    }
}

/// Shared between a subscription and its dispatcher thread.
#[derive(Default)]
struct LinkFlags {
    /// The link reported `Disconnect` or its channel closed.
    closed: AtomicBool,
    /// The controller is tearing the link down; remaining events are dropped.
    retired: AtomicBool,
}

struct Subscription {
    link: Arc<dyn TransportLink>,
    dispatcher: JoinHandle<()>,
    flags: Arc<LinkFlags>,
}

impl Subscription {
    fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    /// Disconnect the link and join the dispatcher.
    ///
    /// A link the broker already dropped has no event loop left to take the
    /// disconnect request; that failure is expected and not returned.
    fn shut_down(self) -> IngestResult<()> {
        self.flags.retired.store(true, Ordering::SeqCst);
        let was_closed = self.is_closed();
        let result = self.link.disconnect();
        let _ = self.dispatcher.join();
        match result {
            Err(e) if was_closed => {
                log::debug!("disconnecting a dropped link: {}", e);
                Ok(())
            }
            other => other,
        }
    }
}

/// Disconnects a fetch link on every exit path.
struct FetchLinkGuard<'a> {
    link: Arc<dyn TransportLink>,
    session: &'a Session,
}

impl Drop for FetchLinkGuard<'_> {
    fn drop(&mut self) {
        let result = self.link.disconnect();
        let mut state = self.session.lock();
        match result {
            Ok(()) => state.note(log::Level::Info, "fetch link disconnected"),
            Err(e) => state.note(log::Level::Warn, format!("fetch link disconnect failed: {e}")),
        }
    }
}

/// Owns the subscription lifecycle for one session.
pub struct IngestionController<T: Transport> {
    transport: T,
    pipeline: Pipeline,
    settings: ControllerSettings,
    broker: Mutex<BrokerSettings>,
    active: Mutex<Option<Subscription>>,
}

impl<T: Transport> IngestionController<T> {
    pub fn new(
        transport: T,
        session: Arc<Session>,
        broker: BrokerSettings,
        settings: ControllerSettings,
    ) -> Self {
        let mapper = GridMapper::new(session.settings().grid, settings.frame);
        Self {
            transport,
            pipeline: Pipeline { session, mapper },
            settings,
            broker: Mutex::new(broker),
            active: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.pipeline.session
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    pub fn mapper(&self) -> GridMapper {
        self.pipeline.mapper
    }

    /// Broker settings used by the last `start_session` (or construction).
    pub fn broker(&self) -> BrokerSettings {
        self.broker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a persistent subscription, replacing any existing one.
    ///
    /// Returns once the broker has accepted the connection and the topic
    /// subscription was issued. A failed connect, a refusal, a dropped link
    /// or no answer within `connect_timeout` is returned as
    /// `IngestError::Transport`; the session is left disconnected and the
    /// caller may retry. Drops after that point are logged by the dispatcher.
    pub fn start_session(&self, broker: BrokerSettings) -> IngestResult<()> {
        // Teardown failures are logged by `stop_session` and must not keep a
        // dead link from being replaced.
        let _ = self.stop_session();
        *self.broker.lock().unwrap_or_else(PoisonError::into_inner) = broker.clone();

        {
            let mut state = self.session().lock();
            state.liveness.begin_connect();
            state.note(
                log::Level::Info,
                format!("connecting to {} (topic: {})", broker.endpoint, broker.topic),
            );
        }

        let (tx, rx) = mpsc::channel();
        let link = match self.transport.connect(&broker, tx) {
            Ok(link) => link,
            Err(e) => {
                let mut state = self.session().lock();
                state.liveness.on_disconnect();
                state.note(
                    log::Level::Warn,
                    format!("connection to {} failed: {}", broker.endpoint, e),
                );
                return Err(e);
            }
        };

        if let Err(e) = self.await_conn_ack(&rx, link.as_ref(), &broker) {
            return Err(self.abandon_link(link.as_ref(), e));
        }

        let pipeline = self.pipeline.clone();
        let flags = Arc::new(LinkFlags::default());
        let dispatch_flags = Arc::clone(&flags);
        let dispatch_link = Arc::clone(&link);
        let spawned = std::thread::Builder::new()
            .name("ingest-dispatch".to_string())
            .spawn(move || {
                for event in rx {
                    if dispatch_flags.retired.load(Ordering::SeqCst) {
                        break;
                    }
                    let dropped = matches!(event, TransportEvent::Disconnect { .. });
                    pipeline.handle_event(event, dispatch_link.as_ref(), &broker);
                    if dropped {
                        dispatch_flags.closed.store(true, Ordering::SeqCst);
                    }
                }
                dispatch_flags.closed.store(true, Ordering::SeqCst);
            });

        let dispatcher = match spawned {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                let err = IngestError::Transport(format!("failed to start dispatcher: {e}"));
                return Err(self.abandon_link(link.as_ref(), err));
            }
        };

        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Subscription {
                link,
                dispatcher,
                flags,
            });
        // A concurrent start_session got here first; its link is superseded.
        if let Some(previous) = previous {
            if let Err(e) = previous.shut_down() {
                self.session().lock().note(
                    log::Level::Warn,
                    format!("disconnecting superseded link failed: {e}"),
                );
            }
        }
        Ok(())
    }

    /// Wait for the broker's first answer on a fresh link.
    fn await_conn_ack(
        &self,
        rx: &Receiver<TransportEvent>,
        link: &dyn TransportLink,
        broker: &BrokerSettings,
    ) -> IngestResult<()> {
        let timeout = self.settings.connect_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match rx.recv_timeout(remaining) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(IngestError::Transport(format!(
                        "no answer from {} within {:?}",
                        broker.endpoint, timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(IngestError::Transport(format!(
                        "link to {} closed before the broker answered",
                        broker.endpoint
                    )));
                }
            };

            match event {
                TransportEvent::ConnAck { accepted: true, .. } => {
                    return self.pipeline.on_connected(link, broker);
                }
                TransportEvent::ConnAck {
                    accepted: false,
                    ref code,
                } => {
                    let err = IngestError::Transport(format!(
                        "connection to {} refused: code {}",
                        broker.endpoint, code
                    ));
                    self.pipeline.handle_event(event, link, broker);
                    return Err(err);
                }
                TransportEvent::Disconnect { ref reason } => {
                    let err = IngestError::Transport(format!(
                        "connection to {} failed: {}",
                        broker.endpoint, reason
                    ));
                    self.pipeline.handle_event(event, link, broker);
                    return Err(err);
                }
                other => self.pipeline.handle_event(other, link, broker),
            }
        }
    }

    /// Tear down a link that never became a subscription.
    fn abandon_link(&self, link: &dyn TransportLink, err: IngestError) -> IngestError {
        if let Err(e) = link.disconnect() {
            log::debug!("disconnecting an unusable link: {}", e);
        }
        let mut state = self.session().lock();
        state.liveness.on_disconnect();
        state.note(log::Level::Warn, format!("session not started: {err}"));
        err
    }

    /// Disconnect the persistent subscription, if any.
    pub fn stop_session(&self) -> IngestResult<()> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(subscription) = active else {
            return Ok(());
        };

        let result = subscription.shut_down();

        let mut state = self.session().lock();
        if state.liveness.state() != LinkState::Disconnected {
            state.liveness.on_disconnect();
            state.note(log::Level::Info, "session stopped");
        }
        if let Err(e) = &result {
            state.note(log::Level::Warn, format!("disconnect failed: {e}"));
        }
        result
    }

    /// True while a persistent subscription is open and its link has not
    /// dropped.
    pub fn is_subscribed(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|subscription| !subscription.is_closed())
    }

    /// Central dispatch path for one transport message. Never fails; decode
    /// and parse problems are logged and the batch dropped.
    pub fn on_message_arrival(&self, topic: &str, payload: &[u8]) {
        self.pipeline.ingest(topic, payload);
    }

    /// `fetch_one` with the configured timeout.
    pub fn fetch(&self) -> IngestResult<FetchOutcome> {
        self.fetch_one(self.settings.fetch_timeout)
    }

    /// Open a short-lived link, wait for one message, disconnect.
    ///
    /// The first message that decodes is ingested exactly like a persistent
    /// delivery and returned. Undecodable messages are logged and waiting
    /// continues until `timeout`.
    pub fn fetch_one(&self, timeout: Duration) -> IngestResult<FetchOutcome> {
        let broker = self.broker().with_client_suffix("fetch");
        let session = self.session().as_ref();
        session.lock().note(
            log::Level::Info,
            format!("connecting to {} for a single message", broker.endpoint),
        );

        let (tx, rx) = mpsc::channel();
        let link = match self.transport.connect(&broker, tx) {
            Ok(link) => link,
            Err(e) => {
                session.lock().note(
                    log::Level::Warn,
                    format!("connection to {} failed: {}", broker.endpoint, e),
                );
                return Err(e);
            }
        };
        let guard = FetchLinkGuard { link, session };

        guard.link.subscribe(&broker.topic)?;
        session.lock().note(
            log::Level::Info,
            format!("subscribed to topic {}", broker.topic),
        );

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                session.lock().note(
                    log::Level::Warn,
                    format!("no message on {} within {:?}", broker.topic, timeout),
                );
                return Ok(FetchOutcome::Timeout);
            }

            match rx.recv_timeout((deadline - now).min(self.settings.poll_interval)) {
                Ok(TransportEvent::Message { topic, payload }) => {
                    if let Some(batch) = self.pipeline.ingest(&topic, &payload) {
                        return Ok(FetchOutcome::Message(batch));
                    }
                }
                Ok(TransportEvent::ConnAck {
                    accepted: false,
                    code,
                }) => {
                    return Err(IngestError::Transport(format!(
                        "connection to {} refused: code {}",
                        broker.endpoint, code
                    )));
                }
                Ok(TransportEvent::Disconnect { reason }) => {
                    return Err(IngestError::Transport(format!(
                        "link closed before a message arrived: {reason}"
                    )));
                }
                Ok(TransportEvent::ConnAck { accepted: true, .. })
                | Ok(TransportEvent::SubAck { .. }) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(IngestError::Transport(
                        "link closed before a message arrived".to_string(),
                    ));
                }
            }
        }
    }

    /// Clear the log, raw store and aggregate, leaving one marker entry.
    /// Liveness is untouched.
    pub fn reset(&self) {
        let mut state = self.session().lock();
        state.clear();
        state.note(log::Level::Info, "monitor cleared");
    }

    /// Replace the aggregate with caller-supplied detections, without a
    /// transport. Liveness is untouched.
    pub fn inject_synthetic_batch(&self, detections: Vec<Detection>) {
        let aggregation = AggregationState::rebuild(&detections, &self.pipeline.mapper);
        let count = detections.len();
        let batch = DetectionBatch {
            detections,
            summary: Map::new(),
        };

        let mut state = self.session().lock();
        state.install(aggregation, batch, Local::now());
        state.note(
            log::Level::Info,
            format!("synthetic batch loaded: {count} person detections"),
        );
    }

    pub fn aggregation_state(&self) -> Arc<AggregationState> {
        self.session().aggregation_state()
    }

    pub fn log_snapshot(&self) -> Vec<LogEntry> {
        self.session().log_snapshot()
    }

    pub fn raw_message_snapshot(&self) -> Vec<RawMessage> {
        self.session().raw_message_snapshot()
    }

    pub fn is_live(&self) -> bool {
        self.session().is_live()
    }

    pub fn last_update(&self) -> Option<chrono::DateTime<Local>> {
        self.session().last_update()
    }

    pub fn link_state(&self) -> LinkState {
        self.session().link_state()
    }
}

impl<T: Transport> Drop for IngestionController<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_session() {
            log::warn!("disconnect on shutdown failed: {}", e);
        }
    }
}
