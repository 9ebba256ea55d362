//! Session state shared between the transport dispatcher and readers.
//!
//! Every container lives in one `SessionState` behind a single mutex, so a
//! reader never sees a torn buffer or an aggregate mixing two batches, and at
//! most one mutation runs at a time.

use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::buffer::{
    BoundedLog, LogEntry, RawMessage, RawMessageStore, DEFAULT_LOG_CAPACITY, DEFAULT_RAW_CAPACITY,
};
use crate::detection::DetectionBatch;
use crate::grid::{AggregationState, GridShape};
use crate::liveness::{ConnectionLiveness, LinkState, DEFAULT_LIVENESS_WINDOW};

/// Sizing for a session's containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub grid: GridShape,
    pub log_capacity: usize,
    pub raw_capacity: usize,
    pub liveness_window: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            grid: GridShape::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            raw_capacity: DEFAULT_RAW_CAPACITY,
            liveness_window: DEFAULT_LIVENESS_WINDOW,
        }
    }
}

/// The mutable state of one ingestion session.
#[derive(Debug)]
pub struct SessionState {
    pub(crate) log: BoundedLog,
    pub(crate) raw: RawMessageStore,
    pub(crate) aggregation: Arc<AggregationState>,
    pub(crate) liveness: ConnectionLiveness,
    pub(crate) last_payload: Option<DetectionBatch>,
    pub(crate) last_update: Option<DateTime<Local>>,
}

impl SessionState {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            log: BoundedLog::new(settings.log_capacity),
            raw: RawMessageStore::new(settings.raw_capacity),
            aggregation: Arc::new(AggregationState::empty(settings.grid)),
            liveness: ConnectionLiveness::new(settings.liveness_window),
            last_payload: None,
            last_update: None,
        }
    }

    /// Append to the session log and mirror to the process log.
    pub(crate) fn note(&mut self, level: log::Level, message: impl Into<String>) {
        let entry = LogEntry::now(message);
        log::log!(level, "{}", entry.message);
        self.log.append(entry);
    }

    pub(crate) fn record_raw(&mut self, topic: &str, payload: &str, at: DateTime<Local>) {
        self.raw.append(RawMessage {
            timestamp: at,
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Swap in a freshly built aggregate together with its batch.
    pub(crate) fn install(
        &mut self,
        aggregation: AggregationState,
        batch: DetectionBatch,
        at: DateTime<Local>,
    ) {
        self.aggregation = Arc::new(aggregation);
        self.last_payload = Some(batch);
        self.last_update = Some(at);
    }

    /// Clear log, raw store, aggregate and last payload. Liveness is kept.
    pub(crate) fn clear(&mut self) {
        let grid = self.aggregation.grid();
        self.log.clear();
        self.raw.clear();
        self.aggregation = Arc::new(AggregationState::empty(grid));
        self.last_payload = None;
    }
}

/// One ingestion session. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Session {
    settings: SessionSettings,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SessionState::new(&settings)),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Lock the state. A poisoned lock is recovered: every critical section
    /// leaves the state consistent before any step that can panic.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn aggregation_state(&self) -> Arc<AggregationState> {
        Arc::clone(&self.lock().aggregation)
    }

    pub fn log_snapshot(&self) -> Vec<LogEntry> {
        self.lock().log.snapshot()
    }

    pub fn raw_message_snapshot(&self) -> Vec<RawMessage> {
        self.lock().raw.snapshot()
    }

    pub fn is_live(&self) -> bool {
        self.lock().liveness.is_live()
    }

    pub fn is_live_at(&self, now: DateTime<Local>) -> bool {
        self.lock().liveness.is_live_at(now)
    }

    pub fn link_state(&self) -> LinkState {
        self.lock().liveness.state()
    }

    pub fn last_data_at(&self) -> Option<DateTime<Local>> {
        self.lock().liveness.last_data_at()
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.lock().last_update
    }

    pub fn last_payload(&self) -> Option<DetectionBatch> {
        self.lock().last_payload.clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}
