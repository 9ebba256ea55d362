//! Zone Monitor
//!
//! Ingests person-detection messages from an MQTT topic and keeps the state a
//! live occupancy view needs: which grid zone each detected person is in,
//! bounded histories of log lines and raw messages, and whether the broker
//! link is currently usable.
//!
//! # Pipeline
//!
//! 1. A transport link delivers a message (`transport`).
//! 2. The payload is decoded into a `DetectionBatch` (`detection`).
//! 3. Every detection is mapped onto the grid and the aggregate is rebuilt
//!    from scratch (`grid`).
//! 4. Raw message, log lines and liveness are recorded in the `Session`.
//!
//! Decode failures only produce a log line; the aggregate from the previous
//! batch stays in place.
//!
//! # Module Structure
//!
//! - `buffer`: bounded FIFO histories (`BoundedLog`, `RawMessageStore`)
//! - `detection`: payload decoding and the demonstration batch
//! - `grid`: coordinate-to-zone mapping and `AggregationState`
//! - `liveness`: link state and the data-arrival liveness heuristic
//! - `session`: the lock-protected state shared with readers
//! - `controller`: subscription lifecycle, dispatch, one-shot fetch
//! - `transport`: transport traits and the rumqttc implementation
//! - `config`: file and environment configuration

pub mod buffer;
pub mod config;
pub mod controller;
pub mod detection;
pub mod error;
pub mod grid;
pub mod liveness;
pub mod session;
pub mod transport;

pub use buffer::{BoundedBuffer, BoundedLog, LogEntry, RawMessage, RawMessageStore};
pub use config::MonitorConfig;
pub use controller::{ControllerSettings, FetchOutcome, IngestionController};
pub use detection::{decode_payload, demo_batch, Detection, DetectionBatch};
pub use error::{IngestError, IngestResult};
pub use grid::{map_to_zone, AggregationState, FrameResolution, GridMapper, GridShape, Zone};
pub use liveness::{ConnectionLiveness, LinkState};
pub use session::{Session, SessionSettings};
pub use transport::{
    BrokerSettings, Credentials, MqttEndpoint, MqttTransport, Transport, TransportEvent,
    TransportLink,
};
