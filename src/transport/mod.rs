//! Transport seam between the pub/sub client and the ingestion controller.
//!
//! A `Transport` opens links. Each link forwards what the broker tells it as
//! `TransportEvent`s into the channel it was given, from its own thread, and
//! accepts `subscribe`/`disconnect` commands from any thread.

pub mod endpoint;
pub mod mqtt;

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use crate::error::IngestResult;

pub use endpoint::{parse_mqtt_endpoint, MqttEndpoint, DEFAULT_MQTTS_PORT, DEFAULT_MQTT_PORT};
pub use mqtt::MqttTransport;

pub const DEFAULT_TOPIC: &str = "Npersonas";
pub const DEFAULT_CLIENT_ID: &str = "zone_monitor";
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Notifications delivered by a transport link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker answered the connect request.
    ConnAck { accepted: bool, code: String },
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Broker confirmed a subscription.
    SubAck { granted: String },
    /// Link closed, by the broker, the network, or a local disconnect.
    Disconnect { reason: String },
}

/// Opaque broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open one link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub endpoint: MqttEndpoint,
    pub topic: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// PEM CA bundle for TLS; system roots when absent.
    pub tls_ca: Option<Vec<u8>>,
}

impl BrokerSettings {
    pub fn new(host: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            endpoint: MqttEndpoint::new(host, port),
            topic: topic.into(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            credentials: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls_ca: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Same broker under a distinct client id, for a short-lived side link.
    pub fn with_client_suffix(&self, suffix: &str) -> Self {
        Self {
            client_id: format!("{}-{}", self.client_id, suffix),
            ..self.clone()
        }
    }
}

/// Opens links to a broker.
pub trait Transport: Send + Sync {
    /// Open a link and start delivering events into `events`.
    ///
    /// Errors only for failures that happen synchronously (bad settings,
    /// thread spawn). Broker refusals arrive later as `ConnAck` or
    /// `Disconnect` events.
    fn connect(
        &self,
        broker: &BrokerSettings,
        events: Sender<TransportEvent>,
    ) -> IngestResult<Arc<dyn TransportLink>>;
}

/// An open link.
pub trait TransportLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> IngestResult<()>;

    /// Close the link. Once this returns the link no longer sends events.
    fn disconnect(&self) -> IngestResult<()>;
}
