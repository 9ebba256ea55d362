//! MQTT transport over rumqttc.
//!
//! Each link owns a rumqttc `Client` and a thread that drives the
//! `Connection` event loop, translating packets into `TransportEvent`s. The
//! loop stops on the first connection error; reconnecting is left to the
//! caller.

use rumqttc::v5::mqttbytes::v5::ConnectReturnCode;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::{Outgoing, Transport as WireTransport};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use super::{BrokerSettings, MqttEndpoint, Transport, TransportEvent, TransportLink};
use crate::error::{IngestError, IngestResult};

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 10;

/// Production transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for MqttTransport {
    fn connect(
        &self,
        broker: &BrokerSettings,
        events: Sender<TransportEvent>,
    ) -> IngestResult<Arc<dyn TransportLink>> {
        let mut options = MqttOptions::new(
            broker.client_id.clone(),
            broker.endpoint.host.clone(),
            broker.endpoint.port,
        );
        options.set_keep_alive(broker.keep_alive);
        options.set_clean_start(true);
        if let Some(credentials) = &broker.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        options.set_transport(wire_transport(&broker.endpoint, broker.tls_ca.as_deref()));

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let event_loop = std::thread::Builder::new()
            .name(format!("mqtt-{}", broker.client_id))
            .spawn(move || pump_events(connection, events))
            .map_err(|e| IngestError::Transport(format!("failed to start MQTT event loop: {e}")))?;

        log::debug!(
            "MQTT link opened to {} (client: {}, auth: {})",
            broker.endpoint,
            broker.client_id,
            broker.credentials.is_some()
        );
        Ok(Arc::new(MqttLink {
            client,
            event_loop: Mutex::new(Some(event_loop)),
        }))
    }
}

fn wire_transport(endpoint: &MqttEndpoint, ca: Option<&[u8]>) -> WireTransport {
    if !endpoint.use_tls {
        return WireTransport::tcp();
    }
    match ca {
        Some(ca) => WireTransport::tls(ca.to_vec(), None, None),
        None => WireTransport::tls_with_default_config(),
    }
}

fn pump_events(mut connection: Connection, events: Sender<TransportEvent>) {
    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => TransportEvent::ConnAck {
                accepted: matches!(ack.code, ConnectReturnCode::Success),
                code: format!("{:?}", ack.code),
            },
            Ok(Event::Incoming(Incoming::Publish(publish))) => TransportEvent::Message {
                topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Incoming(Incoming::SubAck(ack))) => TransportEvent::SubAck {
                granted: format!("{:?}", ack.return_codes),
            },
            Ok(Event::Incoming(Incoming::Disconnect(disconnect))) => {
                let _ = events.send(TransportEvent::Disconnect {
                    reason: format!("{:?}", disconnect.reason_code),
                });
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Disconnect {
                    reason: "client disconnect".to_string(),
                });
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(TransportEvent::Disconnect {
                    reason: e.to_string(),
                });
                break;
            }
        };
        if events.send(event).is_err() {
            // Receiver gone; nobody is listening any more.
            break;
        }
    }
}

struct MqttLink {
    client: Client,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TransportLink for MqttLink {
    fn subscribe(&self, topic: &str) -> IngestResult<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(IngestError::transport)
    }

    fn disconnect(&self) -> IngestResult<()> {
        // Fails when the event loop already stopped; still join it.
        let result = self.client.disconnect().map_err(IngestError::transport);
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        result
    }
}
