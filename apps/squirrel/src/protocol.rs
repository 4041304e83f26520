use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub const EVENT_IDENTITY: &str = "identity";
pub const EVENT_LOG_LINE: &str = "log_line";
pub const EVENT_SUBSCRIBER_ACK: &str = "subscriber_ack";

/// Payload of an `identity` envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPayload {
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub broadcaster: bool,
    #[serde(default)]
    pub subscriber: bool,
}

impl IdentityPayload {
    pub fn broadcaster() -> Self {
        Self {
            peer_id: String::new(),
            broadcaster: true,
            subscriber: false,
        }
    }

    pub fn subscriber(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            broadcaster: false,
            subscriber: true,
        }
    }
}

/// Payload of a `log_line` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLinePayload {
    pub line: String,
}

/// Payload of a `subscriber_ack` envelope, emitted to a broadcaster when a
/// subscriber attaches to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub connected: bool,
}

/// Decoded event carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Identity(IdentityPayload),
    LogLine(LogLinePayload),
    SubscriberAck(AckPayload),
    /// Any event name this build does not know about. Kept so newer clients
    /// can talk to older relays.
    Unknown(String),
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Event::Identity(_) => EVENT_IDENTITY,
            Event::LogLine(_) => EVENT_LOG_LINE,
            Event::SubscriberAck(_) => EVENT_SUBSCRIBER_ACK,
            Event::Unknown(name) => name,
        }
    }
}

/// Tagged message wrapper exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub event: Event,
}

/// Shape of an envelope on the wire. The payload stays untyped until the
/// event name has been matched.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    id: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    pub fn new(id: impl Into<String>, event: Event) -> Self {
        Self {
            id: id.into(),
            event,
        }
    }

    pub fn identity(id: impl Into<String>, payload: IdentityPayload) -> Self {
        Self::new(id, Event::Identity(payload))
    }

    pub fn log_line(id: impl Into<String>, line: impl Into<String>) -> Self {
        Self::new(id, Event::LogLine(LogLinePayload { line: line.into() }))
    }

    pub fn subscriber_ack(id: impl Into<String>) -> Self {
        Self::new(id, Event::SubscriberAck(AckPayload { connected: true }))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let event = match wire.event.as_str() {
            EVENT_IDENTITY => Event::Identity(payload_as(&wire.event, wire.payload)?),
            EVENT_LOG_LINE => Event::LogLine(payload_as(&wire.event, wire.payload)?),
            EVENT_SUBSCRIBER_ACK => Event::SubscriberAck(payload_as(&wire.event, wire.payload)?),
            _ => Event::Unknown(wire.event),
        };
        Ok(Self { id: wire.id, event })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let payload = match &self.event {
            Event::Identity(payload) => serde_json::to_value(payload),
            Event::LogLine(payload) => serde_json::to_value(payload),
            Event::SubscriberAck(payload) => serde_json::to_value(payload),
            Event::Unknown(_) => Ok(Value::Object(Default::default())),
        }
        .map_err(ProtocolError::Encode)?;

        let wire = WireEnvelope {
            id: self.id.clone(),
            event: self.event.name().to_string(),
            payload,
        };
        serde_json::to_string(&wire).map_err(ProtocolError::Encode)
    }
}

fn payload_as<T>(event: &str, payload: Value) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(payload).map_err(|source| ProtocolError::Payload {
        event: event.to_string(),
        source,
    })
}
