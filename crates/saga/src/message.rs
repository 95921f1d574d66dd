//! Messages, envelopes and their wire representation.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::BusError;

/// Wire header names carried by every message.
pub mod headers {
    pub const SAGA_ID: &str = "saga-id";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PARENT_MESSAGE_ID: &str = "parent-message-id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const APPLICATION_ID: &str = "application-id";
    pub const MESSAGE_KIND: &str = "message-kind";
    pub const PUBLISHED_AT: &str = "published-at";
}

/// Shape of a message, which selects the handler entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Command,
    #[default]
    Event,
    /// An event announcing a failure; routed to compensation.
    FailedEvent,
    SuccessResponse,
    FailResponse,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::FailedEvent => "failed-event",
            MessageKind::SuccessResponse => "success-response",
            MessageKind::FailResponse => "fail-response",
        }
    }

    /// Responses are broadcast to every handler of their type.
    pub fn is_response(&self) -> bool {
        matches!(self, MessageKind::SuccessResponse | MessageKind::FailResponse)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(MessageKind::Command),
            "event" => Ok(MessageKind::Event),
            "failed-event" => Ok(MessageKind::FailedEvent),
            "success-response" => Ok(MessageKind::SuccessResponse),
            "fail-response" => Ok(MessageKind::FailResponse),
            other => Err(BusError::Malformed(format!("unknown message kind {other:?}"))),
        }
    }
}

/// A typed message that can flow through a saga.
///
/// `message_type` doubles as the step type under which the message is
/// recorded, so it must be unique across the application.
pub trait SagaMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn message_type() -> &'static str;

    fn kind() -> MessageKind {
        MessageKind::Event
    }

    /// Saga id carried in the message body, if the type has one.
    fn saga_id(&self) -> Option<SagaId> {
        None
    }

    /// Stamps a saga id into the message body. A no-op for types without one.
    fn set_saga_id(&mut self, _saga_id: SagaId) {}
}

/// A message plus the routing and causality metadata the engine needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    /// The message whose handling produced this one. `None` for a saga's root.
    pub parent_message_id: Option<MessageId>,
    pub saga_id: Option<SagaId>,
    pub correlation_id: Option<String>,
    pub message_type: String,
    /// Target handler. `None` lets the registry pick.
    pub handler_type: Option<String>,
    pub application_id: Option<String>,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    /// Transport headers not modelled above.
    pub headers: HashMap<String, String>,
}

impl MessageEnvelope {
    /// Creates a builder for a message of the given type.
    pub fn builder(message_type: impl Into<String>) -> MessageEnvelopeBuilder {
        MessageEnvelopeBuilder::new(message_type.into())
    }

    /// Creates a builder pre-filled from a typed message.
    pub fn for_message<M: SagaMessage>(
        message: &M,
    ) -> Result<MessageEnvelopeBuilder, serde_json::Error> {
        let builder = Self::builder(M::message_type())
            .kind(M::kind())
            .payload(message)?;
        Ok(match message.saga_id() {
            Some(saga_id) => builder.saga_id(saga_id),
            None => builder,
        })
    }

    /// Deserializes the payload into its original type.
    pub fn decode<M: SagaMessage>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Renders the envelope as a transport message: JSON body plus headers.
    pub fn to_inbound(&self) -> Result<InboundMessage, BusError> {
        let mut headers = self.headers.clone();
        headers.insert(headers::MESSAGE_ID.into(), self.message_id.to_string());
        headers.insert(headers::MESSAGE_KIND.into(), self.kind.to_string());
        headers.insert(headers::TIMESTAMP.into(), self.timestamp.to_rfc3339());
        if let Some(parent) = self.parent_message_id {
            headers.insert(headers::PARENT_MESSAGE_ID.into(), parent.to_string());
        }
        if let Some(saga_id) = self.saga_id {
            headers.insert(headers::SAGA_ID.into(), saga_id.to_string());
        }
        if let Some(correlation_id) = &self.correlation_id {
            headers.insert(headers::CORRELATION_ID.into(), correlation_id.clone());
        }
        if let Some(application_id) = &self.application_id {
            headers.insert(headers::APPLICATION_ID.into(), application_id.clone());
        }
        if let Some(published_at) = self.published_at {
            headers.insert(headers::PUBLISHED_AT.into(), published_at.to_rfc3339());
        }

        Ok(InboundMessage {
            body: serde_json::to_vec(&self.payload)?,
            message_type: self.message_type.clone(),
            handler_type: self.handler_type.clone(),
            headers,
        })
    }

    /// Rebuilds an envelope from a transport message.
    ///
    /// `message-id` is required; every other header is optional. A missing
    /// kind defaults to `event` and a missing timestamp to now.
    pub fn from_inbound(inbound: &InboundMessage) -> Result<Self, BusError> {
        let mut headers = inbound.headers.clone();

        let message_id = headers
            .remove(headers::MESSAGE_ID)
            .ok_or_else(|| BusError::Malformed(format!("missing {} header", headers::MESSAGE_ID)))
            .and_then(|raw| parse_id(headers::MESSAGE_ID, &raw))?;
        let parent_message_id = headers
            .remove(headers::PARENT_MESSAGE_ID)
            .map(|raw| parse_id(headers::PARENT_MESSAGE_ID, &raw))
            .transpose()?;
        let saga_id = headers
            .remove(headers::SAGA_ID)
            .map(|raw| parse_id(headers::SAGA_ID, &raw))
            .transpose()?;
        let kind = headers
            .remove(headers::MESSAGE_KIND)
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default();
        let timestamp = headers
            .remove(headers::TIMESTAMP)
            .map(|raw| parse_time(headers::TIMESTAMP, &raw))
            .transpose()?
            .unwrap_or_else(Utc::now);
        let published_at = headers
            .remove(headers::PUBLISHED_AT)
            .map(|raw| parse_time(headers::PUBLISHED_AT, &raw))
            .transpose()?;

        Ok(Self {
            message_id,
            parent_message_id,
            saga_id,
            correlation_id: headers.remove(headers::CORRELATION_ID),
            message_type: inbound.message_type.clone(),
            handler_type: inbound.handler_type.clone(),
            application_id: headers.remove(headers::APPLICATION_ID),
            kind,
            timestamp,
            published_at,
            payload: serde_json::from_slice(&inbound.body)?,
            headers,
        })
    }
}

fn parse_id<T: FromStr>(header: &str, raw: &str) -> Result<T, BusError> {
    raw.parse()
        .map_err(|_| BusError::Malformed(format!("invalid {header} header {raw:?}")))
}

fn parse_time(header: &str, raw: &str) -> Result<DateTime<Utc>, BusError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BusError::Malformed(format!("invalid {header} header {raw:?}: {e}")))
}

/// Builder for constructing message envelopes.
#[derive(Debug)]
pub struct MessageEnvelopeBuilder {
    envelope: MessageEnvelope,
}

impl MessageEnvelopeBuilder {
    fn new(message_type: String) -> Self {
        Self {
            envelope: MessageEnvelope {
                message_id: MessageId::new(),
                parent_message_id: None,
                saga_id: None,
                correlation_id: None,
                message_type,
                handler_type: None,
                application_id: None,
                kind: MessageKind::default(),
                timestamp: Utc::now(),
                published_at: None,
                payload: serde_json::Value::Null,
                headers: HashMap::new(),
            },
        }
    }

    /// Sets the message ID. If not set, a new ID is generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.envelope.message_id = id;
        self
    }

    pub fn parent_message_id(mut self, id: Option<MessageId>) -> Self {
        self.envelope.parent_message_id = id;
        self
    }

    pub fn saga_id(mut self, saga_id: SagaId) -> Self {
        self.envelope.saga_id = Some(saga_id);
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.envelope.correlation_id = correlation_id;
        self
    }

    pub fn handler_type(mut self, handler_type: Option<String>) -> Self {
        self.envelope.handler_type = handler_type;
        self
    }

    pub fn application_id(mut self, application_id: Option<String>) -> Self {
        self.envelope.application_id = application_id;
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.envelope.kind = kind;
        self
    }

    /// Sets the timestamp. If not set, the current time is used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.envelope.timestamp = timestamp;
        self
    }

    pub fn published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.envelope.published_at = Some(published_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.envelope.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.envelope.payload = payload;
        self
    }

    /// Adds a transport header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envelope.headers.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> MessageEnvelope {
        self.envelope
    }
}

/// A message as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub message_type: String,
    pub handler_type: Option<String>,
    pub headers: HashMap<String, String>,
}
