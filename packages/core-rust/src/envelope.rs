//! The `{ meta, data }` envelope exchanged over HTTP and the broker.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{BaseError, ErrorKind};
use crate::schema::{FieldRule, ObjectSchema, Violation};

/// Trace id reported when an inbound body carried none.
pub const UNKNOWN_TRACE_ID: &str = "unknown";

/// The caller's authentication assertion. Exactly one is present per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Identity {
    UserId(String),
    PublicKey(String),
    SecretKey(String),
    TicketId(String),
    Source(String),
}

impl Identity {
    /// Wire names of the identity fields, in precedence order.
    pub const FIELDS: [&'static str; 5] = ["userId", "publicKey", "secretKey", "ticketId", "source"];

    /// Wire name of the asserted field.
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::UserId(_) => "userId",
            Self::PublicKey(_) => "publicKey",
            Self::SecretKey(_) => "secretKey",
            Self::TicketId(_) => "ticketId",
            Self::Source(_) => "source",
        }
    }

    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::UserId(v)
            | Self::PublicKey(v)
            | Self::SecretKey(v)
            | Self::TicketId(v)
            | Self::Source(v) => v,
        }
    }
}

/// Originating request context, carried unchanged between services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub trace_id: String,
    pub ip_address: String,
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Envelope metadata. `service_id` and `timestamp` are rewritten on egress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub service_id: String,
    pub timestamp: String,
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl Meta {
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.request.trace_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub meta: Meta,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(meta: Meta, data: T) -> Self {
        Self { meta, data }
    }
}

/// Broker message value: the bare event segment plus the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    pub content: Envelope,
}

/// Rendered error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// A string, or an object for `expose` errors.
    pub message: Value,
    pub status: u16,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    /// Trace id of the echoed meta, or [`UNKNOWN_TRACE_ID`].
    #[must_use]
    pub fn trace_id(&self) -> &str {
        self.meta
            .as_ref()
            .and_then(|meta| meta.pointer("/request/traceId"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_TRACE_ID)
    }
}

// ---------------------------------------------------------------------------
// Meta regeneration
// ---------------------------------------------------------------------------

/// Rewrites outbound meta with this service's identity and the current time.
#[derive(Debug, Clone)]
pub struct MetaStamp {
    service_id: String,
}

impl MetaStamp {
    #[must_use]
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Regenerated meta: keeps `request` and `session_id`, drops `origin_id`.
    #[must_use]
    pub fn stamp(&self, meta: &Meta) -> Meta {
        Meta {
            service_id: self.service_id.clone(),
            timestamp: now(),
            request: meta.request.clone(),
            session_id: meta.session_id.clone(),
            origin_id: None,
        }
    }

    /// Same as [`MetaStamp::stamp`] for a meta that never passed validation,
    /// used when echoing meta on an error response.
    #[must_use]
    pub fn stamp_loose(&self, meta: &Value) -> Option<Value> {
        let source = meta.as_object()?;
        let mut out = Map::new();
        out.insert("serviceId".into(), Value::String(self.service_id.clone()));
        out.insert("timestamp".into(), Value::String(now()));
        for key in ["request", "sessionId"] {
            if let Some(value) = source.get(key) {
                out.insert(key.into(), value.clone());
            }
        }
        Some(Value::Object(out))
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Schema of [`Request`].
#[must_use]
pub fn request_schema() -> ObjectSchema {
    let schema = ObjectSchema::new()
        .field("traceId", FieldRule::string().required())
        .field("ipAddress", FieldRule::ip().required());
    Identity::FIELDS
        .iter()
        .fold(schema, |schema, name| schema.field(*name, FieldRule::string()))
        .field("host", FieldRule::string())
        .field("userAgent", FieldRule::string())
        .field("method", FieldRule::string())
        .exactly_one_of(Identity::FIELDS)
}

/// Schema of [`Meta`].
#[must_use]
pub fn meta_schema() -> ObjectSchema {
    ObjectSchema::new()
        .field("originId", FieldRule::string())
        .field("sessionId", FieldRule::string())
        .field("serviceId", FieldRule::string().required())
        .field("timestamp", FieldRule::string().required())
        .field("request", FieldRule::object(request_schema()).required())
}

/// Schema of an inbound envelope: validated meta and an object payload.
#[must_use]
pub fn envelope_schema() -> ObjectSchema {
    ObjectSchema::new()
        .field("meta", FieldRule::object(meta_schema()).required())
        .field("data", FieldRule::object(ObjectSchema::new()).required())
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope at {}: {}", .0.label, .0.message_key())]
    Invalid(Violation),
    #[error("envelope decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<EnvelopeError> for BaseError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Invalid(violation) => violation.into(),
            EnvelopeError::Decode(_) => BaseError::malformed_body(),
        }
    }
}

/// Validates `body` against [`envelope_schema`] and decodes it.
///
/// # Errors
///
/// Returns the first schema violation, or a decode error if the validated
/// document still does not fit the typed model.
pub fn parse_envelope(body: Value) -> Result<Envelope, EnvelopeError> {
    envelope_schema()
        .validate(&body)
        .map_err(EnvelopeError::Invalid)?;
    Ok(serde_json::from_value(body)?)
}
