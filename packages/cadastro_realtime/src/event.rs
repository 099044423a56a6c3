//! Event kinds and payloads carried on the registry's event stream.
//!
//! Raw frame names are turned into the closed [`EventKind`] set here; frames
//! whose name is not recognised are dropped at this boundary and never reach
//! the dispatcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::FrameError;
use crate::records::Resource;
use crate::sse::SseFrame;

/// The enumerated set of named frames the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Connected,
    Heartbeat,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::Connected,
        Self::Heartbeat,
        Self::RecordCreated,
        Self::RecordUpdated,
        Self::RecordDeleted,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Heartbeat => "heartbeat",
            Self::RecordCreated => "recordCreated",
            Self::RecordUpdated => "recordUpdated",
            Self::RecordDeleted => "recordDeleted",
        }
    }

    /// Map a frame name to a kind. `keepalive` is an alias of `heartbeat`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "connected" => Some(Self::Connected),
            "heartbeat" | "keepalive" => Some(Self::Heartbeat),
            "recordCreated" => Some(Self::RecordCreated),
            "recordUpdated" => Some(Self::RecordUpdated),
            "recordDeleted" => Some(Self::RecordDeleted),
            _ => None,
        }
    }

    /// Record events carry an [`EventEnvelope`]; transport events do not.
    pub fn is_record_event(&self) -> bool {
        matches!(
            self,
            Self::RecordCreated | Self::RecordUpdated | Self::RecordDeleted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// Identifier of a registry record. The backend sends either strings or
/// integers; both are normalised to their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_id(deserializer).map(Self)
    }
}

/// Identifier of an authenticated user, normalised like [`RecordId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_id(deserializer).map(Self)
    }
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    })
}

/// Accepts RFC 3339 strings or integer epoch milliseconds.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        RawTimestamp::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}

/// The affected domain entity: its id, display label, and whatever else the
/// backend chose to include.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRef {
    pub id: RecordId,
    #[serde(default, alias = "nome", alias = "label")]
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RecordRef {
    pub fn new(id: impl Into<RecordId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// The resource the backend tagged this record with (`resource` or
    /// `recurso`), if any.
    pub fn resource(&self) -> Option<Resource> {
        ["resource", "recurso"]
            .iter()
            .find_map(|key| self.extra.get(*key)?.as_str()?.parse().ok())
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.extra
            .insert("resource".to_string(), resource.to_string().into());
        self
    }
}

/// Payload of one record event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub record: RecordRef,
    #[serde(alias = "author_id")]
    pub author_id: UserId,
    #[serde(default, alias = "author_role", skip_serializing_if = "Option::is_none")]
    pub author_role: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Informational payload of the `connected` handshake frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A decoded frame, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(ConnectedInfo),
    Heartbeat,
    RecordCreated(EventEnvelope),
    RecordUpdated(EventEnvelope),
    RecordDeleted(EventEnvelope),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected(_) => EventKind::Connected,
            Self::Heartbeat => EventKind::Heartbeat,
            Self::RecordCreated(_) => EventKind::RecordCreated,
            Self::RecordUpdated(_) => EventKind::RecordUpdated,
            Self::RecordDeleted(_) => EventKind::RecordDeleted,
        }
    }

    pub fn envelope(&self) -> Option<&EventEnvelope> {
        match self {
            Self::RecordCreated(env) | Self::RecordUpdated(env) | Self::RecordDeleted(env) => {
                Some(env)
            }
            Self::Connected(_) | Self::Heartbeat => None,
        }
    }

    /// Decode a raw frame.
    ///
    /// Returns `Ok(None)` for frames that are not part of the enumerated set.
    /// Unnamed frames (`message`) are classified by the `type` field of their
    /// JSON payload.
    pub fn from_frame(frame: &SseFrame) -> Result<Option<Self>, FrameError> {
        let kind = match EventKind::from_wire(&frame.event) {
            Some(kind) => kind,
            None if frame.event == "message" => match payload_type(&frame.data) {
                Some(kind) => kind,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        Self::decode(kind, &frame.data).map(Some)
    }

    fn decode(kind: EventKind, data: &str) -> Result<Self, FrameError> {
        let json_err = |source| FrameError::Json {
            event: kind.wire_name().to_string(),
            source,
        };

        match kind {
            EventKind::Heartbeat => Ok(Self::Heartbeat),
            EventKind::Connected => {
                let trimmed = data.trim();
                if trimmed.is_empty() {
                    return Ok(Self::Connected(ConnectedInfo::default()));
                }
                // Some backends send a plain greeting instead of JSON.
                match serde_json::from_str::<ConnectedInfo>(trimmed) {
                    Ok(info) => Ok(Self::Connected(info)),
                    Err(_) => Ok(Self::Connected(ConnectedInfo {
                        message: Some(trimmed.to_string()),
                        ..Default::default()
                    })),
                }
            }
            EventKind::RecordCreated => serde_json::from_str(data)
                .map(Self::RecordCreated)
                .map_err(json_err),
            EventKind::RecordUpdated => serde_json::from_str(data)
                .map(Self::RecordUpdated)
                .map_err(json_err),
            EventKind::RecordDeleted => serde_json::from_str(data)
                .map(Self::RecordDeleted)
                .map_err(json_err),
        }
    }
}

fn payload_type(data: &str) -> Option<EventKind> {
    #[derive(Deserialize)]
    struct Typed {
        #[serde(rename = "type")]
        event_type: String,
    }

    serde_json::from_str::<Typed>(data)
        .ok()
        .and_then(|t| EventKind::from_wire(&t.event_type))
}
