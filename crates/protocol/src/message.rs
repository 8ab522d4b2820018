//! Protocol message shapes.
//!
//! Every frame carries exactly one JSON object, which is one of:
//!
//! | Shape | Fields | Direction |
//! |-------|--------|-----------|
//! | [`Request`] | `id`, `guid`, `method`, `params` | client → driver |
//! | [`Response`] | `id`, `result` or `error` | driver → client |
//! | [`Event`] | `guid`, `method`, `params` (no `id`) | driver → client |
//!
//! The reserved event methods [`CREATE_METHOD`] and [`DISPOSE_METHOD`] manage
//! the remote object graph and are never surfaced as application events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event method announcing a new remote object under the addressed parent.
pub const CREATE_METHOD: &str = "__create__";

/// Event method announcing that the addressed object is gone.
pub const DISPOSE_METHOD: &str = "__dispose__";

/// Optional metadata attached to a call.
///
/// Newer drivers expect it on every call; older ones ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unix timestamp in milliseconds
    #[serde(rename = "wallTime")]
    pub wall_time: i64,
    /// Whether this is an internal call (not user-facing API)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// Optional title for the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Metadata {
    /// Create minimal metadata with the current timestamp.
    pub fn now() -> Self {
        let wall_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            wall_time,
            internal: Some(false),
            title: None,
        }
    }
}

/// Call sent to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Connection-wide request id used to correlate the reply
    pub id: u32,
    /// GUID of the target object (format: "type@hash")
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Method name to invoke
    pub method: String,
    /// Method parameters as JSON object
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Serde helpers for `Arc<str>` serialization
pub fn serialize_arc_str<S>(arc: &Arc<str>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(arc)
}

pub fn deserialize_arc_str<'de, D>(deserializer: D) -> std::result::Result<Arc<str>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(Arc::from(s.as_str()))
}

/// Reply to a prior [`Request`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response correlates to
    pub id: u32,
    /// Success result (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorWrapper>,
}

/// Error field of a [`Response`].
///
/// Drivers send either the payload itself or the payload nested under an
/// `error` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorWrapper {
    /// `{"error": {"message": ...}}`
    Nested { error: ErrorPayload },
    /// `{"message": ...}`
    Flat(ErrorPayload),
}

impl ErrorWrapper {
    pub fn into_payload(self) -> ErrorPayload {
        match self {
            ErrorWrapper::Nested { error } | ErrorWrapper::Flat(error) => error,
        }
    }
}

/// Error details reported by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    /// Error type name (e.g., "TimeoutError", "TargetClosedError")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Asynchronous notification addressed to one remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// GUID of the object the event is addressed to
    #[serde(
        serialize_with = "serialize_arc_str",
        deserialize_with = "deserialize_arc_str"
    )]
    pub guid: Arc<str>,
    /// Event method name
    pub method: String,
    /// Event parameters as JSON object
    #[serde(default)]
    pub params: Value,
}

impl Event {
    /// Returns true for `__create__` / `__dispose__`.
    pub fn is_lifecycle(&self) -> bool {
        self.method == CREATE_METHOD || self.method == DISPOSE_METHOD
    }
}

/// Discriminated union of protocol messages.
///
/// Variant order matters for the untagged representation: a [`Request`] has
/// every field a [`Response`] has, and only an [`Event`] lacks `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Call message (`id`, `guid` and `method`)
    Request(Request),
    /// Reply message (has `id` only)
    Response(Response),
    /// Event message (no `id` field)
    Event(Event),
}

/// `params` of a `__create__` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    /// Remote type tag (e.g., "Page")
    #[serde(rename = "type")]
    pub type_name: String,
    pub guid: String,
    #[serde(default)]
    pub initializer: Value,
}

/// `params` of a `__dispose__` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisposeParams {
    /// `"gc"` when the driver collected the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
