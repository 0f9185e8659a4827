//! Wire protocol for the dev packager connection.
//!
//! Every frame is one JSON object. There is no explicit type tag; the three
//! shapes are told apart by which fields are present:
//!
//! | Shape        | `id` | `method` | `result` / `error` |
//! |--------------|------|----------|--------------------|
//! | Request      | yes  | yes      | neither            |
//! | Response     | yes  | no       | exactly one        |
//! | Notification | no   | yes      | neither            |
//!
//! Encoded frames also carry `"version": 2`. Frames without a `version` field
//! are accepted; frames announcing any other version are rejected.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use packlink_core::prelude::*;

/// Protocol version written into every outbound frame.
pub const PROTOCOL_VERSION: u64 = 2;

// ---------------------------------------------------------------------------
// Method identifiers
// ---------------------------------------------------------------------------

/// Method names understood by convention between the app and the packager.
///
/// Parsing is total: names with no dedicated variant become
/// [`PackagerMethod::Custom`], so new commands can be registered without
/// touching this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackagerMethod {
    /// Reload the JS bundle (notification).
    Reload,
    /// Toggle the developer menu (notification).
    DevMenu,
    /// Capture a heap snapshot (request).
    CaptureHeap,
    /// Toggle the sampling profiler (request).
    PokeSamplingProfiler,
    /// Open a file on the device (request).
    FileOpen,
    /// Read from an open file (request).
    FileRead,
    /// Write to an open file (request).
    FileWrite,
    /// Close an open file (request).
    FileClose,
    /// Any other method name.
    Custom(String),
}

impl PackagerMethod {
    pub fn as_str(&self) -> &str {
        match self {
            PackagerMethod::Reload => "reload",
            PackagerMethod::DevMenu => "devMenu",
            PackagerMethod::CaptureHeap => "captureHeap",
            PackagerMethod::PokeSamplingProfiler => "pokeSamplingProfiler",
            PackagerMethod::FileOpen => "fopen",
            PackagerMethod::FileRead => "fread",
            PackagerMethod::FileWrite => "fwrite",
            PackagerMethod::FileClose => "fclose",
            PackagerMethod::Custom(name) => name,
        }
    }
}

impl From<&str> for PackagerMethod {
    fn from(name: &str) -> Self {
        match name {
            "reload" => PackagerMethod::Reload,
            "devMenu" => PackagerMethod::DevMenu,
            "captureHeap" => PackagerMethod::CaptureHeap,
            "pokeSamplingProfiler" => PackagerMethod::PokeSamplingProfiler,
            "fopen" => PackagerMethod::FileOpen,
            "fread" => PackagerMethod::FileRead,
            "fwrite" => PackagerMethod::FileWrite,
            "fclose" => PackagerMethod::FileClose,
            other => PackagerMethod::Custom(other.to_string()),
        }
    }
}

impl From<String> for PackagerMethod {
    fn from(name: String) -> Self {
        match PackagerMethod::from(name.as_str()) {
            PackagerMethod::Custom(_) => PackagerMethod::Custom(name),
            known => known,
        }
    }
}

impl From<&PackagerMethod> for PackagerMethod {
    fn from(method: &PackagerMethod) -> Self {
        method.clone()
    }
}

impl fmt::Display for PackagerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Outcome carried by a response frame. Exactly one of `result` / `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(Value),
}

/// One frame on the packager connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// The sender expects exactly one [`Message::Response`] with the same `id`.
    Request {
        id: u64,
        method: PackagerMethod,
        params: Option<Value>,
    },
    /// Reply to an earlier request.
    Response { id: u64, payload: ResponsePayload },
    /// Fire-and-forget; no response is expected.
    Notification {
        method: PackagerMethod,
        params: Option<Value>,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<PackagerMethod>, params: Option<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<PackagerMethod>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn result(id: u64, result: Value) -> Self {
        Message::Response {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: u64, error: impl Into<Value>) -> Self {
        Message::Response {
            id,
            payload: ResponsePayload::Error(error.into()),
        }
    }

    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RequestFrame<'a> {
    version: u64,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct ResultFrame<'a> {
    version: u64,
    id: u64,
    result: &'a Value,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    version: u64,
    id: u64,
    error: &'a Value,
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    version: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

/// Serialize a message to its JSON text frame.
pub fn encode(message: &Message) -> Result<String> {
    let text = match message {
        Message::Request { id, method, params } => serde_json::to_string(&RequestFrame {
            version: PROTOCOL_VERSION,
            id: *id,
            method: method.as_str(),
            params: params.as_ref(),
        })?,
        Message::Response {
            id,
            payload: ResponsePayload::Result(result),
        } => serde_json::to_string(&ResultFrame {
            version: PROTOCOL_VERSION,
            id: *id,
            result,
        })?,
        Message::Response {
            id,
            payload: ResponsePayload::Error(error),
        } => serde_json::to_string(&ErrorFrame {
            version: PROTOCOL_VERSION,
            id: *id,
            error,
        })?,
        Message::Notification { method, params } => {
            serde_json::to_string(&NotificationFrame {
                version: PROTOCOL_VERSION,
                method: method.as_str(),
                params: params.as_ref(),
            })?
        }
    };
    Ok(text)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse one inbound frame.
///
/// Returns [`Error::Protocol`] for malformed JSON and for objects matching
/// none of the three shapes. Callers drop such frames; they never tear down
/// the connection.
pub fn decode(frame: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| Error::protocol(format!("malformed JSON frame: {e}")))?;

    let Value::Object(mut object) = value else {
        return Err(Error::protocol("frame is not a JSON object"));
    };

    check_version(&object)?;

    let id = take_id(&mut object)?;
    let method = take_method(&mut object)?;
    let params = object.remove("params");
    let result = object.remove("result");
    let error = object.remove("error");

    match (id, method, result, error) {
        (Some(id), Some(method), None, None) => Ok(Message::Request { id, method, params }),
        (Some(id), None, Some(result), None) => Ok(Message::result(id, result)),
        (Some(id), None, None, Some(error)) => Ok(Message::error(id, error)),
        (None, Some(method), None, None) => Ok(Message::Notification { method, params }),
        (Some(id), None, Some(_), Some(_)) => Err(Error::protocol(format!(
            "response {id} carries both result and error"
        ))),
        (Some(id), None, None, None) => Err(Error::protocol(format!(
            "frame with id {id} has neither method, result nor error"
        ))),
        _ => Err(Error::protocol("frame matches no known message shape")),
    }
}

fn check_version(object: &Map<String, Value>) -> Result<()> {
    match object.get("version") {
        None | Some(Value::Null) => Ok(()),
        Some(v) if v.as_u64() == Some(PROTOCOL_VERSION) => Ok(()),
        Some(other) => Err(Error::protocol(format!(
            "unsupported protocol version {other}, expected {PROTOCOL_VERSION}"
        ))),
    }
}

fn take_id(object: &mut Map<String, Value>) -> Result<Option<u64>> {
    match object.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| Error::protocol(format!("id must be a non-negative integer, got {v}"))),
    }
}

fn take_method(object: &mut Map<String, Value>) -> Result<Option<PackagerMethod>> {
    match object.remove("method") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(PackagerMethod::from(name))),
        Some(other) => Err(Error::protocol(format!(
            "method must be a string, got {other}"
        ))),
    }
}

/// Render an error payload received from the peer as a human-readable string.
pub fn error_payload_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        },
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
