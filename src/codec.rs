//! Wire codec for the Exchange protocol.
//!
//! Outbound frames are JSON objects tagged with a `type` field. Binary
//! payloads are base64 on the wire (the transport frame is JSON-text
//! oriented); structured payloads are JSON-stringified before transmission.
//! See spec §4.2 for the exact schema this module implements.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// A message payload at the domain level, after content-type resolution.
///
/// Rust's type system performs the "content type inference" that the
/// source protocol does dynamically: callers pick [`Call::send_text`],
/// [`Call::send_structured`], or [`Call::send_binary`] (see `call.rs`)
/// instead of handing the codec an untyped value and asking it to guess.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Text(String),
    Structured(Value),
    Binary(Vec<u8>),
}

/// The wire shape of a `MSG` payload: `{ "data": ..., "content_type": ... }`.
///
/// `data` is typed as [`Value`] rather than `String` because inbound frames
/// are tolerated in both shapes for `content_type: "structured"` — already
/// parsed, or JSON-stringified (spec §9.1, Open Question (a)).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePayload {
    pub data: Value,
    pub content_type: String,
}

impl MessagePayload {
    /// Encode into the wire representation used inside an outbound `MSG`.
    pub fn to_wire(&self) -> Result<WirePayload> {
        match self {
            MessagePayload::Text(s) => Ok(WirePayload {
                data: Value::String(s.clone()),
                content_type: "text".to_string(),
            }),
            MessagePayload::Structured(value) => {
                let json = serde_json::to_string(value)
                    .map_err(|e| EngineError::InvalidPayload(e.to_string()))?;
                Ok(WirePayload {
                    data: Value::String(json),
                    content_type: "structured".to_string(),
                })
            }
            MessagePayload::Binary(bytes) => Ok(WirePayload {
                data: Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
                content_type: "binary".to_string(),
            }),
        }
    }

    /// Decode from the wire representation of an inbound `MSG`.
    ///
    /// Unknown or missing `content_type` is treated as `"text"`. A
    /// `"structured"` string that fails to re-parse is delivered as raw
    /// text rather than erroring (spec §4.2).
    pub fn from_wire(wire: WirePayload) -> Result<Self> {
        match wire.content_type.as_str() {
            "binary" => {
                let s = wire
                    .data
                    .as_str()
                    .ok_or_else(|| EngineError::Decode("binary data must be a string".into()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| EngineError::Decode(format!("invalid base64: {e}")))?;
                Ok(MessagePayload::Binary(bytes))
            }
            "structured" => match wire.data {
                Value::String(s) => match serde_json::from_str::<Value>(&s) {
                    Ok(value) => Ok(MessagePayload::Structured(value)),
                    Err(_) => Ok(MessagePayload::Text(s)),
                },
                other => Ok(MessagePayload::Structured(other)),
            },
            _ => match wire.data {
                Value::String(s) => Ok(MessagePayload::Text(s)),
                other => Ok(MessagePayload::Text(other.to_string())),
            },
        }
    }
}

/// Outbound frames the engine may send. Field names are already
/// snake_case by Rust convention, matching the wire schema without
/// renaming; only the `type` tag itself needs an explicit rename per
/// variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "REGISTER")]
    Register {
        address: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        concurrency_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_listeners: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_sessions: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pool_size: Option<u32>,
    },
    #[serde(rename = "UNREGISTER")]
    Unregister { address: String },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "DIAL")]
    Dial {
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    #[serde(rename = "ANSWER")]
    Answer { call_id: String },
    #[serde(rename = "HANGUP")]
    Hangup {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "MSG")]
    Msg {
        call_id: String,
        data: Value,
        content_type: String,
    },
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

/// Inbound frames the engine recognizes. `#[serde(other)]` absorbs any
/// `type` the engine does not know about, satisfying "unknown types are
/// ignored" without a separate pre-parse step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "REGISTERED")]
    Registered,
    #[serde(rename = "REGISTER_FAILED")]
    RegisterFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "RING")]
    Ring {
        call_id: String,
        from: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
    #[serde(rename = "CONNECTED")]
    Connected {
        call_id: String,
        #[serde(default)]
        to: Option<String>,
    },
    #[serde(rename = "BUSY")]
    Busy {
        to: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "MSG")]
    Msg {
        call_id: String,
        #[serde(flatten)]
        payload: WirePayload,
    },
    #[serde(rename = "HANGUP")]
    Hangup {
        call_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck,
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Parse a raw UTF-8 frame body into a known inbound frame.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::Decode(e.to_string()))
    }
}
