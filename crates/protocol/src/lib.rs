//! Gateway WebSocket protocol definitions.
//!
//! All communication uses UTF-8 JSON text frames, one frame per WebSocket message.
//!
//! Frame types:
//! - `RequestFrame`: client → gateway call, correlated by `id`
//! - `ResponseFrame`: gateway → client, exactly one per request id, terminal
//! - `EventFrame`: gateway → client server-push, zero or more per operation

pub mod params;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use {
    params::{
        AgentOptions, ChatCancelParams, ChatRole, ChatSendParams, ChatTurn, ImageAttachment,
        SystemEventParams, ValidateParams, parse_params,
    },
    validate::{FrameError, parse_frame},
};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB

/// Correlation id of the identification response sent when a socket opens.
pub const HELLO_ID: &str = "hello";

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    // protocol
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";

    // routing
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";

    // handler / domain
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const LLM_ERROR: &str = "LLM_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Method and event names ───────────────────────────────────────────────────

pub mod methods {
    pub const PING: &str = "ping";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_CANCEL: &str = "chat.cancel";
    pub const CHAT_ACTIVE: &str = "chat.active";
    pub const HEALTH: &str = "health";
    pub const STATUS: &str = "status";
    pub const SYSTEM_PRESENCE: &str = "system-presence";
    pub const SYSTEM_EVENT: &str = "system-event";
}

pub mod events {
    pub const CHAT_CHUNK: &str = "chat.chunk";
    pub const CHAT_DONE: &str = "chat.done";
    pub const CHAT_CANCELLED: &str = "chat.cancelled";
    pub const AGENT_TOOL_START: &str = "agent.tool_start";
    pub const AGENT_TOOL_RESULT: &str = "agent.tool_result";
    pub const AGENT_TURN_COMPLETE: &str = "agent.turn_complete";
    pub const TICK: &str = "tick";
}

pub const KNOWN_EVENTS: &[&str] = &[
    events::CHAT_CHUNK,
    events::CHAT_DONE,
    events::CHAT_CANCELLED,
    events::AGENT_TOOL_START,
    events::AGENT_TOOL_RESULT,
    events::AGENT_TURN_COMPLETE,
    events::TICK,
];

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub r#type: String, // always "req"
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RequestFrame {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Gateway → client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub r#type: String, // always "res"
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            r#type: "res".into(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Consume the frame into its outcome.
    pub fn into_result(self) -> Result<serde_json::Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                ErrorShape::new(error_codes::INTERNAL, "error response without error body")
            }))
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub r#type: String, // always "event"
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
        }
    }

    pub fn unsequenced(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            r#type: "event".into(),
            event: event.into(),
            payload: Some(payload),
            seq: None,
        }
    }

    /// The `requestId` a request-scoped event belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("requestId"))
            .and_then(|v| v.as_str())
    }
}

/// Discriminated union of all frame types, as produced by [`parse_frame`].
#[derive(Debug, Clone)]
pub enum GatewayFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
}

impl GatewayFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "req",
            Self::Response(_) => "res",
            Self::Event(_) => "event",
        }
    }
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Payload of the identification response sent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}
