//! Inbound frame validation.
//!
//! Every text message is checked against the three frame shapes before it is
//! dispatched. Failures are scoped to the offending message: the caller answers
//! with [`FrameError::to_response`] and keeps the connection open.

use serde_json::{Map, Value};

use crate::{ErrorShape, EventFrame, GatewayFrame, RequestFrame, ResponseFrame, error_codes};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("missing or invalid 'type' (expected \"req\", \"res\" or \"event\")")]
    UnknownType,
    #[error("invalid '{field}': {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => error_codes::PAYLOAD_TOO_LARGE,
            _ => error_codes::INVALID_FRAME,
        }
    }

    /// The response sent for a rejected frame. The id is empty because a
    /// malformed frame cannot be trusted to carry a correlation id.
    pub fn to_response(&self) -> ResponseFrame {
        ResponseFrame::err("", ErrorShape::new(self.code(), self.to_string()))
    }
}

fn invalid(field: &'static str, reason: &'static str) -> FrameError {
    FrameError::InvalidField { field, reason }
}

fn require_non_empty_str(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<(), FrameError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(invalid(field, "must not be empty")),
        Some(_) => Err(invalid(field, "must be a string")),
        None => Err(invalid(field, "is required")),
    }
}

fn validate_request(obj: &Map<String, Value>) -> Result<(), FrameError> {
    require_non_empty_str(obj, "id")?;
    require_non_empty_str(obj, "method")?;
    match obj.get("params") {
        None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(invalid("params", "must be an object")),
    }
}

fn validate_response(obj: &Map<String, Value>) -> Result<(), FrameError> {
    match obj.get("id") {
        Some(Value::String(_)) => {},
        Some(_) => return Err(invalid("id", "must be a string")),
        None => return Err(invalid("id", "is required")),
    }
    match obj.get("ok") {
        Some(Value::Bool(_)) => {},
        Some(_) => return Err(invalid("ok", "must be a boolean")),
        None => return Err(invalid("ok", "is required")),
    }
    match obj.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Object(err)) => {
            if !matches!(err.get("code"), Some(Value::String(_))) {
                return Err(invalid("error.code", "must be a string"));
            }
            if !matches!(err.get("message"), Some(Value::String(_))) {
                return Err(invalid("error.message", "must be a string"));
            }
            Ok(())
        },
        Some(_) => Err(invalid("error", "must be an object")),
    }
}

fn validate_event(obj: &Map<String, Value>) -> Result<(), FrameError> {
    require_non_empty_str(obj, "event")?;
    match obj.get("seq") {
        None | Some(Value::Null) => Ok(()),
        Some(v) if v.as_u64().is_some() => Ok(()),
        Some(_) => Err(invalid("seq", "must be a non-negative integer")),
    }
}

/// Parse and validate one inbound text message.
pub fn parse_frame(text: &str, max_bytes: usize) -> Result<GatewayFrame, FrameError> {
    if text.len() > max_bytes {
        return Err(FrameError::TooLarge {
            size: text.len(),
            limit: max_bytes,
        });
    }

    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = &value else {
        return Err(FrameError::NotAnObject);
    };

    match obj.get("type").and_then(|t| t.as_str()) {
        Some("req") => {
            validate_request(obj)?;
            Ok(GatewayFrame::Request(serde_json::from_value::<RequestFrame>(
                value,
            )?))
        },
        Some("res") => {
            validate_response(obj)?;
            Ok(GatewayFrame::Response(
                serde_json::from_value::<ResponseFrame>(value)?,
            ))
        },
        Some("event") => {
            validate_event(obj)?;
            Ok(GatewayFrame::Event(serde_json::from_value::<EventFrame>(
                value,
            )?))
        },
        _ => Err(FrameError::UnknownType),
    }
}
