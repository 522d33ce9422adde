//! Per-method parameter schemas.
//!
//! Typed handlers receive their parameters already deserialized and validated;
//! a mismatch is answered with `INVALID_PARAMS` before the handler runs.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{ErrorShape, error_codes};

/// Semantic checks that run after deserialization.
pub trait ValidateParams {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Deserialize and validate request params into `P`.
///
/// Absent or null params are treated as an empty object so that parameterless
/// methods and structs made entirely of defaults both work.
pub fn parse_params<P>(params: Option<serde_json::Value>) -> Result<P, ErrorShape>
where
    P: DeserializeOwned + ValidateParams,
{
    let value = params
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    let parsed: P = serde_json::from_value(value).map_err(|e| {
        ErrorShape::new(error_codes::INVALID_PARAMS, format!("invalid params: {e}"))
    })?;
    parsed
        .validate()
        .map_err(|msg| ErrorShape::new(error_codes::INVALID_PARAMS, msg))?;
    Ok(parsed)
}

// ── chat.send ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prior message of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Inline image, base64 encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOptions {
    /// Upper bound on LLM round-trips in agent mode.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Restrict the agent to these tool names.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Extra instructions appended to the system prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
    #[serde(default)]
    pub agent_mode: bool,
    #[serde(default)]
    pub agent_options: Option<AgentOptions>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ValidateParams for ChatSendParams {
    fn validate(&self) -> Result<(), String> {
        if self.message.trim().is_empty() && self.images.is_empty() {
            return Err("'message' must not be empty".into());
        }
        if let Some(img) = self
            .images
            .iter()
            .find(|img| !img.media_type.starts_with("image/"))
        {
            return Err(format!(
                "unsupported image media type '{}'",
                img.media_type
            ));
        }
        if let Some(0) = self.agent_options.as_ref().and_then(|o| o.max_turns) {
            return Err("'agentOptions.maxTurns' must be at least 1".into());
        }
        Ok(())
    }
}

// ── chat.cancel ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCancelParams {
    pub request_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ValidateParams for ChatCancelParams {
    fn validate(&self) -> Result<(), String> {
        if self.request_id.is_empty() {
            return Err("'requestId' must not be empty".into());
        }
        Ok(())
    }
}

// ── system-event ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventParams {
    pub event: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl ValidateParams for SystemEventParams {
    fn validate(&self) -> Result<(), String> {
        if self.event.trim().is_empty() {
            return Err("'event' must not be empty".into());
        }
        Ok(())
    }
}
