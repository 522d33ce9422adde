/// Config schema types (gateway, chat, client, providers).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub gateway: GatewayConfig,
    pub chat: ChatConfig,
    pub client: ClientConfig,
    pub providers: ProvidersConfig,
}

/// WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Largest accepted inbound message, in bytes.
    pub max_payload_bytes: usize,
    /// Requests a single connection may have in flight at once.
    pub max_inflight_per_connection: usize,
    /// Server-side ceiling on a single handler. Unset means no limit.
    pub handler_timeout_secs: Option<u64>,
    /// Interval of the `tick` broadcast. Zero disables it.
    pub tick_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18789,
            max_payload_bytes: 512 * 1024,
            max_inflight_per_connection: 64,
            handler_timeout_secs: None,
            tick_interval_secs: 30,
        }
    }
}

/// Chat/agent pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Base system prompt; tool descriptions and memory context are appended.
    pub system_prompt: Option<String>,
    /// Provider id used when a request names none.
    pub default_model: Option<String>,
    /// Agent-mode turn ceiling when the request gives none.
    pub max_turns: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            default_model: None,
            max_turns: 10,
        }
    }
}

/// Settings for `tether-client` consumers (the CLI's `ping`/`chat`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway URL. Derived from the gateway bind/port when unset.
    pub url: Option<String>,
    pub request_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 30_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider-specific settings keyed by provider id.
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,

    /// Model id reported by the provider.
    pub model: Option<String>,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
        }
    }
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    /// Get the configured entry for a provider, if any.
    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }
}

impl TetherConfig {
    /// The URL clients dial when none is configured explicitly.
    pub fn client_url(&self) -> String {
        self.client.url.clone().unwrap_or_else(|| {
            let host = match self.gateway.bind.as_str() {
                "0.0.0.0" | "::" => "127.0.0.1",
                other => other,
            };
            format!("ws://{host}:{}/ws", self.gateway.port)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TetherConfig::default();
        assert_eq!(cfg.gateway.port, 18789);
        assert_eq!(cfg.gateway.max_payload_bytes, 524_288);
        assert!(cfg.gateway.handler_timeout_secs.is_none());
        assert_eq!(cfg.chat.max_turns, 10);
        assert_eq!(cfg.client.request_timeout_ms, 30_000);
        assert!(cfg.providers.is_enabled("echo"));
    }

    #[test]
    fn client_url_follows_gateway() {
        let mut cfg = TetherConfig::default();
        cfg.gateway.bind = "0.0.0.0".into();
        cfg.gateway.port = 9000;
        assert_eq!(cfg.client_url(), "ws://127.0.0.1:9000/ws");

        cfg.client.url = Some("ws://example:1/ws".into());
        assert_eq!(cfg.client_url(), "ws://example:1/ws");
    }

    #[test]
    fn disabled_provider() {
        let mut cfg = ProvidersConfig::default();
        cfg.providers.insert("echo".into(), ProviderEntry {
            enabled: false,
            model: None,
        });
        assert!(!cfg.is_enabled("echo"));
        assert!(cfg.is_enabled("other"));
    }
}
