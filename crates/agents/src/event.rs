/// One step of a provider run, in the order the provider produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental assistant text.
    Text(String),
    ToolStart {
        tool: String,
        input: serde_json::Value,
        tool_use_id: String,
    },
    ToolResult {
        tool: String,
        result: serde_json::Value,
        tool_use_id: String,
        is_error: bool,
    },
    TurnComplete {
        turn_number: u32,
    },
    /// The provider gave up on its own (e.g. upstream abort).
    Cancelled {
        reason: String,
    },
    /// Normal completion after `turns` LLM round-trips.
    Done {
        turns: u32,
    },
}
