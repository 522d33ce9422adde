//! Streaming chat/agent pipeline behind `chat.send` and `chat.cancel`.
//!
//! A request resolves its provider, registers an abort handle on the owning
//! connection, then pulls provider events one at a time. Each event becomes an
//! [`EventFrame`] on that connection before the next one is pulled, and the
//! terminal response is written by the router once [`ChatService::send`]
//! returns. Cancellation is observed while waiting for the next event.

use std::sync::Arc;

use {
    serde_json::{Value, json},
    tracing::{debug, info, warn},
};

use {
    tether_agents::{
        AgentEvent, AgentRun, MemoryContextSource, ProviderRegistry, ToolRegistry,
        prompt::build_system_prompt, run::text_run, runner::agent_run,
    },
    tether_config::ChatConfig,
    tether_protocol::{ChatSendParams, ErrorShape, EventFrame, error_codes, events},
};

use crate::{aborts::AbortGuard, state::ConnectedClient};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("no LLM provider configured")]
    NoProvider,
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("request '{0}' is already running on this connection")]
    Duplicate(String),
    #[error("no active request '{0}' on this connection")]
    NotFound(String),
    #[error(transparent)]
    Llm(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoProvider | Self::UnknownModel(_) => error_codes::CONFIG_ERROR,
            Self::Duplicate(_) => error_codes::CONFLICT,
            Self::NotFound(_) => error_codes::NOT_FOUND,
            Self::Llm(_) => error_codes::LLM_ERROR,
        }
    }
}

impl From<ChatError> for ErrorShape {
    fn from(err: ChatError) -> Self {
        ErrorShape::new(err.code(), err.to_string())
    }
}

// ── Request-scoped events ────────────────────────────────────────────────────

/// Writes events for one request to its connection. Every payload carries
/// `requestId`; `seq` counts from 0 per request.
pub struct RequestEmitter {
    client: Arc<ConnectedClient>,
    request_id: String,
    seq: u64,
}

impl RequestEmitter {
    pub fn new(client: Arc<ConnectedClient>, request_id: impl Into<String>) -> Self {
        Self {
            client,
            request_id: request_id.into(),
            seq: 0,
        }
    }

    pub fn emit(&mut self, event: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("requestId".into(), Value::String(self.request_id.clone()));
        }
        let frame = EventFrame::new(event, payload, self.seq);
        self.seq += 1;
        if !self.client.send_frame(&frame) {
            debug!(event, request_id = %self.request_id, "event dropped, connection closed");
        }
    }

    pub fn emitted(&self) -> u64 {
        self.seq
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

enum Step {
    Cancelled,
    Next(Option<anyhow::Result<AgentEvent>>),
}

fn finish_cancelled(run: &mut dyn AgentRun, out: &mut RequestEmitter, reason: &str) -> Value {
    run.cancel(reason);
    out.emit(events::CHAT_CANCELLED, json!({ "reason": reason }));
    info!(request_id = %out.request_id, reason, "chat run cancelled");
    json!({ "cancelled": true })
}

/// Pull `run` to a terminal state, translating each event into a frame.
///
/// Returns the success payload (`{text, turns}` or `{cancelled: true}`).
/// An event already pulled when cancellation is observed is discarded.
pub async fn drive_run(
    run: &mut dyn AgentRun,
    guard: &AbortGuard,
    out: &mut RequestEmitter,
) -> Result<Value, ChatError> {
    let mut text = String::new();
    let mut turns = 0u32;

    loop {
        let step = tokio::select! {
            biased;
            () = guard.token().cancelled() => Step::Cancelled,
            item = run.next() => Step::Next(item),
        };

        let event = match step {
            Step::Cancelled => {
                let reason = guard.reason().unwrap_or("cancelled").to_string();
                return Ok(finish_cancelled(run, out, &reason));
            },
            Step::Next(None) => break,
            Step::Next(Some(Err(e))) => {
                warn!(request_id = %out.request_id, error = %e, "chat run failed");
                return Err(ChatError::Llm(e));
            },
            Step::Next(Some(Ok(_))) if guard.is_cancelled() => continue,
            Step::Next(Some(Ok(event))) => event,
        };

        match event {
            AgentEvent::Text(delta) => {
                text.push_str(&delta);
                out.emit(events::CHAT_CHUNK, json!({ "text": delta }));
            },
            AgentEvent::ToolStart {
                tool,
                input,
                tool_use_id,
            } => out.emit(
                events::AGENT_TOOL_START,
                json!({ "tool": tool, "input": input, "toolUseId": tool_use_id }),
            ),
            AgentEvent::ToolResult {
                tool,
                result,
                tool_use_id,
                is_error,
            } => out.emit(
                events::AGENT_TOOL_RESULT,
                json!({
                    "tool": tool,
                    "result": result,
                    "toolUseId": tool_use_id,
                    "isError": is_error,
                }),
            ),
            AgentEvent::TurnComplete { turn_number } => {
                turns = turn_number;
                out.emit(
                    events::AGENT_TURN_COMPLETE,
                    json!({ "turnNumber": turn_number }),
                );
            },
            AgentEvent::Cancelled { reason } => {
                return Ok(finish_cancelled(run, out, &reason));
            },
            AgentEvent::Done { turns: n } => {
                turns = n;
                break;
            },
        }
    }

    out.emit(events::CHAT_DONE, json!({}));
    info!(
        request_id = %out.request_id,
        turns,
        events = out.emitted(),
        "chat run complete"
    );
    Ok(json!({ "text": text, "turns": turns }))
}

// ── Service ──────────────────────────────────────────────────────────────────

/// Providers, tools and prompt settings shared by all chat requests.
pub struct ChatService {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    memory: Option<Arc<dyn MemoryContextSource>>,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(providers: ProviderRegistry, config: ChatConfig) -> Self {
        Self {
            providers,
            tools: ToolRegistry::new(),
            memory: None,
            config,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryContextSource>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    async fn memory_context(&self, message: &str) -> Option<String> {
        let memory = self.memory.as_ref()?;
        match memory.context_for(message).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "memory context unavailable, continuing without it");
                None
            },
        }
    }

    /// Allocate the abort handle for `request_id` on `client`.
    pub fn reserve(&self, client: &ConnectedClient, request_id: &str) -> Result<AbortGuard, ChatError> {
        client
            .aborts
            .register(request_id)
            .ok_or_else(|| ChatError::Duplicate(request_id.to_string()))
    }

    /// Run one `chat.send` request to completion on `client`.
    pub async fn send(
        &self,
        client: &Arc<ConnectedClient>,
        request_id: &str,
        params: ChatSendParams,
    ) -> Result<Value, ChatError> {
        let guard = self.reserve(client, request_id)?;
        self.send_reserved(client, guard, params).await
    }

    /// Like [`ChatService::send`], for a request whose handle was allocated
    /// when its frame was read.
    pub async fn send_reserved(
        &self,
        client: &Arc<ConnectedClient>,
        guard: AbortGuard,
        params: ChatSendParams,
    ) -> Result<Value, ChatError> {
        let request_id = guard.request_id().to_string();
        let provider = match params.model.as_deref().or(self.providers.default_id()) {
            Some(model) => self
                .providers
                .get(model)
                .ok_or_else(|| ChatError::UnknownModel(model.to_string()))?,
            None => self.providers.resolve(None).ok_or(ChatError::NoProvider)?,
        };

        let options = params.agent_options.clone().unwrap_or_default();
        let tools = match (&options.tools, params.agent_mode) {
            (_, false) => ToolRegistry::new(),
            (Some(allowed), true) => self.tools.filtered(allowed),
            (None, true) => self.tools.clone(),
        };
        let memory = self.memory_context(&params.message).await;
        let system_prompt = build_system_prompt(
            self.config.system_prompt.as_deref(),
            &tools,
            memory.as_deref(),
            options.instructions.as_deref(),
        );
        let messages = build_messages(system_prompt, &params);

        debug!(
            request_id = %request_id,
            provider = provider.id(),
            agent_mode = params.agent_mode,
            "chat run starting"
        );
        let mut run: Box<dyn AgentRun> = if params.agent_mode {
            let max_turns = options.max_turns.unwrap_or(self.config.max_turns);
            Box::new(agent_run(provider, tools, messages, max_turns))
        } else {
            Box::new(text_run(provider, messages))
        };

        let mut out = RequestEmitter::new(Arc::clone(client), request_id);
        drive_run(run.as_mut(), &guard, &mut out).await
    }

    /// Signal a live request on the same connection.
    pub fn cancel(
        &self,
        client: &ConnectedClient,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Value, ChatError> {
        if client.aborts.cancel(request_id, reason.unwrap_or("cancelled by client")) {
            info!(conn_id = %client.conn_id, request_id, "chat cancel requested");
            Ok(json!({ "requestId": request_id, "cancelled": true }))
        } else {
            Err(ChatError::NotFound(request_id.to_string()))
        }
    }
}

/// Provider messages: system prompt, prior turns, then the new user message.
/// Images turn the user content into typed parts.
fn build_messages(system_prompt: String, params: &ChatSendParams) -> Vec<Value> {
    let mut messages = Vec::with_capacity(params.history.len() + 2);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    for turn in &params.history {
        messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
    }

    let content = if params.images.is_empty() {
        Value::String(params.message.clone())
    } else {
        let mut parts = Vec::with_capacity(params.images.len() + 1);
        if !params.message.is_empty() {
            parts.push(json!({ "type": "text", "text": params.message }));
        }
        for image in &params.images {
            parts.push(json!({
                "type": "image",
                "mediaType": image.media_type,
                "data": image.data,
            }));
        }
        Value::Array(parts)
    };
    messages.push(json!({ "role": "user", "content": content }));
    messages
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        futures::StreamExt,
        std::time::Duration,
        tether_agents::{EchoProvider, StreamRun},
        tokio::sync::mpsc,
    };

    fn client() -> (Arc<ConnectedClient>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ConnectedClient::new("c1", None, tx)), rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<EventFrame> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn scripted(events: Vec<anyhow::Result<AgentEvent>>) -> StreamRun {
        StreamRun::new(futures::stream::iter(events))
    }

    fn params(message: &str) -> ChatSendParams {
        tether_protocol::parse_params(Some(json!({ "message": message }))).unwrap()
    }

    #[tokio::test]
    async fn events_follow_provider_order() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let mut run = scripted(vec![
            Ok(AgentEvent::Text("Hel".into())),
            Ok(AgentEvent::Text("lo".into())),
            Ok(AgentEvent::Done { turns: 1 }),
        ]);

        let result = drive_run(&mut run, &guard, &mut out).await.unwrap();
        assert_eq!(result, json!({ "text": "Hello", "turns": 1 }));

        let frames = frames(&mut rx);
        let names: Vec<_> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(names, vec![events::CHAT_CHUNK, events::CHAT_CHUNK, events::CHAT_DONE]);
        let seqs: Vec<_> = frames.iter().map(|f| f.seq.unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(frames.iter().all(|f| f.request_id() == Some("r1")));
    }

    #[tokio::test]
    async fn agent_events_are_translated() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let mut run = scripted(vec![
            Ok(AgentEvent::ToolStart {
                tool: "search".into(),
                input: json!({"q": "rust"}),
                tool_use_id: "t1".into(),
            }),
            Ok(AgentEvent::ToolResult {
                tool: "search".into(),
                result: json!(["a"]),
                tool_use_id: "t1".into(),
                is_error: false,
            }),
            Ok(AgentEvent::TurnComplete { turn_number: 1 }),
            Ok(AgentEvent::Text("found a".into())),
            Ok(AgentEvent::TurnComplete { turn_number: 2 }),
        ]);

        // No explicit Done: the end of the stream counts as completion.
        let result = drive_run(&mut run, &guard, &mut out).await.unwrap();
        assert_eq!(result["turns"], 2);

        let frames = frames(&mut rx);
        assert_eq!(frames[0].event, events::AGENT_TOOL_START);
        assert_eq!(frames[0].payload.as_ref().unwrap()["toolUseId"], "t1");
        assert_eq!(frames[1].event, events::AGENT_TOOL_RESULT);
        assert_eq!(frames[2].payload.as_ref().unwrap()["turnNumber"], 1);
        assert_eq!(frames.last().unwrap().event, events::CHAT_DONE);
    }

    #[tokio::test]
    async fn cancellation_stops_emission() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let mut run = StreamRun::new(futures::stream::once(async {
            Ok(AgentEvent::Text("first".into()))
        }).chain(futures::stream::pending()));

        let cancel_client = Arc::clone(&client);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(cancel_client.aborts.cancel("r1", "user"));
        });

        let result = drive_run(&mut run, &guard, &mut out).await.unwrap();
        assert_eq!(result, json!({ "cancelled": true }));
        assert_eq!(run.cancel_reason(), Some("user"));

        let frames = frames(&mut rx);
        let names: Vec<_> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(names, vec![events::CHAT_CHUNK, events::CHAT_CANCELLED]);
        let payload = frames[1].payload.as_ref().unwrap();
        assert_eq!(payload["reason"], "user");
        assert_eq!(payload["requestId"], "r1");
    }

    #[tokio::test]
    async fn pulled_event_is_discarded_after_cancel() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let cancel_client = Arc::clone(&client);
        let mut run = StreamRun::new(futures::stream::once(async move {
            // The provider yields this event after the cancel landed.
            cancel_client.aborts.cancel("r1", "late");
            Ok(AgentEvent::Text("stale".into()))
        }));

        let result = drive_run(&mut run, &guard, &mut out).await.unwrap();
        assert_eq!(result["cancelled"], true);
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::CHAT_CANCELLED);
    }

    #[tokio::test]
    async fn provider_cancel_takes_cancel_path() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let mut run = scripted(vec![
            Ok(AgentEvent::Text("a".into())),
            Ok(AgentEvent::Cancelled {
                reason: "upstream abort".into(),
            }),
            Ok(AgentEvent::Text("never".into())),
        ]);

        let result = drive_run(&mut run, &guard, &mut out).await.unwrap();
        assert_eq!(result["cancelled"], true);
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload.as_ref().unwrap()["reason"], "upstream abort");
    }

    #[tokio::test]
    async fn provider_error_is_llm_error() {
        let (client, mut rx) = client();
        let guard = client.aborts.register("r1").unwrap();
        let mut out = RequestEmitter::new(Arc::clone(&client), "r1");
        let mut run = scripted(vec![
            Ok(AgentEvent::Text("partial".into())),
            Err(anyhow::anyhow!("rate limited upstream")),
        ]);

        let err = drive_run(&mut run, &guard, &mut out).await.unwrap_err();
        let shape = ErrorShape::from(err);
        assert_eq!(shape.code, error_codes::LLM_ERROR);
        assert_eq!(shape.message, "rate limited upstream");
        // The chunk sent before the failure stays valid; no done event.
        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::CHAT_CHUNK);
    }

    #[tokio::test]
    async fn send_streams_echo_and_releases_handle() {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider::new("echo").with_delay(Duration::ZERO)));
        let service = ChatService::new(providers, ChatConfig::default());
        let (client, mut rx) = client();

        let result = service
            .send(&client, "r1", params("hello there"))
            .await
            .unwrap();
        assert_eq!(result["text"], "hello there");
        assert!(client.aborts.is_empty());
        assert_eq!(frames(&mut rx).last().unwrap().event, events::CHAT_DONE);
    }

    #[tokio::test]
    async fn send_without_provider_is_config_error() {
        let service = ChatService::new(ProviderRegistry::new(), ChatConfig::default());
        let (client, _rx) = client();
        let err = service.send(&client, "r1", params("hi")).await.unwrap_err();
        assert_eq!(err.code(), error_codes::CONFIG_ERROR);

        let mut with_model = params("hi");
        with_model.model = Some("gpt-x".into());
        let err = service.send(&client, "r2", with_model).await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownModel(ref m) if m == "gpt-x"));
        assert!(client.aborts.is_empty());
    }

    #[tokio::test]
    async fn unregistered_default_model_is_named() {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider::new("echo")));
        providers.set_default("claude-x");
        let service = ChatService::new(providers, ChatConfig::default());
        let (client, _rx) = client();

        let err = service.send(&client, "r1", params("hi")).await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownModel(ref m) if m == "claude-x"));
        assert_eq!(err.code(), error_codes::CONFIG_ERROR);
    }

    #[tokio::test]
    async fn reserved_request_cancelled_before_start() {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider::new("echo").with_delay(Duration::ZERO)));
        let service = ChatService::new(providers, ChatConfig::default());
        let (client, mut rx) = client();

        let guard = service.reserve(&client, "r1").unwrap();
        assert!(service.cancel(&client, "r1", Some("changed my mind")).is_ok());

        let result = service
            .send_reserved(&client, guard, params("never streamed"))
            .await
            .unwrap();
        assert_eq!(result, json!({ "cancelled": true }));
        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, events::CHAT_CANCELLED);
        assert_eq!(sent[0].payload.as_ref().unwrap()["reason"], "changed my mind");
        assert!(client.aborts.is_empty());
    }

    #[tokio::test]
    async fn duplicate_request_id_conflicts() {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider::new("echo")));
        let service = ChatService::new(providers, ChatConfig::default());
        let (client, _rx) = client();

        let _live = client.aborts.register("r1").unwrap();
        let err = service.send(&client, "r1", params("hi")).await.unwrap_err();
        assert_eq!(err.code(), error_codes::CONFLICT);
    }

    #[test]
    fn cancel_unknown_is_not_found() {
        let service = ChatService::new(ProviderRegistry::new(), ChatConfig::default());
        let (client, _rx) = client();
        let err = service.cancel(&client, "nope", None).unwrap_err();
        assert_eq!(err.code(), error_codes::NOT_FOUND);
    }

    struct FailingMemory;

    #[async_trait::async_trait]
    impl MemoryContextSource for FailingMemory {
        async fn context_for(&self, _message: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("memory store offline")
        }
    }

    #[tokio::test]
    async fn failing_memory_source_is_skipped() {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(EchoProvider::new("echo").with_delay(Duration::ZERO)));
        let service = ChatService::new(providers, ChatConfig::default())
            .with_memory(Arc::new(FailingMemory));
        let (client, _rx) = client();

        let result = service.send(&client, "r1", params("still works")).await.unwrap();
        assert_eq!(result["text"], "still works");
    }

    #[test]
    fn images_become_content_parts() {
        let params: ChatSendParams = tether_protocol::parse_params(Some(json!({
            "message": "what is this",
            "history": [{"role": "assistant", "content": "hi"}],
            "images": [{"mediaType": "image/png", "data": "AAAA"}],
        })))
        .unwrap();
        let messages = build_messages("sys".into(), &params);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        let parts = messages[2]["content"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "what is this");
        assert_eq!(parts[1]["mediaType"], "image/png");
    }
}
