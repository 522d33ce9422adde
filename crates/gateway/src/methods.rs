use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use {
    futures::FutureExt,
    serde::de::DeserializeOwned,
    tracing::{debug, error, warn},
};

use tether_protocol::{
    ChatCancelParams, ChatSendParams, ErrorShape, KNOWN_EVENTS, PROTOCOL_VERSION, ResponseFrame,
    SystemEventParams, ValidateParams, error_codes, methods, parse_params,
};

use crate::{
    aborts::AbortGuard,
    broadcast::{BroadcastOpts, broadcast},
    state::{ConnectedClient, GatewayState, now_ms},
};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub client: Arc<ConnectedClient>,
    pub state: Arc<GatewayState>,
    /// Abort handle allocated when the frame was read, for cancellable methods.
    pub abort: Option<AbortGuard>,
}

/// The result a method handler produces.
pub type MethodResult = Result<serde_json::Value, ErrorShape>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

/// A boxed async method handler.
pub type HandlerFn = Box<dyn Fn(MethodContext) -> HandlerFuture + Send + Sync>;

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
    cancellable: HashSet<String>,
    handler_timeout: Option<Duration>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
            cancellable: HashSet::new(),
            handler_timeout: None,
        };
        reg.register_defaults();
        reg
    }

    /// Resolve requests whose handler runs longer than `timeout` with `TIMEOUT`.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    /// Register a handler whose params are deserialized into `P` and
    /// validated before it runs. Bad params never reach the handler.
    pub fn register_typed<P, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + ValidateParams + Send + 'static,
        F: Fn(MethodContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.register(
            method,
            Box::new(move |mut ctx| -> HandlerFuture {
                match parse_params::<P>(ctx.params.take()) {
                    Ok(params) => Box::pin(handler(ctx, params)),
                    Err(err) => Box::pin(std::future::ready(Err(err))),
                }
            }),
        );
    }

    /// Requests for `method` get their abort handle before the handler is
    /// spawned, so a cancel read right after the request always finds it.
    pub fn mark_cancellable(&mut self, method: impl Into<String>) {
        self.cancellable.insert(method.into());
    }

    pub fn is_cancellable(&self, method: &str) -> bool {
        self.cancellable.contains(method)
    }

    pub fn has(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Run the handler for `ctx.method` and build the one terminal response.
    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.client.conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new(
                    error_codes::UNKNOWN_METHOD,
                    format!("unknown method: {method}"),
                ),
            );
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
            Ok(fut) => {
                let guarded = AssertUnwindSafe(fut).catch_unwind();
                match self.handler_timeout {
                    Some(limit) => match tokio::time::timeout(limit, guarded).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(method, request_id = %request_id, ?limit, "method timed out");
                            return ResponseFrame::err(
                                &request_id,
                                ErrorShape::new(
                                    error_codes::TIMEOUT,
                                    format!("method '{method}' timed out after {}s", limit.as_secs()),
                                )
                                .retryable(true),
                            );
                        },
                    },
                    None => guarded.await,
                }
            },
            Err(panic) => Err(panic),
        };

        let result = outcome.unwrap_or_else(|panic| {
            error!(
                method,
                request_id = %request_id,
                panic = panic_message(panic.as_ref()),
                "method handler panicked"
            );
            Err(ErrorShape::new(
                error_codes::INTERNAL,
                format!("internal error in '{method}'"),
            ))
        });

        match result {
            Ok(payload) => {
                debug!(method, request_id = %request_id, "method ok");
                ResponseFrame::ok(&request_id, payload)
            },
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register_gateway_methods();
        self.register_chat_methods();
    }

    // ── Gateway-internal methods ─────────────────────────────────────────

    fn register_gateway_methods(&mut self) {
        // ping
        self.register(
            methods::PING,
            Box::new(|_ctx| Box::pin(async move { Ok(serde_json::json!({ "pong": now_ms() })) })),
        );

        // health
        self.register(
            methods::HEALTH,
            Box::new(|ctx| {
                Box::pin(async move {
                    let count = ctx.state.client_count().await;
                    Ok(serde_json::json!({
                        "status": "ok",
                        "version": ctx.state.version,
                        "protocol": PROTOCOL_VERSION,
                        "connections": count,
                    }))
                })
            }),
        );

        // status
        self.register(
            methods::STATUS,
            Box::new(|ctx| {
                Box::pin(async move {
                    let chat = &ctx.state.chat;
                    Ok(serde_json::json!({
                        "version": ctx.state.version,
                        "hostname": ctx.state.hostname,
                        "protocol": PROTOCOL_VERSION,
                        "uptimeSecs": ctx.state.started_at.elapsed().as_secs(),
                        "connections": ctx.state.client_count().await,
                        "providers": chat.providers().ids(),
                        "tools": chat.tools().names(),
                    }))
                })
            }),
        );

        // system-presence
        self.register(
            methods::SYSTEM_PRESENCE,
            Box::new(|ctx| {
                Box::pin(async move {
                    let clients = ctx.state.clients.read().await;
                    let mut list: Vec<_> = clients
                        .values()
                        .map(|c| {
                            serde_json::json!({
                                "connId": c.conn_id,
                                "remoteAddr": c.remote_addr.map(|a| a.to_string()),
                                "connectedAt": c.created_at_ms,
                                "lastSeenAt": c.last_seen_ms(),
                                "activeRequests": c.aborts.len(),
                            })
                        })
                        .collect();
                    list.sort_by_key(|c| c["connectedAt"].as_u64());
                    Ok(serde_json::json!({ "clients": list }))
                })
            }),
        );

        // system-event: broadcast an event to all clients
        self.register_typed(
            methods::SYSTEM_EVENT,
            |ctx: MethodContext, params: SystemEventParams| async move {
                if KNOWN_EVENTS.contains(&params.event.as_str()) {
                    return Err(ErrorShape::new(
                        error_codes::INVALID_PARAMS,
                        format!("'{}' is a reserved event name", params.event),
                    ));
                }
                let payload = params.payload.unwrap_or_else(|| serde_json::json!({}));
                let delivered =
                    broadcast(&ctx.state, &params.event, payload, BroadcastOpts::default()).await;
                Ok(serde_json::json!({ "delivered": delivered }))
            },
        );
    }

    // ── Chat methods ─────────────────────────────────────────────────────

    fn register_chat_methods(&mut self) {
        // chat.send: streams events on the caller's connection, then resolves
        self.register_typed(
            methods::CHAT_SEND,
            |mut ctx: MethodContext, params: ChatSendParams| async move {
                let chat = &ctx.state.chat;
                let result = match ctx.abort.take() {
                    Some(guard) => chat.send_reserved(&ctx.client, guard, params).await,
                    None => chat.send(&ctx.client, &ctx.request_id, params).await,
                };
                result.map_err(ErrorShape::from)
            },
        );
        self.mark_cancellable(methods::CHAT_SEND);

        // chat.cancel
        self.register_typed(
            methods::CHAT_CANCEL,
            |ctx: MethodContext, params: ChatCancelParams| async move {
                ctx.state
                    .chat
                    .cancel(&ctx.client, &params.request_id, params.reason.as_deref())
                    .map_err(ErrorShape::from)
            },
        );

        // chat.active
        self.register(
            methods::CHAT_ACTIVE,
            Box::new(|ctx| {
                Box::pin(async move {
                    Ok(serde_json::json!({ "requestIds": ctx.client.aborts.active() }))
                })
            }),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::chat::ChatService,
        serde::Deserialize,
        tether_agents::{EchoProvider, ProviderRegistry},
        tether_config::TetherConfig,
        tokio::sync::mpsc,
    };

    fn state() -> Arc<GatewayState> {
        let config = TetherConfig::default();
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(
            EchoProvider::new("echo").with_delay(Duration::ZERO),
        ));
        let chat = ChatService::new(providers, config.chat.clone());
        GatewayState::new(config, chat)
    }

    async fn connect(state: &GatewayState, id: &str) -> (Arc<ConnectedClient>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(ConnectedClient::new(id, None, tx));
        state.register_client(Arc::clone(&client)).await;
        (client, rx)
    }

    fn ctx(
        state: &Arc<GatewayState>,
        client: &Arc<ConnectedClient>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> MethodContext {
        MethodContext {
            request_id: "r1".into(),
            method: method.into(),
            params,
            client: Arc::clone(client),
            state: Arc::clone(state),
            abort: None,
        }
    }

    #[tokio::test]
    async fn ping_returns_timestamp() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let res = MethodRegistry::new()
            .dispatch(ctx(&state, &client, "ping", None))
            .await;
        assert!(res.ok);
        assert_eq!(res.id, "r1");
        assert!(res.payload.unwrap()["pong"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let res = MethodRegistry::new()
            .dispatch(ctx(&state, &client, "posts.approve", None))
            .await;
        let err = res.error.unwrap();
        assert_eq!(err.code, error_codes::UNKNOWN_METHOD);
        assert_eq!(err.message, "unknown method: posts.approve");
    }

    #[derive(Deserialize)]
    struct ScheduleParams {
        at: u64,
    }

    impl ValidateParams for ScheduleParams {
        fn validate(&self) -> Result<(), String> {
            if self.at == 0 {
                return Err("'at' must be in the future".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_params_are_checked_before_the_handler() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let mut reg = MethodRegistry::new();
        reg.register_typed("schedule.create", |_ctx, p: ScheduleParams| async move {
            Ok(serde_json::json!({ "at": p.at }))
        });

        let res = reg
            .dispatch(ctx(&state, &client, "schedule.create", Some(serde_json::json!({"at": 5}))))
            .await;
        assert_eq!(res.payload.unwrap()["at"], 5);

        let res = reg
            .dispatch(ctx(&state, &client, "schedule.create", Some(serde_json::json!({"at": "soon"}))))
            .await;
        let err = res.error.unwrap();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
        assert!(err.message.contains("invalid type"), "{}", err.message);

        let res = reg
            .dispatch(ctx(&state, &client, "schedule.create", Some(serde_json::json!({"at": 0}))))
            .await;
        assert_eq!(res.error.unwrap().message, "'at' must be in the future");
    }

    #[tokio::test]
    async fn panicking_handlers_become_internal_errors() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let mut reg = MethodRegistry::new();
        reg.register("boom.sync", Box::new(|_ctx| -> HandlerFuture { panic!("sync boom") }));
        reg.register(
            "boom.async",
            Box::new(|_ctx| Box::pin(async move { panic!("async boom") })),
        );

        for method in ["boom.sync", "boom.async"] {
            let res = reg.dispatch(ctx(&state, &client, method, None)).await;
            assert!(!res.ok);
            assert_eq!(res.error.unwrap().code, error_codes::INTERNAL);
        }
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let mut reg = MethodRegistry::new().with_handler_timeout(Some(Duration::from_millis(20)));
        reg.register(
            "slow",
            Box::new(|_ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(serde_json::json!({}))
                })
            }),
        );
        let res = reg.dispatch(ctx(&state, &client, "slow", None)).await;
        let err = res.error.unwrap();
        assert_eq!(err.code, error_codes::TIMEOUT);
        assert_eq!(err.retryable, Some(true));
    }

    #[tokio::test]
    async fn chat_send_streams_then_resolves() {
        let state = state();
        let (client, mut rx) = connect(&state, "c1").await;
        let res = MethodRegistry::new()
            .dispatch(ctx(
                &state,
                &client,
                methods::CHAT_SEND,
                Some(serde_json::json!({ "message": "hi there" })),
            ))
            .await;
        assert_eq!(res.payload.unwrap()["text"], "hi there");

        let mut events = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let frame: tether_protocol::EventFrame = serde_json::from_str(&text).unwrap();
            events.push(frame.event);
        }
        assert_eq!(events, vec!["chat.chunk", "chat.chunk", "chat.done"]);
    }

    #[tokio::test]
    async fn chat_send_uses_handle_reserved_at_read_time() {
        let state = state();
        let (client, mut rx) = connect(&state, "c1").await;
        let reg = MethodRegistry::new();
        assert!(reg.is_cancellable(methods::CHAT_SEND));
        assert!(!reg.is_cancellable(methods::PING));

        // The cancel lands before the send handler has started.
        let guard = client.aborts.register("r1").unwrap();
        let params = Some(serde_json::json!({ "requestId": "r1" }));
        let res = reg
            .dispatch(MethodContext {
                request_id: "k1".into(),
                ..ctx(&state, &client, methods::CHAT_CANCEL, params)
            })
            .await;
        assert!(res.ok);

        let res = reg
            .dispatch(MethodContext {
                abort: Some(guard),
                ..ctx(
                    &state,
                    &client,
                    methods::CHAT_SEND,
                    Some(serde_json::json!({ "message": "too late" })),
                )
            })
            .await;
        assert_eq!(res.payload.unwrap()["cancelled"], true);
        let frame: tether_protocol::EventFrame =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.event, "chat.cancelled");
        assert!(rx.try_recv().is_err());
        assert!(client.aborts.is_empty());
    }

    #[tokio::test]
    async fn chat_send_rejects_empty_message() {
        let state = state();
        let (client, _rx) = connect(&state, "c1").await;
        let res = MethodRegistry::new()
            .dispatch(ctx(&state, &client, methods::CHAT_SEND, Some(serde_json::json!({}))))
            .await;
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn chat_cancel_and_active_are_per_connection() {
        let state = state();
        let (a, _rx_a) = connect(&state, "a").await;
        let (b, _rx_b) = connect(&state, "b").await;
        let reg = MethodRegistry::new();
        let guard = a.aborts.register("stream-1").unwrap();

        let res = reg.dispatch(ctx(&state, &a, methods::CHAT_ACTIVE, None)).await;
        assert_eq!(res.payload.unwrap()["requestIds"], serde_json::json!(["stream-1"]));

        // Another connection cannot see or cancel it.
        let params = Some(serde_json::json!({ "requestId": "stream-1" }));
        let res = reg
            .dispatch(ctx(&state, &b, methods::CHAT_CANCEL, params.clone()))
            .await;
        assert_eq!(res.error.unwrap().code, error_codes::NOT_FOUND);
        assert!(!guard.is_cancelled());

        let res = reg.dispatch(ctx(&state, &a, methods::CHAT_CANCEL, params)).await;
        assert_eq!(res.payload.unwrap()["cancelled"], true);
        assert_eq!(guard.reason(), Some("cancelled by client"));
    }

    #[tokio::test]
    async fn system_event_broadcasts() {
        let state = state();
        let (a, mut rx_a) = connect(&state, "a").await;
        let (_b, mut rx_b) = connect(&state, "b").await;
        let reg = MethodRegistry::new();

        let res = reg
            .dispatch(ctx(
                &state,
                &a,
                methods::SYSTEM_EVENT,
                Some(serde_json::json!({ "event": "news.ingested", "payload": {"count": 3} })),
            ))
            .await;
        assert_eq!(res.payload.unwrap()["delivered"], 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let text = rx.recv().await.unwrap();
            assert!(text.contains("news.ingested"));
        }

        let res = reg
            .dispatch(ctx(
                &state,
                &a,
                methods::SYSTEM_EVENT,
                Some(serde_json::json!({ "event": "chat.done" })),
            ))
            .await;
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn presence_lists_connections() {
        let state = state();
        let (a, _rx_a) = connect(&state, "a").await;
        let (_b, _rx_b) = connect(&state, "b").await;
        let res = MethodRegistry::new()
            .dispatch(ctx(&state, &a, methods::SYSTEM_PRESENCE, None))
            .await;
        let payload = res.payload.unwrap();
        let clients = payload["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 2);
        assert!(clients.iter().all(|c| c["activeRequests"] == 0));
    }

    #[test]
    fn default_methods_are_registered() {
        let reg = MethodRegistry::new();
        for method in [
            methods::PING,
            methods::CHAT_SEND,
            methods::CHAT_CANCEL,
            methods::CHAT_ACTIVE,
            methods::HEALTH,
            methods::STATUS,
            methods::SYSTEM_PRESENCE,
            methods::SYSTEM_EVENT,
        ] {
            assert!(reg.has(method), "{method} missing");
        }
        let names = reg.method_names();
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }
}
