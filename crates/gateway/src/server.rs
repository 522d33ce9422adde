use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    tokio::{net::TcpListener, task::JoinHandle},
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use {
    tether_agents::ProviderRegistry,
    tether_config::TetherConfig,
    tether_protocol::PROTOCOL_VERSION,
};

use crate::{
    broadcast::broadcast_tick,
    chat::ChatService,
    methods::MethodRegistry,
    state::GatewayState,
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let app_state = AppState {
        gateway: state,
        methods,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(app_state)
}

/// Method registry configured from `config`.
pub fn build_methods(config: &TetherConfig) -> MethodRegistry {
    MethodRegistry::new()
        .with_handler_timeout(config.gateway.handler_timeout_secs.map(Duration::from_secs))
}

/// Serve the gateway on an already-bound listener until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
) -> anyhow::Result<()> {
    let app = build_gateway_app(state, methods);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Broadcast `tick` every `interval` until the returned task is aborted.
pub fn spawn_tick(state: Arc<GatewayState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            broadcast_tick(&state).await;
        }
    })
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(config: TetherConfig) -> anyhow::Result<()> {
    let providers = ProviderRegistry::from_config(&config);
    let provider_summary = if providers.is_empty() {
        "none".to_string()
    } else {
        providers.ids().join(", ")
    };
    let chat = ChatService::new(providers, config.chat.clone());

    let methods = Arc::new(build_methods(&config));
    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let tick_secs = config.gateway.tick_interval_secs;
    let state = GatewayState::new(config, chat);

    let listener = TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("tether gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!("{} methods registered", methods.method_names().len()),
        format!("llm: {provider_summary}"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    if tick_secs > 0 {
        spawn_tick(Arc::clone(&state), Duration::from_secs(tick_secs));
    }

    serve(listener, state, methods).await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.gateway.client_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": count,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_message = state.gateway.config.gateway.max_payload_bytes;
    // Leave headroom so oversized frames reach the validator and get a
    // PAYLOAD_TOO_LARGE response instead of a dropped socket.
    ws.max_message_size(max_message.saturating_mul(2))
        .on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, Some(addr)))
}
