use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::{Instrument, debug, info, info_span, warn},
};

use tether_protocol::{
    ErrorShape, FrameError, GatewayFrame, HELLO_ID, Hello, KNOWN_EVENTS, PROTOCOL_VERSION,
    ResponseFrame, ServerInfo, error_codes, parse_frame,
};

use crate::{
    methods::{MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

/// Handle a single WebSocket connection through its full lifecycle:
/// hello → request loop → cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: Option<SocketAddr>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("ws", conn_id = %conn_id);
    run_connection(socket, state, methods, remote_addr, conn_id)
        .instrument(span)
        .await;
}

async fn run_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: Option<SocketAddr>,
    conn_id: String,
) {
    info!(remote_ip = ?remote_addr, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound: everything for this socket goes through one queue so that
    // producers never wait on the network.
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();
    let write_handle = tokio::spawn(async move {
        while let Some(text) = client_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let client = Arc::new(ConnectedClient::new(&conn_id, remote_addr, client_tx));

    let hello = Hello {
        session_id: conn_id.clone(),
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            host: Some(state.hostname.clone()),
        },
        methods: methods.method_names(),
        events: KNOWN_EVENTS.iter().map(|e| (*e).to_string()).collect(),
    };
    match serde_json::to_value(&hello) {
        Ok(payload) => {
            client.send_frame(&ResponseFrame::ok(HELLO_ID, payload));
        },
        Err(e) => warn!(error = %e, "ws: failed to serialize hello"),
    }
    state.register_client(Arc::clone(&client)).await;

    let max_payload = state.config.gateway.max_payload_bytes;
    let max_inflight = state.config.gateway.max_inflight_per_connection;

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    client.send_frame(&FrameError::InvalidField {
                        field: "message",
                        reason: "binary message is not valid UTF-8",
                    }
                    .to_response());
                    continue;
                },
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "ws: read error");
                break;
            },
        };

        let frame = match parse_frame(&text, max_payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(code = e.code(), error = %e, "ws: rejected frame");
                client.send_frame(&e.to_response());
                continue;
            },
        };

        let request = match frame {
            GatewayFrame::Request(req) => req,
            other => {
                debug!(kind = other.kind(), "ws: ignoring non-request frame");
                continue;
            },
        };

        client.touch();

        let Some(slot) = client.try_acquire_slot(max_inflight) else {
            warn!(method = %request.method, limit = max_inflight, "ws: too many in-flight requests");
            client.send_frame(&ResponseFrame::err(
                &request.id,
                ErrorShape::new(
                    error_codes::RATE_LIMITED,
                    format!("too many in-flight requests (limit {max_inflight})"),
                )
                .retryable(true),
            ));
            continue;
        };

        // Reserve the abort handle before spawning so a cancel read after
        // this frame always finds it.
        let abort = if methods.is_cancellable(&request.method) {
            match client.aborts.register(&request.id) {
                Some(guard) => Some(guard),
                None => {
                    warn!(method = %request.method, request_id = %request.id, "ws: duplicate request id");
                    client.send_frame(&ResponseFrame::err(
                        &request.id,
                        ErrorShape::new(
                            error_codes::CONFLICT,
                            format!("request '{}' is already running on this connection", request.id),
                        ),
                    ));
                    continue;
                },
            }
        } else {
            None
        };

        // Each request runs on its own task so a long stream never blocks
        // pings, cancels or other requests on this socket.
        let ctx = MethodContext {
            request_id: request.id,
            method: request.method,
            params: request.params,
            client: Arc::clone(&client),
            state: Arc::clone(&state),
            abort,
        };
        let methods = Arc::clone(&methods);
        let client = Arc::clone(&client);
        tokio::spawn(
            async move {
                let response = methods.dispatch(ctx).await;
                drop(slot);
                client.send_frame(&response);
            }
            .in_current_span(),
        );
    }

    // ── Cleanup ──────────────────────────────────────────────────────────
    state.remove_client(&conn_id).await;
    let cancelled = client.aborts.cancel_all();
    let duration = client.connected_at.elapsed();
    info!(
        cancelled,
        duration_secs = duration.as_secs(),
        "ws: connection closed"
    );
    write_handle.abort();
}
