use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde_json::Value,
    tokio::sync::{mpsc, watch},
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    tether_config::ClientConfig,
    tether_protocol::{
        ChatSendParams, EventFrame, GatewayFrame, HELLO_ID, Hello, RequestFrame, methods,
        parse_frame,
    },
};

use crate::{
    backoff::Backoff,
    error::ClientError,
    pending::PendingRequests,
    stream::{ChatStream, StreamItem},
    subscriptions::{EventCallback, Subscription, Subscriptions, WILDCARD},
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Waiting before reconnect attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Closed by the caller or after reconnects ran out.
    Closed,
}

/// Client settings derived from [`ClientConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub backoff: Backoff,
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            backoff: Backoff::from_config(config),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

pub(crate) struct Inner {
    options: ClientOptions,
    pub(crate) pending: PendingRequests,
    subscriptions: Subscriptions,
    outbound: mpsc::UnboundedSender<String>,
    hello: watch::Sender<Option<Hello>>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Inner {
    pub(crate) async fn call(
        &self,
        id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ClientError::ConnectionClosed);
        }

        let rx = self.pending.insert(id);
        let text = serde_json::to_string(&RequestFrame::new(id, method, params))?;
        if self.outbound.send(text).is_err() {
            self.pending.remove(id);
            return Err(ClientError::ConnectionClosed);
        }
        debug!(id, method, "request sent");

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(id);
                warn!(id, method, "request timed out");
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.options.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            },
        }
    }

    pub(crate) async fn cancel_chat(
        &self,
        request_id: &str,
        reason: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut params = serde_json::json!({ "requestId": request_id });
        if let Some(reason) = reason {
            params["reason"] = Value::String(reason.to_string());
        }
        self.call(&new_id(), methods::CHAT_CANCEL, Some(params)).await
    }

    fn handle_text(&self, text: &str) {
        let frame = match parse_frame(text, usize::MAX) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame from gateway");
                return;
            },
        };
        match frame {
            GatewayFrame::Response(res) if res.id == HELLO_ID => {
                match res.into_result().map(serde_json::from_value::<Hello>) {
                    Ok(Ok(hello)) => {
                        info!(session_id = %hello.session_id, protocol = hello.protocol, "gateway hello");
                        self.hello.send_replace(Some(hello));
                    },
                    Ok(Err(e)) => warn!(error = %e, "malformed hello payload"),
                    Err(e) => warn!(error = %e, "gateway rejected the connection"),
                }
            },
            GatewayFrame::Response(res) => {
                let id = res.id.clone();
                if !self.pending.resolve(res) {
                    debug!(id, "response for unknown request");
                }
            },
            GatewayFrame::Event(event) => {
                self.subscriptions.dispatch(&event);
            },
            GatewayFrame::Request(req) => {
                debug!(method = %req.method, "ignoring request frame from gateway");
            },
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Connection task ──────────────────────────────────────────────────────────

/// Pump one socket until it closes or shutdown is requested.
/// Returns true when shutdown was requested.
async fn run_socket(
    inner: &Inner,
    socket: Socket,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> bool {
    let (mut sink, mut stream) = socket.split();
    inner.state.send_replace(ConnectionState::Connected);

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return true;
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(error = %e, "send failed");
                    return false;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_text(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => inner.handle_text(text),
                    Err(_) => warn!("ignoring non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return false;
                },
            },
        }
    }
}

async fn connection_loop(
    inner: Arc<Inner>,
    url: String,
    first: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let mut socket = first;
    loop {
        let shutdown = run_socket(&inner, socket, &mut outbound).await || inner.shutdown.is_cancelled();

        // New requests are refused before the outstanding ones are rejected.
        inner.state.send_replace(if shutdown {
            ConnectionState::Closed
        } else {
            ConnectionState::Reconnecting { attempt: 1 }
        });
        inner.hello.send_replace(None);
        let rejected = inner.pending.fail_all(|| ClientError::ConnectionClosed);
        while outbound.try_recv().is_ok() {}

        if shutdown {
            info!(rejected, "client closed");
            return;
        }
        warn!(rejected, "gateway connection lost");

        let mut attempt = 0;
        socket = loop {
            attempt += 1;
            if inner.options.backoff.exhausted(attempt) {
                warn!(attempts = attempt - 1, "giving up on reconnect");
                inner.state.send_replace(ConnectionState::Closed);
                return;
            }
            inner.state.send_replace(ConnectionState::Reconnecting { attempt });
            let delay = inner.options.backoff.delay(attempt);
            debug!(attempt, ?delay, "reconnecting");
            tokio::select! {
                () = inner.shutdown.cancelled() => {
                    inner.state.send_replace(ConnectionState::Closed);
                    return;
                },
                () = tokio::time::sleep(delay) => {},
            }
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    info!(attempt, "reconnected");
                    break socket;
                },
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        };
    }
}

// ── Public client ────────────────────────────────────────────────────────────

/// Connection to a gateway with request correlation, event subscriptions and
/// automatic reconnects. Dropping the client closes the connection.
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl GatewayClient {
    /// Connect and wait for the gateway's hello.
    pub async fn connect(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let (socket, _) = connect_async(url).await.map_err(|e| ClientError::Connect {
            url: url.to_string(),
            source: Box::new(e),
        })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (hello, mut hello_rx) = watch::channel(None);
        let inner = Arc::new(Inner {
            options,
            pending: PendingRequests::new(),
            subscriptions: Subscriptions::new(),
            outbound: outbound_tx,
            hello,
            state: watch::channel(ConnectionState::Connected).0,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(connection_loop(
            Arc::clone(&inner),
            url.to_string(),
            socket,
            outbound_rx,
        ));
        let client = Self { inner };

        match tokio::time::timeout(options.request_timeout, hello_rx.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => Ok(client),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout {
                method: HELLO_ID.to_string(),
                timeout_ms: u64::try_from(options.request_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Send a request and wait for its response payload.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.inner.call(&new_id(), method, params).await
    }

    /// Round-trip a `ping`; returns the gateway timestamp.
    pub async fn ping(&self) -> Result<u64, ClientError> {
        let payload = self.request(methods::PING, None).await?;
        Ok(payload.get("pong").and_then(Value::as_u64).unwrap_or_default())
    }

    /// Register `callback` for `event` (or `*` for all events).
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(event, Arc::new(callback))
    }

    /// Start a chat run and return its event stream.
    pub async fn chat_stream(&self, params: ChatSendParams) -> Result<ChatStream, ClientError> {
        let params = serde_json::to_value(&params)?;
        let request_id = new_id();
        let (tx, rx) = mpsc::unbounded_channel();

        // Subscribe before sending so no event can be missed.
        let event_tx = tx.clone();
        let filter_id = request_id.clone();
        let callback: EventCallback = Arc::new(move |frame: &EventFrame| {
            if frame.request_id() == Some(filter_id.as_str()) {
                let _ = event_tx.send(StreamItem::Event(frame.clone()));
            }
        });
        let subscription = self.inner.subscriptions.subscribe(WILDCARD, callback);

        let inner = Arc::clone(&self.inner);
        let id = request_id.clone();
        let task = tokio::spawn(async move {
            let result = inner.call(&id, methods::CHAT_SEND, Some(params)).await;
            let _ = tx.send(StreamItem::Response(result));
        });

        Ok(ChatStream::new(
            request_id,
            rx,
            Some(subscription),
            Some(task),
            Some(Arc::clone(&self.inner)),
        ))
    }

    /// Cancel a chat run started on this connection.
    pub async fn cancel_chat(&self, request_id: &str, reason: Option<&str>) -> Result<Value, ClientError> {
        self.inner.cancel_chat(request_id, reason).await
    }

    /// Identification received on the current connection.
    pub fn hello(&self) -> Option<Hello> {
        self.inner.hello.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until a (re)connection has completed its hello.
    pub async fn wait_connected(&self) -> Result<Hello, ClientError> {
        let mut rx = self.inner.hello.subscribe();
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(hello) = rx.borrow_and_update().clone() {
                return Ok(hello);
            }
            if *state.borrow_and_update() == ConnectionState::Closed {
                return Err(ClientError::ConnectionClosed);
            }
            tokio::select! {
                changed = rx.changed() => changed.map_err(|_| ClientError::ConnectionClosed)?,
                changed = state.changed() => changed.map_err(|_| ClientError::ConnectionClosed)?,
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
