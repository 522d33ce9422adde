use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use {
    serde::Serialize,
    tokio::sync::{RwLock, mpsc},
    tracing::warn,
};

use tether_config::TetherConfig;

use crate::{aborts::AbortTable, chat::ChatService};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client currently connected to the gateway. One per socket;
/// `conn_id` doubles as the session id reported in the hello frame.
pub struct ConnectedClient {
    pub conn_id: String,
    pub remote_addr: Option<SocketAddr>,
    /// Channel for sending serialized frames to this client's write loop.
    sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
    pub created_at_ms: u64,
    last_seen_ms: AtomicU64,
    /// Cancellable requests started on this connection.
    pub aborts: AbortTable,
    inflight: AtomicUsize,
}

impl ConnectedClient {
    pub fn new(
        conn_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            conn_id: conn_id.into(),
            remote_addr,
            sender,
            connected_at: Instant::now(),
            created_at_ms: now,
            last_seen_ms: AtomicU64::new(now),
            aborts: AbortTable::new(),
            inflight: AtomicUsize::new(0),
        }
    }

    /// Send a serialized JSON frame to this client. Never waits on the socket.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }

    /// Serialize and send a frame.
    pub fn send_frame<T: Serialize>(&self, frame: &T) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send(&json),
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "failed to serialize frame");
                false
            },
        }
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Reserve one in-flight request slot, or `None` when `limit` are taken.
    pub fn try_acquire_slot(self: &Arc<Self>, limit: usize) -> Option<InflightSlot> {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| InflightSlot(Arc::clone(self)))
    }
}

/// Held by a dispatch task; frees the slot on drop.
pub struct InflightSlot(Arc<ConnectedClient>);

impl Drop for InflightSlot {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All connected WebSocket clients, keyed by conn_id.
    pub clients: RwLock<HashMap<String, Arc<ConnectedClient>>>,
    /// Monotonically increasing sequence counter for broadcast events.
    pub seq: AtomicU64,
    /// Server version string.
    pub version: String,
    /// Hostname for the hello frame.
    pub hostname: String,
    pub started_at: Instant,
    pub config: TetherConfig,
    pub chat: ChatService,
}

impl GatewayState {
    pub fn new(config: TetherConfig, chat: ChatService) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            started_at: Instant::now(),
            config,
            chat,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a new client connection.
    pub async fn register_client(&self, client: Arc<ConnectedClient>) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    /// Remove a client by conn_id. Returns the removed client if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<Arc<ConnectedClient>> {
        self.clients.write().await.remove(conn_id)
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
