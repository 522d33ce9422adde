use {
    serde_json::Value,
    tracing::{debug, warn},
};

use tether_protocol::{EventFrame, events};

use crate::state::{GatewayState, now_ms};

#[derive(Debug, Clone, Default)]
pub struct BroadcastOpts {
    /// Connection to skip, typically the one that triggered the event.
    pub exclude: Option<String>,
}

/// Enqueue one sequenced event to every connected client.
///
/// Best-effort and at-most-once: clients that are gone or whose queue is
/// closed are skipped. Never waits on a socket. Returns the number of
/// clients the frame was queued for.
pub async fn broadcast(state: &GatewayState, event: &str, payload: Value, opts: BroadcastOpts) -> usize {
    let clients = state.clients.read().await;
    if clients.is_empty() {
        return 0;
    }

    let frame = EventFrame::new(event, payload, state.next_seq());
    let json = match serde_json::to_string(&frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(event, error = %e, "failed to serialize broadcast");
            return 0;
        },
    };

    let mut delivered = 0;
    for client in clients.values() {
        if opts.exclude.as_deref() == Some(client.conn_id.as_str()) {
            continue;
        }
        if client.send(&json) {
            delivered += 1;
        } else {
            debug!(event, conn_id = %client.conn_id, "broadcast dropped for closed client");
        }
    }
    debug!(event, seq = frame.seq, delivered, "broadcast");
    delivered
}

/// Periodic keep-alive event.
pub async fn broadcast_tick(state: &GatewayState) -> usize {
    broadcast(
        state,
        events::TICK,
        serde_json::json!({ "ts": now_ms() }),
        BroadcastOpts::default(),
    )
    .await
}
