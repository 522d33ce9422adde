//! Outstanding requests awaiting their response frame.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use {serde_json::Value, tokio::sync::oneshot, tracing::debug};

use tether_protocol::ResponseFrame;

use crate::error::ClientError;

pub type PendingResult = Result<Value, ClientError>;

/// `request id → resolver`. Every entry is consumed exactly once: by its
/// response, by [`PendingRequests::remove`] on timeout, or by
/// [`PendingRequests::fail_all`] on disconnect.
#[derive(Default)]
pub struct PendingRequests {
    map: Mutex<HashMap<String, oneshot::Sender<PendingResult>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<PendingResult>>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: &str) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    /// Deliver a response. Returns false when nothing was waiting for it.
    pub fn resolve(&self, frame: ResponseFrame) -> bool {
        let Some(tx) = self.lock().remove(&frame.id) else {
            return false;
        };
        let result = frame.into_result().map_err(ClientError::Gateway);
        if tx.send(result).is_err() {
            debug!("response arrived after the caller stopped waiting");
        }
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Reject every outstanding request. Returns how many were rejected.
    pub fn fail_all(&self, make_err: impl Fn() -> ClientError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
