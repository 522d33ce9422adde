//! Per-connection table of cancellable in-flight requests.
//!
//! Every request token is a child of the connection's root token, so closing
//! the connection cancels all of them at once. Entries are removed by
//! [`AbortGuard`] on drop, whichever way the owning request ends.

use std::sync::{Arc, OnceLock};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tokio_util::sync::CancellationToken,
};

/// Reason reported when the owning connection goes away.
pub const CONNECTION_CLOSED: &str = "connection closed";

#[derive(Clone)]
struct AbortHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl AbortHandle {
    fn cancel(&self, reason: &str) {
        let _ = self.reason.set(reason.to_string());
        self.token.cancel();
    }
}

pub struct AbortTable {
    root: CancellationToken,
    entries: Arc<DashMap<String, AbortHandle>>,
}

impl Default for AbortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortTable {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Allocate the handle for `request_id`. Returns `None` while another
    /// request with the same id is still live.
    pub fn register(&self, request_id: &str) -> Option<AbortGuard> {
        match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = AbortHandle {
                    token: self.root.child_token(),
                    reason: Arc::new(OnceLock::new()),
                };
                if self.root.is_cancelled() {
                    let _ = handle.reason.set(CONNECTION_CLOSED.to_string());
                }
                slot.insert(handle.clone());
                Some(AbortGuard {
                    entries: Arc::clone(&self.entries),
                    request_id: request_id.to_string(),
                    handle,
                })
            },
        }
    }

    /// Signal the request. Returns false when no such request is live.
    pub fn cancel(&self, request_id: &str, reason: &str) -> bool {
        match self.entries.get(request_id) {
            Some(handle) => {
                handle.cancel(reason);
                true
            },
            None => false,
        }
    }

    /// Cancel every live request and refuse new ones. Returns how many were live.
    pub fn cancel_all(&self) -> usize {
        self.root.cancel();
        let mut count = 0;
        for entry in self.entries.iter() {
            let _ = entry.value().reason.set(CONNECTION_CLOSED.to_string());
            count += 1;
        }
        count
    }

    /// Ids of live requests, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live registration of one request. Dropping it frees the request id.
pub struct AbortGuard {
    entries: Arc<DashMap<String, AbortHandle>>,
    request_id: String,
    handle: AbortHandle,
}

impl AbortGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.handle.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.token.is_cancelled()
    }

    /// Why the request was cancelled, once it has been.
    pub fn reason(&self) -> Option<&str> {
        self.handle.reason.get().map(String::as_str)
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.entries.remove(&self.request_id);
    }
}
