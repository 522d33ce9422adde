use tether_protocol::ErrorShape;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    /// The gateway answered with an error response.
    #[error("{0}")]
    Gateway(ErrorShape),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Wire error code when the gateway rejected the request.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Gateway(shape) => Some(&shape.code),
            _ => None,
        }
    }
}
