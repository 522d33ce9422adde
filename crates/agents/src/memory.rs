use async_trait::async_trait;

/// Supplies extra context for the system prompt (long-term memory, notes).
///
/// Failures are non-fatal: the caller logs and continues without context.
#[async_trait]
pub trait MemoryContextSource: Send + Sync {
    async fn context_for(&self, message: &str) -> anyhow::Result<Option<String>>;
}
