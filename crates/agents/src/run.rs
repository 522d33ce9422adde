use std::{pin::Pin, sync::Arc};

use {
    async_trait::async_trait,
    futures::{Stream, StreamExt},
    tracing::debug,
};

use crate::{
    event::AgentEvent,
    model::{LlmProvider, StreamEvent},
};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentEvent>> + Send>>;

/// Cancellable pull interface over one provider run.
///
/// Consumers call [`AgentRun::next`] until it yields a terminal event, an
/// error, or `None`. [`AgentRun::cancel`] stops the run; any provider work
/// still pending is dropped.
#[async_trait]
pub trait AgentRun: Send {
    async fn next(&mut self) -> Option<anyhow::Result<AgentEvent>>;

    fn cancel(&mut self, reason: &str);
}

/// [`AgentRun`] backed by an event stream.
pub struct StreamRun {
    events: Option<EventStream>,
    cancel_reason: Option<String>,
}

impl StreamRun {
    pub fn new(events: impl Stream<Item = anyhow::Result<AgentEvent>> + Send + 'static) -> Self {
        Self {
            events: Some(Box::pin(events)),
            cancel_reason: None,
        }
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }
}

#[async_trait]
impl AgentRun for StreamRun {
    async fn next(&mut self) -> Option<anyhow::Result<AgentEvent>> {
        let events = self.events.as_mut()?;
        let item = events.next().await;
        if item.is_none() {
            self.events = None;
        }
        item
    }

    fn cancel(&mut self, reason: &str) {
        if self.events.take().is_some() {
            debug!(reason, "agent run cancelled");
            self.cancel_reason = Some(reason.to_string());
        }
    }
}

/// Plain streaming chat: provider deltas become [`AgentEvent::Text`].
pub fn text_run(provider: Arc<dyn LlmProvider>, messages: Vec<serde_json::Value>) -> StreamRun {
    StreamRun::new(async_stream::stream! {
        let mut events = provider.stream(messages);
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Delta(text) => yield Ok(AgentEvent::Text(text)),
                StreamEvent::Done(usage) => {
                    debug!(
                        provider = provider.id(),
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "stream complete"
                    );
                    yield Ok(AgentEvent::Done { turns: 1 });
                    return;
                },
                StreamEvent::Error(msg) => {
                    yield Err(anyhow::anyhow!(msg));
                    return;
                },
            }
        }
    })
}
