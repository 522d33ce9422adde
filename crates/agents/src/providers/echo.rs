use std::{pin::Pin, time::Duration};

use {async_trait::async_trait, tokio_stream::Stream};

use crate::model::{CompletionResponse, LlmProvider, StreamEvent, Usage, message_text};

/// Local provider that answers with the last user message.
///
/// Streams word by word so clients can exercise chunking and cancellation
/// without remote credentials. Never calls tools.
pub struct EchoProvider {
    model: String,
    delay: Duration,
}

impl EchoProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            delay: Duration::from_millis(20),
        }
    }

    /// Pause between streamed words.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn reply(messages: &[serde_json::Value]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m["role"] == "user")
            .map(message_text)
            .unwrap_or_default()
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[serde_json::Value],
        _tools: &[serde_json::Value],
    ) -> anyhow::Result<CompletionResponse> {
        let text = Self::reply(messages);
        let input_tokens = messages
            .iter()
            .map(|m| word_count(&message_text(m)))
            .sum();
        Ok(CompletionResponse {
            usage: Usage {
                input_tokens,
                output_tokens: word_count(&text),
            },
            text: Some(text),
            tool_calls: vec![],
        })
    }

    fn stream(
        &self,
        messages: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let text = Self::reply(&messages);
        let delay = self.delay;
        Box::pin(async_stream::stream! {
            let mut output_tokens = 0;
            for word in text.split_inclusive(' ') {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                output_tokens += 1;
                yield StreamEvent::Delta(word.to_string());
            }
            yield StreamEvent::Done(Usage {
                input_tokens: word_count(&text),
                output_tokens,
            });
        })
    }
}
