//! Pull-based view of one `chat.send` request.
//!
//! Event callbacks and the request's response both feed a single ordered
//! queue. The consumer sees every queued event before the terminal item, and
//! nothing after it.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use {
    futures::Stream,
    serde_json::Value,
    tokio::{sync::mpsc, task::JoinHandle},
};

use tether_protocol::{EventFrame, events};

use crate::{
    client::Inner,
    error::ClientError,
    pending::PendingResult,
    subscriptions::Subscription,
};

/// One item of a chat stream. `Done` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Chunk(String),
    ToolStart {
        tool: String,
        input: Value,
        tool_use_id: String,
    },
    ToolResult {
        tool: String,
        result: Value,
        tool_use_id: String,
        is_error: bool,
    },
    TurnComplete {
        turn_number: u32,
    },
    Done {
        text: String,
        turns: u32,
    },
    Cancelled {
        reason: String,
    },
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Cancelled { .. })
    }
}

pub(crate) enum StreamItem {
    Event(EventFrame),
    Response(PendingResult),
}

pub struct ChatStream {
    request_id: String,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    subscription: Option<Subscription>,
    response_task: Option<JoinHandle<()>>,
    client: Option<Arc<Inner>>,
    cancel_reason: Option<String>,
    finished: bool,
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u32_field(payload: &Value, key: &str) -> u32 {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or_default()
}

impl ChatStream {
    pub(crate) fn new(
        request_id: String,
        rx: mpsc::UnboundedReceiver<StreamItem>,
        subscription: Option<Subscription>,
        response_task: Option<JoinHandle<()>>,
        client: Option<Arc<Inner>>,
    ) -> Self {
        Self {
            request_id,
            rx,
            subscription,
            response_task,
            client,
            cancel_reason: None,
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Ask the gateway to cancel this run. The stream then ends with
    /// [`ChatEvent::Cancelled`] unless the run finished first.
    pub async fn cancel(&self, reason: &str) -> Result<(), ClientError> {
        let Some(client) = &self.client else {
            return Err(ClientError::ConnectionClosed);
        };
        client
            .cancel_chat(&self.request_id, Some(reason))
            .await
            .map(|_| ())
    }

    /// Stop listening. Queued items are discarded; the run itself continues
    /// on the gateway unless cancelled.
    pub fn close(&mut self) {
        self.finish();
        if let Some(task) = self.response_task.take() {
            task.abort();
        }
        if let Some(client) = &self.client {
            client.pending.remove(&self.request_id);
        }
        self.rx.close();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.subscription = None;
    }

    fn map_event(&mut self, frame: &EventFrame) -> Option<ChatEvent> {
        let payload = frame.payload.as_ref()?;
        match frame.event.as_str() {
            events::CHAT_CHUNK => Some(ChatEvent::Chunk(str_field(payload, "text"))),
            events::AGENT_TOOL_START => Some(ChatEvent::ToolStart {
                tool: str_field(payload, "tool"),
                input: payload.get("input").cloned().unwrap_or(Value::Null),
                tool_use_id: str_field(payload, "toolUseId"),
            }),
            events::AGENT_TOOL_RESULT => Some(ChatEvent::ToolResult {
                tool: str_field(payload, "tool"),
                result: payload.get("result").cloned().unwrap_or(Value::Null),
                tool_use_id: str_field(payload, "toolUseId"),
                is_error: payload
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            events::AGENT_TURN_COMPLETE => Some(ChatEvent::TurnComplete {
                turn_number: u32_field(payload, "turnNumber"),
            }),
            events::CHAT_CANCELLED => {
                self.cancel_reason = Some(str_field(payload, "reason"));
                None
            },
            _ => None,
        }
    }

    fn terminal(&mut self, result: PendingResult) -> Result<ChatEvent, ClientError> {
        let payload = result?;
        if payload.get("cancelled").and_then(Value::as_bool) == Some(true) {
            return Ok(ChatEvent::Cancelled {
                reason: self.cancel_reason.take().unwrap_or_default(),
            });
        }
        Ok(ChatEvent::Done {
            text: str_field(&payload, "text"),
            turns: u32_field(&payload, "turns"),
        })
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatEvent, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            let item = match this.rx.poll_recv(cx) {
                Poll::Ready(Some(item)) => item,
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(Some(Err(ClientError::ConnectionClosed)));
                },
                Poll::Pending => return Poll::Pending,
            };
            match item {
                StreamItem::Event(frame) => {
                    if let Some(event) = this.map_event(&frame) {
                        return Poll::Ready(Some(Ok(event)));
                    }
                },
                StreamItem::Response(result) => {
                    this.finish();
                    return Poll::Ready(Some(this.terminal(result)));
                },
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            self.close();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        futures::StreamExt,
        serde_json::json,
        tokio_test::{assert_pending, assert_ready, task},
    };

    fn detached() -> (mpsc::UnboundedSender<StreamItem>, ChatStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChatStream::new("r1".into(), rx, None, None, None))
    }

    fn event(name: &str, seq: u64, payload: Value) -> StreamItem {
        StreamItem::Event(EventFrame::new(name, payload, seq))
    }

    #[test]
    fn waits_until_something_arrives() {
        let (tx, mut stream) = detached();
        let mut next = task::spawn(stream.next());
        assert_pending!(next.poll());

        tx.send(event(events::CHAT_CHUNK, 0, json!({"requestId": "r1", "text": "hi"})))
            .unwrap();
        assert!(next.is_woken());
        let item = assert_ready!(next.poll());
        assert_eq!(item.unwrap().unwrap(), ChatEvent::Chunk("hi".into()));
    }

    #[tokio::test]
    async fn queued_events_precede_the_terminal_item() {
        let (tx, mut stream) = detached();
        tx.send(event(events::CHAT_CHUNK, 0, json!({"text": "a"}))).unwrap();
        tx.send(event(events::CHAT_CHUNK, 1, json!({"text": "b"}))).unwrap();
        tx.send(event(events::CHAT_DONE, 2, json!({}))).unwrap();
        tx.send(StreamItem::Response(Ok(json!({"text": "ab", "turns": 1}))))
            .unwrap();
        // Anything after the terminal item is never yielded.
        tx.send(event(events::CHAT_CHUNK, 3, json!({"text": "late"}))).unwrap();

        let items: Vec<_> = (&mut stream).map(Result::unwrap).collect().await;
        assert_eq!(items, vec![
            ChatEvent::Chunk("a".into()),
            ChatEvent::Chunk("b".into()),
            ChatEvent::Done {
                text: "ab".into(),
                turns: 1,
            },
        ]);
    }

    #[tokio::test]
    async fn cancelled_run_reports_reason() {
        let (tx, mut stream) = detached();
        tx.send(event(events::CHAT_CHUNK, 0, json!({"text": "a"}))).unwrap();
        tx.send(event(events::CHAT_CANCELLED, 1, json!({"reason": "stop"}))).unwrap();
        tx.send(StreamItem::Response(Ok(json!({"cancelled": true})))).unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), ChatEvent::Chunk("a".into()));
        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last, ChatEvent::Cancelled {
            reason: "stop".into()
        });
        assert!(last.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn error_response_ends_the_stream() {
        let (tx, mut stream) = detached();
        tx.send(StreamItem::Response(Err(ClientError::ConnectionClosed)))
            .unwrap();
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn close_stops_yielding() {
        let (tx, mut stream) = detached();
        tx.send(event(events::CHAT_CHUNK, 0, json!({"text": "a"}))).unwrap();
        stream.close();
        assert!(stream.next().await.is_none());
        assert!(tx.send(event(events::CHAT_CHUNK, 1, json!({"text": "b"}))).is_err());
    }
}
