use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    event::AgentEvent,
    model::{CompletionResponse, LlmProvider},
    run::StreamRun,
    tool_registry::ToolRegistry,
};

/// Run the agent loop: send messages to the LLM, execute tool calls, repeat.
///
/// Each LLM round-trip is one turn. The run yields the assistant text, a
/// `ToolStart`/`ToolResult` pair per tool call, a `TurnComplete` after every
/// turn, and `Done` once the model answers without calling tools. Exceeding
/// `max_turns` is an error.
pub fn agent_run(
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    mut messages: Vec<serde_json::Value>,
    max_turns: u32,
) -> StreamRun {
    StreamRun::new(async_stream::stream! {
        let tool_schemas = tools.list_schemas();
        let mut total_tool_calls = 0usize;

        for turn in 1..=max_turns {
            debug!(turn, "calling LLM");
            let response: CompletionResponse = match provider.complete(&messages, &tool_schemas).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };

            if let Some(text) = response.text.as_ref().filter(|t| !t.is_empty()) {
                yield Ok(AgentEvent::Text(text.clone()));
            }

            if response.tool_calls.is_empty() {
                yield Ok(AgentEvent::TurnComplete { turn_number: turn });
                info!(turns = turn, tool_calls = total_tool_calls, "agent loop complete");
                yield Ok(AgentEvent::Done { turns: turn });
                return;
            }

            // Append assistant message with tool calls.
            let tool_calls_json: Vec<serde_json::Value> = response
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let mut assistant_msg = serde_json::json!({
                "role": "assistant",
                "tool_calls": tool_calls_json,
            });
            if let Some(ref text) = response.text {
                assistant_msg["content"] = serde_json::Value::String(text.clone());
            }
            messages.push(assistant_msg);

            for tc in &response.tool_calls {
                total_tool_calls += 1;
                yield Ok(AgentEvent::ToolStart {
                    tool: tc.name.clone(),
                    input: tc.arguments.clone(),
                    tool_use_id: tc.id.clone(),
                });

                let (result, is_error) = match tools.get(&tc.name) {
                    Some(tool) => match tool.execute(tc.arguments.clone()).await {
                        Ok(val) => (val, false),
                        Err(e) => {
                            warn!(tool = %tc.name, error = %e, "tool execution failed");
                            (serde_json::json!({ "error": e.to_string() }), true)
                        },
                    },
                    None => {
                        warn!(tool = %tc.name, "unknown tool");
                        (
                            serde_json::json!({ "error": format!("unknown tool: {}", tc.name) }),
                            true,
                        )
                    },
                };

                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tc.id,
                    "content": result.to_string(),
                }));
                yield Ok(AgentEvent::ToolResult {
                    tool: tc.name.clone(),
                    result,
                    tool_use_id: tc.id.clone(),
                    is_error,
                });
            }

            yield Ok(AgentEvent::TurnComplete { turn_number: turn });
        }

        warn!(max_turns, "agent loop exceeded max turns");
        yield Err(anyhow::anyhow!("agent loop exceeded max turns ({max_turns})"));
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::{
            model::{StreamEvent, ToolCall, Usage},
            run::AgentRun,
            tool_registry::AgentTool,
        },
        async_trait::async_trait,
        std::{
            pin::Pin,
            sync::atomic::{AtomicUsize, Ordering},
        },
        tokio_stream::Stream,
    };

    /// Makes `tool_rounds` tool calls, then answers with text.
    struct ToolCallingProvider {
        tool_rounds: usize,
        call_count: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ToolCallingProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn id(&self) -> &str {
            "mock-model"
        }

        async fn complete(
            &self,
            _messages: &[serde_json::Value],
            _tools: &[serde_json::Value],
        ) -> anyhow::Result<CompletionResponse> {
            let count = self.call_count.fetch_add(1, Ordering::SeqCst);
            if count < self.tool_rounds {
                Ok(CompletionResponse {
                    text: None,
                    tool_calls: vec![ToolCall {
                        id: format!("call_{count}"),
                        name: "echo_tool".into(),
                        arguments: serde_json::json!({"text": "hi"}),
                    }],
                    usage: Usage::default(),
                })
            } else {
                Ok(CompletionResponse {
                    text: Some("Done!".into()),
                    tool_calls: vec![],
                    usage: Usage::default(),
                })
            }
        }

        fn stream(
            &self,
            _messages: Vec<serde_json::Value>,
        ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
            Box::pin(tokio_stream::empty())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo_tool"
        }

        fn description(&self) -> &str {
            "Echoes input"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(params)
        }
    }

    async fn collect(mut run: StreamRun) -> (Vec<AgentEvent>, Option<anyhow::Error>) {
        let mut events = Vec::new();
        while let Some(item) = run.next().await {
            match item {
                Ok(ev) => events.push(ev),
                Err(e) => return (events, Some(e)),
            }
        }
        (events, None)
    }

    fn provider(tool_rounds: usize) -> Arc<dyn LlmProvider> {
        Arc::new(ToolCallingProvider {
            tool_rounds,
            call_count: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn simple_text_response() {
        let (events, err) = collect(agent_run(provider(0), ToolRegistry::new(), vec![], 5)).await;
        assert!(err.is_none());
        assert_eq!(events, vec![
            AgentEvent::Text("Done!".into()),
            AgentEvent::TurnComplete { turn_number: 1 },
            AgentEvent::Done { turns: 1 },
        ]);
    }

    #[tokio::test]
    async fn tool_call_loop_emits_ordered_events() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));

        let (events, err) = collect(agent_run(provider(1), tools, vec![], 5)).await;
        assert!(err.is_none());
        assert_eq!(events, vec![
            AgentEvent::ToolStart {
                tool: "echo_tool".into(),
                input: serde_json::json!({"text": "hi"}),
                tool_use_id: "call_0".into(),
            },
            AgentEvent::ToolResult {
                tool: "echo_tool".into(),
                result: serde_json::json!({"text": "hi"}),
                tool_use_id: "call_0".into(),
                is_error: false,
            },
            AgentEvent::TurnComplete { turn_number: 1 },
            AgentEvent::Text("Done!".into()),
            AgentEvent::TurnComplete { turn_number: 2 },
            AgentEvent::Done { turns: 2 },
        ]);
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_result() {
        let (events, _) = collect(agent_run(provider(1), ToolRegistry::new(), vec![], 5)).await;
        let AgentEvent::ToolResult {
            result, is_error, ..
        } = &events[1]
        else {
            panic!("expected tool result, got {:?}", events[1]);
        };
        assert!(is_error);
        assert_eq!(result["error"], "unknown tool: echo_tool");
    }

    #[tokio::test]
    async fn max_turns_is_enforced() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));

        let (events, err) = collect(agent_run(provider(10), tools, vec![], 2)).await;
        assert_eq!(
            err.unwrap().to_string(),
            "agent loop exceeded max turns (2)"
        );
        let turns: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::TurnComplete { .. }))
            .collect();
        assert_eq!(turns.len(), 2);
    }
}
