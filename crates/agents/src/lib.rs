//! LLM providers and the agent run abstraction.
//!
//! A chat request becomes an [`AgentRun`]: either a plain text stream
//! ([`run::text_run`]) or the tool-calling loop ([`runner::agent_run`]).

pub mod event;
pub mod memory;
pub mod model;
pub mod prompt;
pub mod providers;
pub mod run;
pub mod runner;
pub mod tool_registry;

pub use {
    event::AgentEvent,
    memory::MemoryContextSource,
    model::{CompletionResponse, LlmProvider, StreamEvent, ToolCall, Usage},
    providers::{EchoProvider, ProviderRegistry},
    run::{AgentRun, StreamRun},
    tool_registry::{AgentTool, ToolRegistry},
};
