use crate::tool_registry::ToolRegistry;

const DEFAULT_BASE_PROMPT: &str = "You are a helpful personal assistant.";

/// Build the system prompt for a chat or agent run.
///
/// Sections, in order: the configured base prompt (or a default), memory
/// context, per-request instructions, then the available tools. Tool
/// schemas are also passed natively to the provider; the prompt copy lets
/// the model reason about them up front.
pub fn build_system_prompt(
    base: Option<&str>,
    tools: &ToolRegistry,
    memory_context: Option<&str>,
    instructions: Option<&str>,
) -> String {
    let mut prompt = String::from(base.unwrap_or(DEFAULT_BASE_PROMPT).trim_end());
    prompt.push_str("\n\n");

    if let Some(ctx) = memory_context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("## Memory\n\n");
        prompt.push_str(ctx.trim_end());
        prompt.push_str("\n\n");
    }

    if let Some(extra) = instructions.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("## Instructions\n\n");
        prompt.push_str(extra.trim_end());
        prompt.push_str("\n\n");
    }

    let tool_schemas = tools.list_schemas();
    if !tool_schemas.is_empty() {
        prompt.push_str("## Available Tools\n\n");
        for schema in &tool_schemas {
            let name = schema["name"].as_str().unwrap_or("unknown");
            let desc = schema["description"].as_str().unwrap_or("");
            let params = &schema["parameters"];
            prompt.push_str(&format!(
                "### {name}\n{desc}\n\nParameters:\n```json\n{}\n```\n\n",
                serde_json::to_string_pretty(params).unwrap_or_default()
            ));
        }
    }

    prompt.truncate(prompt.trim_end().len());
    prompt
}
