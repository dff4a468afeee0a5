//! Decomposition prompt construction.

use serde_json::{Map, Value, json};

use super::model::{AgentProfile, Task};
use super::options::ResolvedOptions;

/// Keys with this prefix are internal bookkeeping and never leave the process.
pub const INTERNAL_KEY_PREFIX: &str = "__";

/// Appended when the serialized context exceeds the limit.
pub const TRUNCATION_MARKER: &str = "\n...[context truncated]";

const SUBTASK_TYPES: &str = "tool_call, ai_analysis, data_processing, web_search, file_operation";

/// Remove secret-looking and internal keys from every nested object.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_hidden_key(key))
                .map(|(key, v)| (key.clone(), sanitize(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

fn is_hidden_key(key: &str) -> bool {
    key.starts_with(INTERNAL_KEY_PREFIX) || key.to_lowercase().contains("secret")
}

/// Cut `text` to at most `limit` characters, marking the cut.
pub fn truncate_context(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => format!("{}{TRUNCATION_MARKER}", &text[..byte_index]),
        None => text.to_string(),
    }
}

/// Context object describing the agent and the task.
pub fn build_context(task: &Task, agent: &AgentProfile, options: &ResolvedOptions) -> Value {
    json!({
        "agent": {
            "id": agent.id,
            "name": agent.name,
            "capabilities": agent.capabilities,
            "tools": agent.tools,
            "persona": options.persona,
            "config": sanitize(&agent.config),
        },
        "task": {
            "id": task.id,
            "title": task.title,
            "description": task.description,
            "priority": task.priority,
            "inputData": sanitize(&task.input_data),
        },
    })
}

/// Full user prompt sent to the completion service.
pub fn build_prompt(task: &Task, agent: &AgentProfile, options: &ResolvedOptions) -> String {
    let context = build_context(task, agent, options);
    let serialized = serde_json::to_string_pretty(&context).unwrap_or_else(|_| context.to_string());
    let context = truncate_context(&serialized, options.context_limit);

    let mut prompt = format!(
        "Break the following task down into concrete, executable subtasks.\n\n\
         Context:\n{context}\n\n\
         Requirements:\n\
         - Respond with a JSON array only, no prose and no markdown.\n\
         - Return at most {max} subtasks.\n\
         - Each entry must have: \"title\", \"description\", \"type\" (one of: {SUBTASK_TYPES}), \
         \"inputData\" (object), \"config\" (object), \"dependencies\" (array of sibling subtask TITLES, not ids), \
         \"priority\" (number).\n\
         - Order entries so that dependencies come first.",
        max = options.max_subtasks,
    );

    for instruction in &options.instructions {
        prompt.push_str("\n- ");
        prompt.push_str(instruction);
    }
    prompt
}
