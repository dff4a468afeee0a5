//! Decomposition option layering.
//!
//! Precedence, highest first: task options, runtime defaults, the agent's
//! `config.decomposer`, the agent's general config, built-in defaults.
//! Non-finite or otherwise unusable values are skipped at their level.

use serde::{Deserialize, Serialize};

use super::model::{AgentProfile, Task};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f64 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_MAX_SUBTASKS: usize = 8;
pub const DEFAULT_CONTEXT_LIMIT: usize = 6000;

const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
const MAX_TOKENS_RANGE: (u32, u32) = (256, 4000);
const MAX_SUBTASKS_RANGE: (usize, usize) = (3, 25);
const MIN_CONTEXT_LIMIT: usize = 200;

/// One layer of decomposition settings. Unset fields defer to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecompositionOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub max_subtasks: Option<usize>,
    pub instructions: Option<Vec<String>>,
    pub persona: Option<String>,
    pub context_limit: Option<usize>,
}

impl DecompositionOptions {
    /// Read a layer out of a loosely typed JSON object.
    ///
    /// Accepts numbers as floats or integers and `instructions` as either a
    /// string or an array of strings. Anything else is ignored.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let number = |key: &str| obj.get(key).and_then(serde_json::Value::as_f64).filter(|n| n.is_finite());
        let count = |key: &str| number(key).filter(|n| *n >= 0.0).map(|n| n.round());

        let instructions = match obj.get("instructions") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(vec![s.clone()]),
            Some(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        };

        Self {
            model: non_empty(obj.get("model").and_then(|v| v.as_str())),
            temperature: number("temperature"),
            max_tokens: count("maxTokens").map(|n| n.min(u32::MAX as f64) as u32),
            max_subtasks: count("maxSubtasks").map(|n| n as usize),
            instructions,
            persona: non_empty(obj.get("persona").and_then(|v| v.as_str())),
            context_limit: count("contextLimit").map(|n| n as usize),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Fully resolved settings for one decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_subtasks: usize,
    pub instructions: Vec<String>,
    pub persona: Option<String>,
    pub context_limit: usize,
}

fn agent_layers(agent: &AgentProfile) -> (DecompositionOptions, DecompositionOptions) {
    let decomposer = agent
        .config
        .get("decomposer")
        .map(DecompositionOptions::from_json)
        .unwrap_or_default();
    (decomposer, DecompositionOptions::from_json(&agent.config))
}

fn pick_model(layers: &[&DecompositionOptions]) -> String {
    layers
        .iter()
        .find_map(|l| non_empty(l.model.as_deref()))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

fn pick_temperature(layers: &[&DecompositionOptions]) -> f64 {
    layers
        .iter()
        .find_map(|l| l.temperature.filter(|t| t.is_finite()))
        .unwrap_or(DEFAULT_TEMPERATURE)
        .clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1)
}

/// Model settings configured on the agent itself, ignoring task and runtime
/// overrides. Generated subtasks inherit these.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentModelDefaults {
    pub model: String,
    pub temperature: f64,
}

pub fn agent_model_defaults(agent: &AgentProfile) -> AgentModelDefaults {
    let (agent_decomposer, agent_general) = agent_layers(agent);
    let layers = [&agent_decomposer, &agent_general];
    AgentModelDefaults {
        model: pick_model(&layers),
        temperature: pick_temperature(&layers),
    }
}

/// Merge every layer for `task` and `agent` and clamp the result.
pub fn resolve(task: &Task, agent: &AgentProfile, runtime: &DecompositionOptions) -> ResolvedOptions {
    let task_layer = task.decomposition_options.clone().unwrap_or_default();
    let (agent_decomposer, agent_general) = agent_layers(agent);

    let layers = [&task_layer, runtime, &agent_decomposer, &agent_general];

    let model = pick_model(&layers);
    let temperature = pick_temperature(&layers);
    let max_tokens = layers
        .iter()
        .find_map(|l| l.max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS)
        .clamp(MAX_TOKENS_RANGE.0, MAX_TOKENS_RANGE.1);
    let max_subtasks = layers
        .iter()
        .find_map(|l| l.max_subtasks)
        .unwrap_or(DEFAULT_MAX_SUBTASKS)
        .clamp(MAX_SUBTASKS_RANGE.0, MAX_SUBTASKS_RANGE.1);
    let instructions = layers
        .iter()
        .find_map(|l| l.instructions.clone())
        .unwrap_or_default();
    let persona = layers
        .iter()
        .find_map(|l| non_empty(l.persona.as_deref()))
        .or_else(|| non_empty(agent.system_prompt.as_deref()));
    let context_limit = layers
        .iter()
        .find_map(|l| l.context_limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
        .max(MIN_CONTEXT_LIMIT);

    ResolvedOptions {
        model,
        temperature,
        max_tokens,
        max_subtasks,
        instructions,
        persona,
        context_limit,
    }
}
