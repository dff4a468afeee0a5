//! Task, agent and subtask data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::options::DecompositionOptions;

/// A unit of work requested by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub decomposition_options: Option<DecompositionOptions>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            priority: 0.0,
            created_at: Utc::now(),
            input_data: serde_json::json!({}),
            decomposition_options: None,
        }
    }

    pub fn with_input(mut self, input_data: serde_json::Value) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn with_options(mut self, options: DecompositionOptions) -> Self {
        self.decomposition_options = Some(options);
        self
    }
}

/// The agent a task is decomposed for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub name: String,
    /// Persona used as the system message unless overridden.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    /// General agent config. Its `decomposer` key holds decomposer overrides.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentProfile {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

/// Kind of work a subtask performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskType {
    ToolCall,
    #[default]
    AiAnalysis,
    DataProcessing,
    WebSearch,
    FileOperation,
}

impl SubtaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::AiAnalysis => "ai_analysis",
            Self::DataProcessing => "data_processing",
            Self::WebSearch => "web_search",
            Self::FileOperation => "file_operation",
        }
    }

    /// Parse a label; anything unrecognised is `AiAnalysis`.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "tool_call" => Self::ToolCall,
            "data_processing" => Self::DataProcessing,
            "web_search" => Self::WebSearch,
            "file_operation" => Self::FileOperation,
            _ => Self::AiAnalysis,
        }
    }
}

impl std::fmt::Display for SubtaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a decomposed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub subtask_type: SubtaskType,
    pub input_data: serde_json::Value,
    pub config: serde_json::Value,
    pub status: SubtaskStatus,
    pub priority: f64,
    /// Sibling subtask ids this one waits for.
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl Subtask {
    pub fn new(task_id: impl Into<String>, title: impl Into<String>, subtask_type: SubtaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            parent_id: None,
            title: title.into(),
            description: String::new(),
            subtask_type,
            input_data: serde_json::json!({}),
            config: serde_json::json!({}),
            status: SubtaskStatus::Pending,
            priority: 0.0,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            output_data: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &SubtaskUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(input) = &update.input_data {
            self.input_data = input.clone();
        }
        if let Some(output) = &update.output_data {
            self.output_data = Some(output.clone());
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        if let Some(ms) = update.duration_ms {
            self.duration_ms = Some(ms);
        }
    }
}

/// Partial update for a stored subtask. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskUpdate {
    pub status: Option<SubtaskStatus>,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl SubtaskUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn status(status: SubtaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_ai_analysis() {
        assert_eq!(SubtaskType::from_label("web_search"), SubtaskType::WebSearch);
        assert_eq!(SubtaskType::from_label("make_coffee"), SubtaskType::AiAnalysis);
        assert_eq!(SubtaskType::from_label(""), SubtaskType::AiAnalysis);
    }

    #[test]
    fn subtask_serializes_type_field() {
        let subtask = Subtask::new("task-1", "Fetch", SubtaskType::ToolCall);
        let json = serde_json::to_value(&subtask).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["taskId"], "task-1");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn apply_update_touches_only_set_fields() {
        let mut subtask = Subtask::new("t", "x", SubtaskType::AiAnalysis);
        subtask.apply(&SubtaskUpdate {
            status: Some(SubtaskStatus::Completed),
            output_data: Some(serde_json::json!({"ok": true})),
            duration_ms: Some(42),
            ..Default::default()
        });
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.output_data, Some(serde_json::json!({"ok": true})));
        assert_eq!(subtask.duration_ms, Some(42));
        assert!(subtask.error_message.is_none());
        assert!(subtask.started_at.is_none());
    }

    #[test]
    fn empty_update() {
        assert!(SubtaskUpdate::default().is_empty());
        assert!(!SubtaskUpdate::status(SubtaskStatus::Running).is_empty());
    }

    #[test]
    fn agent_profile_lookup() {
        let agent = AgentProfile {
            capabilities: vec!["research".into()],
            tools: vec!["web_search".into()],
            ..Default::default()
        };
        assert!(agent.has_capability("research"));
        assert!(agent.has_tool("web_search"));
        assert!(!agent.has_tool("write_file"));
    }
}
