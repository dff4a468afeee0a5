//! LLM-backed task decomposition.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::DecomposeError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::SubtaskStore;

use super::fallback::fallback_subtasks;
use super::graph::{prune_missing, resolve_dependencies, topological_order, validate_dependencies};
use super::model::{AgentProfile, Subtask, SubtaskType, Task};
use super::options::{AgentModelDefaults, DecompositionOptions, ResolvedOptions, agent_model_defaults, resolve};
use super::parse::parse_entries;
use super::prompt::build_prompt;

/// Title given to entries that arrive without one.
pub const UNTITLED_SUBTASK: &str = "Untitled subtask";

/// Turns tasks into persisted, dependency-ordered subtasks.
pub struct TaskDecomposer {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn SubtaskStore>,
}

impl TaskDecomposer {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn SubtaskStore>) -> Self {
        Self { llm, store }
    }

    /// Decompose `task` for `agent`.
    ///
    /// Completion and parse failures are absorbed into the fallback graph.
    /// Only a failure to persist a subtask is returned as an error.
    pub async fn decompose_task(
        &self,
        task: &Task,
        agent: &AgentProfile,
        runtime: &DecompositionOptions,
    ) -> Result<Vec<Subtask>, DecomposeError> {
        let options = resolve(task, agent, runtime);
        debug!(
            task_id = %task.id,
            model = %options.model,
            max_subtasks = options.max_subtasks,
            "Decomposing task"
        );

        let (mut ordered, used_fallback) = match self.generate(task, agent, &options).await {
            Ok(entries) => {
                let ordered = order(materialize(task, &agent_model_defaults(agent), entries));
                if ordered.is_empty() {
                    warn!(task_id = %task.id, "Every generated subtask sits on a dependency cycle; using fallback");
                    (order(fallback_subtasks(task, agent, &options, "dependency cycle")), true)
                } else {
                    (ordered, false)
                }
            }
            Err(reason) => {
                warn!(task_id = %task.id, reason = %reason, "Decomposition failed; using fallback");
                (order(fallback_subtasks(task, agent, &options, &reason)), true)
            }
        };

        if ordered.len() > options.max_subtasks {
            debug!(
                task_id = %task.id,
                dropped = ordered.len() - options.max_subtasks,
                "Truncating subtasks"
            );
            ordered.truncate(options.max_subtasks);
            prune_missing(&mut ordered);
        }

        for subtask in &ordered {
            self.store
                .save(subtask)
                .await
                .map_err(|source| DecomposeError::Persistence {
                    subtask_id: subtask.id,
                    source,
                })?;
        }

        info!(
            task_id = %task.id,
            subtasks = ordered.len(),
            fallback = used_fallback,
            "Task decomposed"
        );
        Ok(ordered)
    }

    /// Ask the model for subtask entries. `Err` carries a human-readable reason.
    async fn generate(
        &self,
        task: &Task,
        agent: &AgentProfile,
        options: &ResolvedOptions,
    ) -> Result<Vec<Map<String, Value>>, String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(persona) = &options.persona {
            messages.push(ChatMessage::system(persona.clone()));
        }
        messages.push(ChatMessage::user(build_prompt(task, agent, options)));

        let request = CompletionRequest::new(messages)
            .with_model(options.model.clone())
            .with_temperature(options.temperature as f32)
            .with_max_tokens(options.max_tokens);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| format!("completion failed: {e}"))?;

        debug!(
            task_id = %task.id,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Decomposition completion received"
        );

        parse_entries(&response.content).map_err(|e| format!("unusable completion: {e}"))
    }
}

/// Build subtasks from parsed entries and resolve their title references.
fn materialize(task: &Task, inherited: &AgentModelDefaults, entries: Vec<Map<String, Value>>) -> Vec<Subtask> {
    let mut subtasks = Vec::with_capacity(entries.len());
    let mut raw_dependencies = Vec::with_capacity(entries.len());

    for entry in entries {
        let title = entry
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED_SUBTASK);
        let subtask_type = SubtaskType::from_label(entry.get("type").and_then(Value::as_str).unwrap_or_default());

        let mut subtask = Subtask::new(&task.id, title, subtask_type);
        subtask.description = entry
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        subtask.input_data = object_or_empty(entry.get("inputData"));
        subtask.priority = entry
            .get("priority")
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite())
            .unwrap_or(0.0);

        let mut config = match entry.get("config") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        config
            .entry("model")
            .or_insert_with(|| Value::from(inherited.model.clone()));
        config
            .entry("temperature")
            .or_insert_with(|| Value::from(inherited.temperature));
        subtask.config = Value::Object(config);

        raw_dependencies.push(dependency_refs(entry.get("dependencies")));
        subtasks.push(subtask);
    }

    resolve_dependencies(&mut subtasks, &raw_dependencies);
    subtasks
}

/// Validate, prune and topologically order a batch.
fn order(mut subtasks: Vec<Subtask>) -> Vec<Subtask> {
    prune_missing(&mut subtasks);
    let report = validate_dependencies(&subtasks);
    for error in &report.errors {
        warn!(error = %error, "Subtask dependency problem");
    }
    let (ordered, _omitted) = topological_order(subtasks);
    ordered
}

fn object_or_empty(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => Value::Object(Map::new()),
    }
}

/// Raw dependency references: an array of strings, or a single string.
fn dependency_refs(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::decompose::fallback::{ANALYZE_TITLE, COLLECT_TITLE, SOLUTION_TITLE};
    use crate::error::{DatabaseError, LlmError};
    use crate::llm::{CompletionResponse, FinishReason};
    use crate::store::MemorySubtaskStore;

    struct StubLlm {
        reply: Result<String, String>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubLlm {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(content.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(reason.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    model: None,
                }),
                Err(reason) => Err(LlmError::RequestFailed {
                    provider: "stub".to_string(),
                    reason: reason.clone(),
                }),
            }
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SubtaskStore for BrokenStore {
        async fn save(&self, _subtask: &Subtask) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("disk full".into()))
        }

        async fn get_subtask(&self, _id: uuid::Uuid) -> Result<Option<Subtask>, DatabaseError> {
            Ok(None)
        }

        async fn get_subtasks(&self, _task_id: &str) -> Result<Vec<Subtask>, DatabaseError> {
            Ok(Vec::new())
        }

        async fn update_subtask(
            &self,
            _id: uuid::Uuid,
            _update: &crate::decompose::SubtaskUpdate,
        ) -> Result<bool, DatabaseError> {
            Ok(false)
        }
    }

    fn agent() -> AgentProfile {
        AgentProfile {
            id: "agent-1".into(),
            name: "Researcher".into(),
            system_prompt: Some("You plan work.".into()),
            capabilities: vec!["research".into()],
            tools: vec!["web_search".into()],
            config: json!({"model": "gpt-4o", "temperature": 0.5, "apiSecret": "do-not-send"}),
            ..Default::default()
        }
    }

    fn decomposer(llm: Arc<StubLlm>) -> (TaskDecomposer, Arc<MemorySubtaskStore>) {
        let store = Arc::new(MemorySubtaskStore::new());
        (TaskDecomposer::new(llm, store.clone()), store)
    }

    fn titles(subtasks: &[Subtask]) -> Vec<&str> {
        subtasks.iter().map(|s| s.title.as_str()).collect()
    }

    #[tokio::test]
    async fn resolves_titles_orders_and_persists() {
        let llm = StubLlm::replying(
            r#"[
                {"title": "Summarize", "type": "ai_analysis", "dependencies": ["fetch data"], "priority": 2},
                {"title": "Fetch Data", "type": "web_search", "dependencies": [], "config": {"query": "rust"}}
            ]"#,
        );
        let (decomposer, store) = decomposer(llm.clone());
        let task = Task::new("Research Rust", "Summarize the ecosystem");

        let subtasks = decomposer
            .decompose_task(&task, &agent(), &DecompositionOptions::default())
            .await
            .unwrap();

        assert_eq!(titles(&subtasks), vec!["Fetch Data", "Summarize"]);
        assert_eq!(subtasks[1].dependencies, vec![subtasks[0].id]);
        assert_eq!(subtasks[0].subtask_type, SubtaskType::WebSearch);
        assert_eq!(subtasks[0].config["query"], "rust");
        assert_eq!(subtasks[0].config["model"], "gpt-4o");
        assert_eq!(subtasks[0].config["temperature"], 0.5);
        assert_eq!(store.get_subtasks(&task.id).await.unwrap().len(), 2);

        let requests = llm.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.max_tokens, Some(2000));
        assert_eq!(request.messages[0].content, "You plan work.");
        assert!(!request.messages[1].content.contains("do-not-send"));
    }

    #[tokio::test]
    async fn entry_config_model_is_kept() {
        let llm = StubLlm::replying(r#"[{"title": "A", "config": {"model": "custom", "temperature": 1.5}}]"#);
        let (decomposer, _) = decomposer(llm);
        let subtasks = decomposer
            .decompose_task(&Task::new("t", "d"), &agent(), &DecompositionOptions::default())
            .await
            .unwrap();
        assert_eq!(subtasks[0].config["model"], "custom");
        assert_eq!(subtasks[0].config["temperature"], 1.5);
    }

    #[tokio::test]
    async fn subtasks_inherit_agent_model_not_task_override() {
        let llm = StubLlm::replying(r#"[{"title": "A"}]"#);
        let (decomposer, _) = decomposer(llm.clone());
        let task = Task::new("t", "d").with_options(DecompositionOptions {
            model: Some("task-model".into()),
            temperature: Some(1.2),
            ..Default::default()
        });

        let subtasks = decomposer
            .decompose_task(&task, &agent(), &DecompositionOptions::default())
            .await
            .unwrap();

        assert_eq!(subtasks[0].config["model"], "gpt-4o");
        assert_eq!(subtasks[0].config["temperature"], 0.5);
        let requests = llm.requests.lock().unwrap();
        assert_eq!(requests[0].model.as_deref(), Some("task-model"));
    }

    #[tokio::test]
    async fn missing_fields_get_defaults() {
        let llm = StubLlm::replying(r#"[{"type": "teleport"}, {"title": "  "}]"#);
        let (decomposer, _) = decomposer(llm);
        let subtasks = decomposer
            .decompose_task(&Task::new("t", "d"), &agent(), &DecompositionOptions::default())
            .await
            .unwrap();
        assert_eq!(titles(&subtasks), vec![UNTITLED_SUBTASK, UNTITLED_SUBTASK]);
        assert_eq!(subtasks[0].subtask_type, SubtaskType::AiAnalysis);
        assert_eq!(subtasks[0].input_data, json!({}));
        assert_eq!(subtasks[0].priority, 0.0);
        assert!(subtasks[0].dependencies.is_empty());
    }

    #[tokio::test]
    async fn non_json_reply_falls_back() {
        let llm = StubLlm::replying("Sorry, I can't do that right now.");
        let (decomposer, store) = decomposer(llm);
        let task = Task::new("Write a blog post", "About async Rust");

        let subtasks = decomposer
            .decompose_task(&task, &agent(), &DecompositionOptions::default())
            .await
            .unwrap();

        assert!(subtasks.len() >= 2);
        assert_eq!(subtasks[0].title, ANALYZE_TITLE);
        assert_eq!(subtasks[1].title, SOLUTION_TITLE);
        assert_eq!(subtasks[1].dependencies, vec![subtasks[0].id]);
        assert!(titles(&subtasks).contains(&COLLECT_TITLE));
        assert!(
            subtasks[0].config["fallbackReason"]
                .as_str()
                .unwrap()
                .contains("unusable completion")
        );
        assert_eq!(store.get_subtasks(&task.id).await.unwrap().len(), subtasks.len());
    }

    #[tokio::test]
    async fn provider_error_falls_back_with_reason() {
        let llm = StubLlm::failing("connection reset");
        let (decomposer, _) = decomposer(llm);
        let subtasks = decomposer
            .decompose_task(&Task::new("t", "d"), &AgentProfile::default(), &DecompositionOptions::default())
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 2);
        let prompt = subtasks[0].config["prompt"].as_str().unwrap();
        assert!(prompt.contains("connection reset"));
    }

    #[tokio::test]
    async fn mutual_dependency_does_not_hang() {
        let llm = StubLlm::replying(
            r#"[
                {"title": "A", "dependencies": ["B"]},
                {"title": "B", "dependencies": ["A"]},
                {"title": "C", "dependencies": []}
            ]"#,
        );
        let (decomposer, _) = decomposer(llm);
        let subtasks = decomposer
            .decompose_task(&Task::new("t", "d"), &agent(), &DecompositionOptions::default())
            .await
            .unwrap();
        assert_eq!(titles(&subtasks), vec!["C"]);
    }

    #[tokio::test]
    async fn fully_cyclic_output_falls_back() {
        let llm = StubLlm::replying(r#"[{"title": "A", "dependencies": ["B"]}, {"title": "B", "dependencies": ["A"]}]"#);
        let (decomposer, _) = decomposer(llm);
        let subtasks = decomposer
            .decompose_task(&Task::new("t", "d"), &AgentProfile::default(), &DecompositionOptions::default())
            .await
            .unwrap();
        assert_eq!(titles(&subtasks), vec![ANALYZE_TITLE, SOLUTION_TITLE]);
    }

    #[tokio::test]
    async fn truncates_to_max_subtasks_in_order() {
        let entries: Vec<Value> = (0..6)
            .map(|i| {
                let deps: Vec<String> = if i == 0 { vec![] } else { vec![format!("Step {}", i - 1)] };
                json!({"title": format!("Step {i}"), "dependencies": deps})
            })
            .rev()
            .collect();
        let llm = StubLlm::replying(&serde_json::to_string(&entries).unwrap());
        let (decomposer, store) = decomposer(llm);
        let runtime = DecompositionOptions {
            max_subtasks: Some(3),
            ..Default::default()
        };
        let task = Task::new("t", "d");

        let subtasks = decomposer.decompose_task(&task, &agent(), &runtime).await.unwrap();
        assert_eq!(titles(&subtasks), vec!["Step 0", "Step 1", "Step 2"]);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn persistence_failure_is_an_error() {
        let llm = StubLlm::replying(r#"[{"title": "A"}]"#);
        let decomposer = TaskDecomposer::new(llm, Arc::new(BrokenStore));
        let err = decomposer
            .decompose_task(&Task::new("t", "d"), &agent(), &DecompositionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Persistence { .. }));
    }

    #[test]
    fn dependency_refs_accept_string_or_array() {
        assert_eq!(dependency_refs(Some(&json!("A"))), vec!["A"]);
        assert_eq!(dependency_refs(Some(&json!(["A", 2, null]))), vec!["A", "2"]);
        assert!(dependency_refs(None).is_empty());
    }
}
