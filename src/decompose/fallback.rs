//! Deterministic subtask graph used when decomposition fails.

use serde_json::json;

use super::model::{AgentProfile, Subtask, SubtaskType, Task};
use super::options::ResolvedOptions;

pub const ANALYZE_TITLE: &str = "Analyze requirements";
pub const SOLUTION_TITLE: &str = "Generate solution";
pub const COLLECT_TITLE: &str = "Collect information";
pub const PROCESS_TITLE: &str = "Process data";
pub const REPORT_TITLE: &str = "Generate report";

const SOLUTION_TEMPERATURE: f64 = 0.7;
const SEARCH_MAX_RESULTS: u32 = 5;

/// Build the fallback graph for `task`.
///
/// Always yields "Analyze requirements" followed by "Generate solution".
/// Extra nodes are added for capability/tool pairs the agent has; every
/// non-root node depends on the analysis node.
pub fn fallback_subtasks(
    task: &Task,
    agent: &AgentProfile,
    options: &ResolvedOptions,
    reason: &str,
) -> Vec<Subtask> {
    let input = serde_json::to_string_pretty(&task.input_data).unwrap_or_default();

    let mut analyze = Subtask::new(&task.id, ANALYZE_TITLE, SubtaskType::AiAnalysis);
    analyze.description = "Analyze the goals and requirements of the task".to_string();
    analyze.input_data = task.input_data.clone();
    analyze.priority = 1.0;
    analyze.config = json!({
        "prompt": format!(
            "Analyze the requirements and goals of the following task.\n\n\
             Task: {}\nDescription: {}\nInput data: {input}\n\n\
             Automatic decomposition was unavailable ({reason}); provide a detailed requirements analysis.",
            task.title, task.description,
        ),
        "model": options.model,
        "temperature": options.temperature,
        "fallbackReason": reason,
    });
    let root = analyze.id;

    let mut solution = Subtask::new(&task.id, SOLUTION_TITLE, SubtaskType::AiAnalysis);
    solution.description = "Produce a solution based on the requirements analysis".to_string();
    solution.priority = 2.0;
    solution.dependencies = vec![root];
    solution.config = json!({
        "prompt": format!(
            "Based on the requirements analysis, produce a concrete solution.\n\n\
             Task: {}\nDescription: {}\n\nProvide a detailed solution.",
            task.title, task.description,
        ),
        "model": options.model,
        "temperature": SOLUTION_TEMPERATURE,
    });

    let mut subtasks = vec![analyze, solution];

    if agent.has_capability("research") && agent.has_tool("web_search") {
        let mut collect = Subtask::new(&task.id, COLLECT_TITLE, SubtaskType::WebSearch);
        collect.description = "Search the web for relevant information".to_string();
        collect.priority = 3.0;
        collect.dependencies = vec![root];
        collect.config = json!({"query": task.title, "maxResults": SEARCH_MAX_RESULTS});
        subtasks.push(collect);
    }

    if agent.has_capability("data_processing") && agent.has_tool("data_transform") {
        let mut process = Subtask::new(&task.id, PROCESS_TITLE, SubtaskType::DataProcessing);
        process.description = "Transform and analyze the collected data".to_string();
        process.priority = 4.0;
        process.dependencies = vec![root];
        process.config = json!({
            "operation": "transform",
            "config": {"mapping": {"processed_data": "raw_data", "summary": "description"}},
        });
        subtasks.push(process);
    }

    if agent.has_capability("writing") && agent.has_tool("write_file") {
        let mut report = Subtask::new(&task.id, REPORT_TITLE, SubtaskType::FileOperation);
        report.description = "Write the final task report".to_string();
        report.priority = 5.0;
        report.dependencies = vec![root];
        report.config = json!({
            "operation": "write",
            "filePath": format!("./reports/{}_report.md", task.id),
            "content": format!("# Report: {}\n", task.title),
        });
        subtasks.push(report);
    }

    subtasks
}
