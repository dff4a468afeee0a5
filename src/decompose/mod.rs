//! Task decomposition.
//!
//! `TaskDecomposer` asks the completion service for a JSON list of subtasks,
//! resolves the title-based dependencies between them, orders them
//! topologically and persists the result. When the model output is unusable
//! a deterministic fallback graph is produced instead.

pub mod decomposer;
pub mod fallback;
pub mod graph;
pub mod model;
pub mod options;
pub mod parse;
pub mod prompt;

pub use decomposer::{TaskDecomposer, UNTITLED_SUBTASK};
pub use graph::{DependencyReport, normalize_title, validate_dependencies};
pub use model::{AgentProfile, Subtask, SubtaskStatus, SubtaskType, SubtaskUpdate, Task};
pub use options::{AgentModelDefaults, DecompositionOptions, ResolvedOptions, agent_model_defaults};
