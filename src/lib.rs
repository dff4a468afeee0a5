//! Agent Exec: task decomposition and execution core.

pub mod config;
pub mod decompose;
pub mod error;
pub mod events;
pub mod llm;
pub mod queue;
pub mod runner;
pub mod store;
