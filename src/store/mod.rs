//! Persistence layer: subtask storage backed by libSQL, plus an in-memory
//! implementation.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlSubtaskStore;
pub use memory::MemorySubtaskStore;
pub use traits::SubtaskStore;
