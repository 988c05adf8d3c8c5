//! Persistence layer: warmup state, daily counters, external numbers,
//! benchmarks and health snapshots.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{ExternalNumber, WarmupStore};
