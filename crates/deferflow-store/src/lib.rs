//! Document store backends for deferflow.
//!
//! Implements the `DocStore` port from `deferflow-core`:
//! - `MemoryDocStore` -- in-memory collections for tests and ephemeral runs.
//! - `FileDocStore` -- JSON-lines files for durable local runs.

pub mod file;
pub mod memory;

pub use file::FileDocStore;
pub use memory::MemoryDocStore;
