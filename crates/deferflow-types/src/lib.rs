//! Shared domain types for deferflow.
//!
//! This crate contains the core domain types used across the deferflow
//! workspace: `OutputReference`, `Job`, `Flow`, `Response`, `OutputDocument`,
//! the canonical codec, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod codec;
pub mod document;
pub mod error;
pub mod flow;
pub mod job;
pub mod reference;
pub mod response;

pub use document::{BlobStub, OutputDocument};
pub use error::{CodecError, FlowError, ReferenceError, StoreError};
pub use flow::{Flow, FlowNode, FlowOrder};
pub use job::{FunctionToken, Job, JobConfig, UpdateMode};
pub use reference::{ItemKey, OnMissing, OutputReference, Selector};
pub use response::{Response, ScheduleChange};
