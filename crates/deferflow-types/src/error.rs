//! Error types shared across the deferflow workspace.
//!
//! Each layer gets its own enum: `StoreError` for document-store backends
//! (used by the trait definitions in deferflow-core), `ReferenceError` for
//! resolution failures, `FlowError` for construction/validation failures,
//! and `CodecError` for canonical-encoding violations.

use thiserror::Error;
use uuid::Uuid;

/// Errors from document store backends (used by trait definitions in deferflow-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("unknown auxiliary store: '{0}'")]
    UnknownAuxiliaryStore(String),
}

/// Errors raised while resolving an output reference against the store.
#[derive(Debug, Error)]
pub enum ReferenceError {
    /// The referenced `(uuid, index)` has no output document at resolve time.
    #[error("no output recorded for uuid {uuid}")]
    Unresolvable { uuid: Uuid },

    /// A selector in the reference path did not apply to the stored output.
    #[error("selector {selector} failed on output of {uuid}: {reason}")]
    SelectorFailed {
        uuid: Uuid,
        selector: String,
        reason: String,
    },

    /// The backend failed while fetching the output document.
    #[error("store error during resolution: {0}")]
    Store(#[from] StoreError),
}

/// Errors from flow construction and validation.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The same uuid appears twice in the flow's transitive closure.
    #[error("duplicate uuid in flow: {0}")]
    DuplicateUuid(Uuid),

    /// The dependency graph contains a cycle.
    #[error("cycle detected involving job {0}")]
    CycleDetected(Uuid),

    /// A job references a uuid that is neither in the flow nor in the store.
    #[error("job {job} references {referenced}, which is neither in the flow nor resolvable")]
    UnknownDependency { job: Uuid, referenced: Uuid },

    /// A linear-order flow declares a job before one of its dependencies.
    #[error("linear order places job {job} before its dependency {dependency}")]
    LinearOrderViolation { job: Uuid, dependency: Uuid },
}

/// Errors from the canonical codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value carries no '@class' field")]
    MissingClass,

    #[error("expected class '{expected}', found '{found}'")]
    ClassMismatch { expected: String, found: String },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("class '{0}' is not registered")]
    UnknownClass(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Query("bad filter".to_string());
        assert_eq!(err.to_string(), "query error: bad filter");
    }

    #[test]
    fn test_reference_error_display() {
        let uuid = Uuid::nil();
        let err = ReferenceError::Unresolvable { uuid };
        assert!(err.to_string().contains("no output recorded"));
    }

    #[test]
    fn test_flow_error_display() {
        let err = FlowError::DuplicateUuid(Uuid::nil());
        assert!(err.to_string().contains("duplicate uuid"));
    }

    #[test]
    fn test_codec_error_display() {
        let err = CodecError::ClassMismatch {
            expected: "DateTime".to_string(),
            found: "OutputReference".to_string(),
        };
        assert!(err.to_string().contains("DateTime"));
        assert!(err.to_string().contains("OutputReference"));
    }
}
