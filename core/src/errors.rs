//! Error taxonomy for recipe validation, admission and execution
//!
//! Validation and admission failures are returned synchronously from
//! `submit`. Execution failures travel through the result channel as a
//! [`StepError`] naming the step that raised them.

use serde::Serialize;
use thiserror::Error;

use crate::types::Tag;

/// Failure raised by an operation's run function
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationError {
    #[error("expected input of type {}, got {actual}", join_tags(.expected))]
    TypeMismatch { expected: Vec<Tag>, actual: Tag },

    #[error("{message}")]
    Domain { message: String },
}

impl OperationError {
    pub fn domain(message: impl Into<String>) -> Self {
        OperationError::Domain {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OperationError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            OperationError::Domain { .. } => ErrorKind::DomainError,
        }
    }
}

/// Execution failure attributed to one pipeline step
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("step {step_index} ({operation_id}) failed: {source}")]
pub struct StepError {
    pub step_index: usize,
    pub operation_id: String,
    pub source: OperationError,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Recipe rejected before execution
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Unknown operation '{id}' at step {step_index}")]
    UnknownOperation { step_index: usize, id: String },

    #[error(
        "Step {step_index} accepts {}, but receives {actual_tag}",
        join_tags(.expected_tags)
    )]
    TypeMismatch {
        step_index: usize,
        expected_tags: Vec<Tag>,
        actual_tag: Tag,
    },

    #[error("Invalid argument '{param_name}' at step {step_index}: {reason}")]
    InvalidArgument {
        step_index: usize,
        param_name: String,
        reason: String,
    },
}

impl ValidationError {
    pub fn step_index(&self) -> usize {
        match self {
            ValidationError::UnknownOperation { step_index, .. }
            | ValidationError::TypeMismatch { step_index, .. }
            | ValidationError::InvalidArgument { step_index, .. } => *step_index,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            ValidationError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            ValidationError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }
}

/// Reason a submission was not admitted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("Recipe rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue full: {queued} request(s) waiting, capacity {capacity}")]
    Backpressure { queued: usize, capacity: usize },

    #[error("Pool is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Validation(e) => e.kind(),
            SubmitError::Backpressure { .. } => ErrorKind::Backpressure,
            SubmitError::ShuttingDown => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Operation '{0}' is already registered")]
    Duplicate(String),

    #[error("Operation '{0}' must accept at least one input type")]
    NoInputTags(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("pool_size must be at least 1")]
    ZeroPoolSize,
}

/// Flat classification used when reporting a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownOperation,
    TypeMismatch,
    InvalidArgument,
    DomainError,
    Backpressure,
    Cancelled,
}

fn join_tags(tags: &[Tag]) -> String {
    tags.iter()
        .map(Tag::as_str)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::TypeMismatch {
            step_index: 1,
            expected_tags: vec![Tag::String],
            actual_tag: Tag::Number,
        };
        assert_eq!(err.to_string(), "Step 1 accepts string, but receives number");
        assert_eq!(err.step_index(), 1);
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_step_error_localizes_fault() {
        let err = StepError {
            step_index: 2,
            operation_id: "from_hex".to_string(),
            source: OperationError::domain("Invalid hex pair 'zz'"),
        };
        assert!(err.to_string().contains("step 2 (from_hex)"));
        assert!(err.to_string().contains("Invalid hex pair"));
        assert_eq!(err.kind(), ErrorKind::DomainError);
    }

    #[test]
    fn test_submit_error_from_validation() {
        let err: SubmitError = ValidationError::UnknownOperation {
            step_index: 0,
            id: "nope".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
    }
}
