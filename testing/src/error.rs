//! Error types for the testing crate.
//!
//! `TestError` covers the checkpoint server, the orchestrator and the
//! local runner. [`TestError::to_error_response`] maps each variant onto the
//! status code and body a transport layer returns to its callers.

use durable_execution_sdk::{DurableError, OperationType};
use serde::Serialize;
use thiserror::Error;

use crate::types::WaitingOperationStatus;

/// Errors that can occur during testing.
///
/// # Examples
///
/// ```
/// use durable_execution_sdk_testing::TestError;
///
/// let err = TestError::invalid_parameter("Invalid parent operation id");
/// assert_eq!(err.to_error_response().status, 400);
/// ```
#[derive(Debug, Error)]
pub enum TestError {
    /// A checkpoint request failed validation. Nothing was applied.
    #[error("{0}")]
    InvalidParameterValue(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invocation not found: {0}")]
    InvocationNotFound(String),

    #[error("Callback not found: {0}")]
    CallbackNotFound(String),

    #[error("Invalid checkpoint token: {0}")]
    InvalidCheckpointToken(String),

    #[error("Invalid callback id: {0}")]
    InvalidCallbackId(String),

    /// A collaborator broke a structural contract. Fatal for the execution.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Raised by a poll cancelled through its abort signal.
    #[error("AbortError: {0}")]
    Aborted(String),

    /// The handler task panicked or was cancelled.
    #[error("Handler invocation failed: {0}")]
    HandlerInvocation(String),

    #[error("Handler execution failed: {0}")]
    ExecutionFailed(#[from] DurableError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Checkpoint server error: {0}")]
    CheckpointServerError(String),

    #[error("Not a callback operation")]
    NotCallbackOperation,

    #[error("Operation type mismatch: expected {expected}, found {found}")]
    OperationTypeMismatch {
        expected: OperationType,
        found: OperationType,
    },

    #[error("Execution completed before operation {0} reached state {1}")]
    ExecutionCompletedEarly(String, WaitingOperationStatus),

    #[error("Result not available: {0}")]
    ResultNotAvailable(String),
}

impl TestError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameterValue(message.into())
    }

    pub fn operation_not_found(id: impl Into<String>) -> Self {
        Self::OperationNotFound(id.into())
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into())
    }

    pub fn type_mismatch(expected: OperationType, found: OperationType) -> Self {
        Self::OperationTypeMismatch { expected, found }
    }

    pub fn invalid_checkpoint_token(message: impl Into<String>) -> Self {
        Self::InvalidCheckpointToken(message.into())
    }

    pub fn checkpoint_server_error(message: impl Into<String>) -> Self {
        Self::CheckpointServerError(message.into())
    }

    pub fn result_not_available(message: impl Into<String>) -> Self {
        Self::ResultNotAvailable(message.into())
    }

    /// Returns true for the error raised by an intentionally aborted poll.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Returns true for validation failures.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameterValue(_) | Self::InvalidCheckpointToken(_) | Self::InvalidCallbackId(_)
        )
    }

    /// Returns true for lookups that resolved nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OperationNotFound(_)
                | Self::ExecutionNotFound(_)
                | Self::InvocationNotFound(_)
                | Self::CallbackNotFound(_)
        )
    }

    /// Maps this error onto a transport-level response.
    pub fn to_error_response(&self) -> ErrorResponse {
        let message = self.to_string();
        if self.is_invalid_parameter() {
            ErrorResponse {
                status: 400,
                body: ErrorBody {
                    error_type: Some("InvalidParameterValueException".to_string()),
                    message,
                },
            }
        } else if self.is_not_found() {
            ErrorResponse {
                status: 404,
                body: ErrorBody {
                    error_type: None,
                    message,
                },
            }
        } else {
            ErrorResponse {
                status: 500,
                body: ErrorBody {
                    error_type: None,
                    message,
                },
            }
        }
    }
}

/// Status code and JSON body for a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub body: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub message: String,
}
