//! Error types for the durable execution SDK.
//!
//! `DurableError` is what handler code and the checkpoint client return.
//! `ErrorObject` is the serialized form stored on operations and sent over
//! the checkpoint protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type name recorded for errors raised by user closures.
pub const USER_CODE_ERROR_TYPE: &str = "UserCodeError";

/// Error type name recorded for errors marked unrecoverable.
pub const UNRECOVERABLE_ERROR_TYPE: &str = "UnrecoverableError";

/// The main error type for the durable execution SDK.
#[derive(Debug, Error)]
pub enum DurableError {
    /// Execution error that fails the execution without retry.
    #[error("Execution error: {message}")]
    Execution {
        /// Error message describing what went wrong
        message: String,
    },

    /// Checkpoint error for checkpoint failures.
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Error message describing what went wrong
        message: String,
        /// Whether this error is retriable
        is_retriable: bool,
    },

    /// Callback error for callback-specific failures.
    #[error("Callback error: {message}")]
    Callback {
        /// Error message describing what went wrong
        message: String,
        /// The callback ID if available
        callback_id: Option<String>,
    },

    /// Non-deterministic execution error for replay mismatches.
    #[error("Non-deterministic execution: {message}")]
    NonDeterministic {
        /// Error message describing the mismatch
        message: String,
        /// The operation ID where the mismatch occurred
        operation_id: Option<String>,
    },

    /// Validation error for invalid configuration or arguments.
    #[error("Validation error: {message}")]
    Validation {
        /// Error message describing the validation failure
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {message}")]
    SerDes {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Signal to stop the current invocation and hand control back to the
    /// orchestrator. The execution is re-invoked later.
    #[error("Suspend execution")]
    Suspend {
        /// Epoch milliseconds at which the execution should resume, if known
        scheduled_timestamp: Option<i64>,
    },

    /// User code error wrapping errors from user-provided closures.
    #[error("User code error: {message}")]
    UserCode {
        /// Error message from the user code
        message: String,
        /// The type of error
        error_type: String,
        /// Optional stack trace
        stack_trace: Option<String>,
    },

    /// An error that must not be retried. Step retry policies are bypassed
    /// and the execution terminates with this error.
    #[error("Unrecoverable error: {message}")]
    Unrecoverable {
        /// Error message from the user code
        message: String,
    },
}

impl DurableError {
    /// Creates a new Execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a new retriable Checkpoint error.
    pub fn checkpoint_retriable(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            is_retriable: true,
        }
    }

    /// Creates a new non-retriable Checkpoint error.
    pub fn checkpoint_non_retriable(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            is_retriable: false,
        }
    }

    /// Creates a new Callback error.
    pub fn callback(message: impl Into<String>, callback_id: Option<String>) -> Self {
        Self::Callback {
            message: message.into(),
            callback_id,
        }
    }

    /// Creates a new Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new SerDes error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Creates a Suspend signal.
    pub fn suspend() -> Self {
        Self::Suspend {
            scheduled_timestamp: None,
        }
    }

    /// Creates a Suspend signal that resumes at the given epoch milliseconds.
    pub fn suspend_until(timestamp_ms: i64) -> Self {
        Self::Suspend {
            scheduled_timestamp: Some(timestamp_ms),
        }
    }

    /// Creates a user code error.
    pub fn user_code(message: impl Into<String>) -> Self {
        Self::UserCode {
            message: message.into(),
            error_type: USER_CODE_ERROR_TYPE.to_string(),
            stack_trace: None,
        }
    }

    /// Marks an error as unrecoverable.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
        }
    }

    /// Returns true if this is a suspend signal.
    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend { .. })
    }

    /// Returns true if this error bypasses step retry.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Unrecoverable { .. } => true,
            Self::UserCode { error_type, .. } => error_type == UNRECOVERABLE_ERROR_TYPE,
            _ => false,
        }
    }

    /// Returns true if the checkpoint call may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Checkpoint { is_retriable: true, .. })
    }

    /// Returns the error type name recorded in an [`ErrorObject`].
    pub fn error_type(&self) -> &str {
        match self {
            Self::Execution { .. } => "ExecutionError",
            Self::Checkpoint { .. } => "CheckpointError",
            Self::Callback { .. } => "CallbackError",
            Self::NonDeterministic { .. } => "NonDeterministicExecutionError",
            Self::Validation { .. } => "ValidationError",
            Self::SerDes { .. } => "SerDesError",
            Self::Suspend { .. } => "SuspendExecution",
            Self::UserCode { error_type, .. } => error_type,
            Self::Unrecoverable { .. } => UNRECOVERABLE_ERROR_TYPE,
        }
    }
}

impl From<serde_json::Error> for DurableError {
    fn from(error: serde_json::Error) -> Self {
        Self::serdes(error.to_string())
    }
}

impl From<&DurableError> for ErrorObject {
    fn from(error: &DurableError) -> Self {
        let message = match error {
            DurableError::Execution { message }
            | DurableError::Checkpoint { message, .. }
            | DurableError::Callback { message, .. }
            | DurableError::NonDeterministic { message, .. }
            | DurableError::Validation { message }
            | DurableError::SerDes { message }
            | DurableError::UserCode { message, .. }
            | DurableError::Unrecoverable { message } => message.clone(),
            DurableError::Suspend { .. } => error.to_string(),
        };
        let mut obj = ErrorObject::new(error.error_type(), message);
        if let DurableError::UserCode {
            stack_trace: Some(trace),
            ..
        } = error
        {
            obj.stack_trace = Some(trace.clone());
        }
        obj
    }
}

impl From<ErrorObject> for DurableError {
    fn from(error: ErrorObject) -> Self {
        Self::UserCode {
            message: error.error_message,
            error_type: error.error_type,
            stack_trace: error.stack_trace,
        }
    }
}

/// Result type alias for durable operations.
pub type DurableResult<T> = Result<T, DurableError>;

/// Serialized error details stored on operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type name
    #[serde(rename = "ErrorType")]
    pub error_type: String,

    /// Human-readable error message
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,

    /// Optional structured error data
    #[serde(rename = "ErrorData", skip_serializing_if = "Option::is_none")]
    pub error_data: Option<String>,

    /// Optional stack trace
    #[serde(rename = "StackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            error_data: None,
            stack_trace: None,
        }
    }

    /// Attaches structured error data.
    pub fn with_error_data(mut self, data: impl Into<String>) -> Self {
        self.error_data = Some(data.into());
        self
    }

    /// Returns the serialized size of this error in bytes.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}
