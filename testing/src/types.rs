//! Core types shared by the orchestrator and the local runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use durable_execution_sdk::{ErrorObject, Operation, OperationStatus};

/// Status of a durable execution.
///
/// # Examples
///
/// ```
/// use durable_execution_sdk_testing::ExecutionStatus;
///
/// assert!(ExecutionStatus::Succeeded.is_terminal());
/// assert!(!ExecutionStatus::Running.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::TimedOut)
    }

    /// Derives the execution status from the EXECUTION operation's status.
    pub fn from_operation_status(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Succeeded => Self::Succeeded,
            OperationStatus::Failed | OperationStatus::Stopped => Self::Failed,
            OperationStatus::Cancelled => Self::Cancelled,
            OperationStatus::TimedOut => Self::TimedOut,
            OperationStatus::Started | OperationStatus::Ready | OperationStatus::Pending => {
                Self::Running
            }
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Error information from a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultError {
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_data: Option<String>,
    pub stack_trace: Option<Vec<String>>,
}

impl TestResultError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
            error_data: None,
            stack_trace: None,
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            error_type: None,
            error_message: Some(message.into()),
            error_data: None,
            stack_trace: None,
        }
    }
}

impl std::fmt::Display for TestResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error_type, &self.error_message) {
            (Some(t), Some(m)) => write!(f, "{}: {}", t, m),
            (None, Some(m)) => write!(f, "{}", m),
            (Some(t), None) => write!(f, "{}", t),
            (None, None) => write!(f, "Unknown error"),
        }
    }
}

impl std::error::Error for TestResultError {}

impl From<ErrorObject> for TestResultError {
    fn from(error: ErrorObject) -> Self {
        Self {
            error_type: Some(error.error_type),
            error_message: Some(error.error_message),
            error_data: error.error_data,
            stack_trace: error.stack_trace.map(|s| s.lines().map(str::to_string).collect()),
        }
    }
}

/// One handler invocation within an execution.
///
/// Records the operations that were observed completing while this
/// invocation was the active one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub error: Option<TestResultError>,
    operations: Vec<Operation>,
}

impl Invocation {
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            error: None,
            operations: Vec::new(),
        }
    }

    /// Records an operation observed by this invocation, replacing an
    /// earlier snapshot of the same operation.
    pub(crate) fn record_operation(&mut self, operation: Operation) {
        match self
            .operations
            .iter_mut()
            .find(|op| op.operation_id == operation.operation_id)
        {
            Some(existing) => *existing = operation,
            None => self.operations.push(operation),
        }
    }

    pub(crate) fn finish(&mut self, error: Option<TestResultError>) {
        self.end_timestamp = Some(Utc::now());
        self.error = error;
    }

    /// Returns the operations this invocation touched, optionally filtered by status.
    pub fn get_operations(&self, status: Option<OperationStatus>) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| status.map_or(true, |s| op.status == s))
            .collect()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_timestamp.map(|end| end - self.start_timestamp)
    }
}

/// Status to wait for in [`crate::OperationHandle::wait_for_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingOperationStatus {
    /// The operation exists
    Started,
    /// A callback has been assigned its ID
    Submitted,
    /// The operation reached a terminal status
    Completed,
}

impl std::fmt::Display for WaitingOperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}
