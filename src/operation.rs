//! Operation types for the durable execution SDK.
//!
//! An [`Operation`] is the durable record of one unit of work. Workers never
//! write operations directly; they submit [`OperationUpdate`]s through a
//! checkpoint call and the checkpoint service derives the new operation state.

use serde::{Deserialize, Serialize};

use crate::error::ErrorObject;

/// Represents a checkpointed operation in a durable execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier for this operation within its execution
    #[serde(rename = "OperationId")]
    pub operation_id: String,

    /// The type of operation
    #[serde(rename = "OperationType")]
    pub operation_type: OperationType,

    /// Current status of the operation
    #[serde(rename = "Status")]
    pub status: OperationStatus,

    /// Parent CONTEXT operation ID for nested operations
    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Optional human-readable name, not unique
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form subtype label
    #[serde(rename = "SubType", skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,

    /// Epoch milliseconds when the operation was created
    #[serde(rename = "StartTimestamp", skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,

    /// Epoch milliseconds when the operation reached a terminal status
    #[serde(rename = "EndTimestamp", skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,

    #[serde(rename = "ExecutionDetails", skip_serializing_if = "Option::is_none")]
    pub execution_details: Option<ExecutionDetails>,

    #[serde(rename = "StepDetails", skip_serializing_if = "Option::is_none")]
    pub step_details: Option<StepDetails>,

    #[serde(rename = "WaitDetails", skip_serializing_if = "Option::is_none")]
    pub wait_details: Option<WaitDetails>,

    #[serde(rename = "CallbackDetails", skip_serializing_if = "Option::is_none")]
    pub callback_details: Option<CallbackDetails>,

    #[serde(rename = "ContextDetails", skip_serializing_if = "Option::is_none")]
    pub context_details: Option<ContextDetails>,

    #[serde(rename = "ChainedInvokeDetails", skip_serializing_if = "Option::is_none")]
    pub chained_invoke_details: Option<ChainedInvokeDetails>,
}

impl Operation {
    /// Creates a new STARTED operation with the given ID and type.
    pub fn new(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type,
            status: OperationStatus::Started,
            parent_id: None,
            name: None,
            sub_type: None,
            start_timestamp: None,
            end_timestamp: None,
            execution_details: None,
            step_details: None,
            wait_details: None,
            callback_details: None,
            context_details: None,
            chained_invoke_details: None,
        }
    }

    /// Sets the parent ID for this operation.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the name for this operation.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the status for this operation.
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true if the operation has reached a terminal status.
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the operation succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the operation failed, was cancelled, stopped or timed out.
    pub fn is_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// Returns the serialized result stored in the type-specific details.
    pub fn result(&self) -> Option<&str> {
        match self.operation_type {
            OperationType::Step => self.step_details.as_ref()?.result.as_deref(),
            OperationType::Callback => self.callback_details.as_ref()?.result.as_deref(),
            OperationType::Context => self.context_details.as_ref()?.result.as_deref(),
            OperationType::Invoke => self.chained_invoke_details.as_ref()?.result.as_deref(),
            OperationType::Execution | OperationType::Wait => None,
        }
    }

    /// Returns the error stored in the type-specific details.
    pub fn error(&self) -> Option<&ErrorObject> {
        match self.operation_type {
            OperationType::Step => self.step_details.as_ref()?.error.as_ref(),
            OperationType::Callback => self.callback_details.as_ref()?.error.as_ref(),
            OperationType::Context => self.context_details.as_ref()?.error.as_ref(),
            OperationType::Invoke => self.chained_invoke_details.as_ref()?.error.as_ref(),
            OperationType::Execution | OperationType::Wait => None,
        }
    }
}

/// The type of operation in a durable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// The root execution operation
    Execution,
    /// A step operation (unit of work)
    Step,
    /// A wait/sleep operation
    Wait,
    /// A callback operation waiting for an external signal
    Callback,
    /// A context operation grouping child operations
    Context,
    /// A chained invoke of another function
    Invoke,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "EXECUTION"),
            Self::Step => write!(f, "STEP"),
            Self::Wait => write!(f, "WAIT"),
            Self::Callback => write!(f, "CALLBACK"),
            Self::Context => write!(f, "CONTEXT"),
            Self::Invoke => write!(f, "INVOKE"),
        }
    }
}

/// The status of an operation in a durable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Operation has started but not completed
    Started,
    /// A retried step whose delay has elapsed and may run again
    Ready,
    /// A retried step waiting for its next attempt
    Pending,
    /// Operation completed successfully
    Succeeded,
    /// Operation failed with an error
    Failed,
    /// Operation was cancelled
    Cancelled,
    /// Operation was stopped externally
    Stopped,
    /// Operation timed out
    TimedOut,
}

impl OperationStatus {
    /// Returns true if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started | Self::Ready | Self::Pending)
    }

    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::TimedOut | Self::Stopped
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Ready => write!(f, "READY"),
            Self::Pending => write!(f, "PENDING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Action to perform on an operation during checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationAction {
    /// Start a new operation
    Start,
    /// Mark operation as succeeded
    Succeed,
    /// Mark operation as failed
    Fail,
    /// Schedule another attempt of a step
    Retry,
    /// Cancel a wait, callback or invoke
    Cancel,
}

impl OperationAction {
    /// Returns the status an operation ends up in after this action.
    pub fn resulting_status(&self) -> OperationStatus {
        match self {
            Self::Start => OperationStatus::Started,
            Self::Succeed => OperationStatus::Succeeded,
            Self::Fail => OperationStatus::Failed,
            Self::Retry => OperationStatus::Pending,
            Self::Cancel => OperationStatus::Cancelled,
        }
    }

    /// Returns true for SUCCEED and FAIL.
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Succeed | Self::Fail)
    }
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Succeed => write!(f, "SUCCEED"),
            Self::Fail => write!(f, "FAIL"),
            Self::Retry => write!(f, "RETRY"),
            Self::Cancel => write!(f, "CANCEL"),
        }
    }
}

/// Details of the root EXECUTION operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetails {
    /// The serialized input the execution was started with
    #[serde(rename = "InputPayload", skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<String>,
}

/// Details of a STEP operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDetails {
    /// Number of attempts recorded so far
    #[serde(rename = "Attempt", skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Epoch milliseconds of the next scheduled attempt
    #[serde(rename = "NextAttemptTimestamp", skip_serializing_if = "Option::is_none")]
    pub next_attempt_timestamp: Option<i64>,

    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Details of a WAIT operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitDetails {
    /// Epoch milliseconds at which the wait elapses
    #[serde(rename = "ScheduledEndTimestamp", skip_serializing_if = "Option::is_none")]
    pub scheduled_end_timestamp: Option<i64>,
}

/// Details of a CALLBACK operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackDetails {
    /// Opaque identifier external systems use to complete the callback
    #[serde(rename = "CallbackId", skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,

    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Details of a CONTEXT operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDetails {
    /// Whether children of this context are returned on replay once it completes
    #[serde(rename = "ReplayChildren", skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,

    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Details of an INVOKE operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainedInvokeDetails {
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Options for STEP updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Delay before the next attempt, used with RETRY
    #[serde(rename = "NextAttemptDelaySeconds", skip_serializing_if = "Option::is_none")]
    pub next_attempt_delay_seconds: Option<u64>,
}

/// Options for WAIT updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitOptions {
    /// Wait duration, honoured to millisecond precision
    #[serde(rename = "WaitSeconds")]
    pub wait_seconds: f64,
}

/// Options for CALLBACK updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackOptions {
    #[serde(rename = "TimeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(rename = "HeartbeatTimeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_seconds: Option<u64>,
}

/// Options for CONTEXT updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    #[serde(rename = "ReplayChildren", skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,
}

/// Options for INVOKE updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainedInvokeOptions {
    #[serde(rename = "FunctionName")]
    pub function_name: String,
}

/// A proposed mutation of an operation, submitted through a checkpoint call.
///
/// An update whose ID is unknown creates the operation; an update with a
/// known ID mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    #[serde(rename = "OperationId")]
    pub operation_id: String,

    /// The action to perform
    #[serde(rename = "Action")]
    pub action: OperationAction,

    #[serde(rename = "OperationType")]
    pub operation_type: OperationType,

    #[serde(rename = "SubType", skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,

    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Serialized result (SUCCEED) or input payload
    #[serde(rename = "Payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Error details (FAIL, RETRY)
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,

    #[serde(rename = "StepOptions", skip_serializing_if = "Option::is_none")]
    pub step_options: Option<StepOptions>,

    #[serde(rename = "WaitOptions", skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,

    #[serde(rename = "CallbackOptions", skip_serializing_if = "Option::is_none")]
    pub callback_options: Option<CallbackOptions>,

    #[serde(rename = "ContextOptions", skip_serializing_if = "Option::is_none")]
    pub context_options: Option<ContextOptions>,

    #[serde(rename = "ChainedInvokeOptions", skip_serializing_if = "Option::is_none")]
    pub chained_invoke_options: Option<ChainedInvokeOptions>,
}

impl OperationUpdate {
    /// Creates an update with the given action and no payload.
    pub fn new(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        action: OperationAction,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            action,
            operation_type,
            sub_type: None,
            parent_id: None,
            name: None,
            payload: None,
            error: None,
            step_options: None,
            wait_options: None,
            callback_options: None,
            context_options: None,
            chained_invoke_options: None,
        }
    }

    /// Creates a new OperationUpdate to start an operation.
    pub fn start(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::new(operation_id, operation_type, OperationAction::Start)
    }

    /// Creates a new OperationUpdate to mark an operation as succeeded.
    pub fn succeed(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        payload: Option<String>,
    ) -> Self {
        let mut update = Self::new(operation_id, operation_type, OperationAction::Succeed);
        update.payload = payload;
        update
    }

    /// Creates a new OperationUpdate to mark an operation as failed.
    pub fn fail(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        error: ErrorObject,
    ) -> Self {
        let mut update = Self::new(operation_id, operation_type, OperationAction::Fail);
        update.error = Some(error);
        update
    }

    /// Creates a STEP RETRY update scheduling the next attempt after `delay_seconds`.
    pub fn retry(operation_id: impl Into<String>, error: ErrorObject, delay_seconds: u64) -> Self {
        let mut update = Self::new(operation_id, OperationType::Step, OperationAction::Retry);
        update.error = Some(error);
        update.step_options = Some(StepOptions {
            next_attempt_delay_seconds: Some(delay_seconds),
        });
        update
    }

    /// Creates a CANCEL update.
    pub fn cancel(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::new(operation_id, operation_type, OperationAction::Cancel)
    }

    /// Sets the parent ID for this operation update.
    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the parent ID if one is given.
    pub fn with_optional_parent_id(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Sets the name for this operation update.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the name if one is given.
    pub fn with_optional_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_wait_seconds(mut self, wait_seconds: f64) -> Self {
        self.wait_options = Some(WaitOptions { wait_seconds });
        self
    }

    pub fn with_callback_options(
        mut self,
        timeout_seconds: Option<u64>,
        heartbeat_timeout_seconds: Option<u64>,
    ) -> Self {
        self.callback_options = Some(CallbackOptions {
            timeout_seconds,
            heartbeat_timeout_seconds,
        });
        self
    }

    pub fn with_replay_children(mut self, replay_children: bool) -> Self {
        self.context_options = Some(ContextOptions {
            replay_children: Some(replay_children),
        });
        self
    }

    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.chained_invoke_options = Some(ChainedInvokeOptions {
            function_name: function_name.into(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_new() {
        let op = Operation::new("op-123", OperationType::Step);
        assert_eq!(op.operation_id, "op-123");
        assert_eq!(op.operation_type, OperationType::Step);
        assert_eq!(op.status, OperationStatus::Started);
        assert!(op.parent_id.is_none());
        assert!(op.step_details.is_none());
    }

    #[test]
    fn test_operation_status_is_terminal() {
        assert!(!OperationStatus::Started.is_terminal());
        assert!(!OperationStatus::Ready.is_terminal());
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(OperationStatus::Stopped.is_terminal());
        assert!(OperationStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_action_resulting_status() {
        assert_eq!(OperationAction::Start.resulting_status(), OperationStatus::Started);
        assert_eq!(OperationAction::Succeed.resulting_status(), OperationStatus::Succeeded);
        assert_eq!(OperationAction::Fail.resulting_status(), OperationStatus::Failed);
        assert_eq!(OperationAction::Retry.resulting_status(), OperationStatus::Pending);
        assert_eq!(OperationAction::Cancel.resulting_status(), OperationStatus::Cancelled);
    }

    #[test]
    fn test_result_reads_type_specific_details() {
        let mut op = Operation::new("s1", OperationType::Step);
        op.step_details = Some(StepDetails {
            result: Some("42".to_string()),
            ..Default::default()
        });
        assert_eq!(op.result(), Some("42"));

        let mut op = Operation::new("c1", OperationType::Callback);
        op.callback_details = Some(CallbackDetails {
            error: Some(ErrorObject::new("E", "m")),
            ..Default::default()
        });
        assert!(op.result().is_none());
        assert_eq!(op.error().map(|e| e.error_type.as_str()), Some("E"));
    }

    #[test]
    fn test_operation_update_retry() {
        let update = OperationUpdate::retry("s1", ErrorObject::new("E", "m"), 5);
        assert_eq!(update.action, OperationAction::Retry);
        assert_eq!(update.operation_type, OperationType::Step);
        assert_eq!(
            update.step_options.and_then(|o| o.next_attempt_delay_seconds),
            Some(5)
        );
    }

    #[test]
    fn test_operation_serialization() {
        let op = Operation::new("op-123", OperationType::Step)
            .with_parent_id("parent-456")
            .with_name("my-step");

        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"OperationId\":\"op-123\""));
        assert!(json.contains("\"OperationType\":\"STEP\""));
        assert!(json.contains("\"Status\":\"STARTED\""));
        assert!(json.contains("\"ParentId\":\"parent-456\""));
        assert!(!json.contains("WaitDetails"));
    }

    #[test]
    fn test_operation_update_deserialization() {
        let json = r#"{
            "OperationId": "w1",
            "Action": "START",
            "OperationType": "WAIT",
            "WaitOptions": { "WaitSeconds": 0.25 }
        }"#;

        let update: OperationUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.operation_type, OperationType::Wait);
        assert_eq!(update.wait_options.map(|w| w.wait_seconds), Some(0.25));
    }

    #[test]
    fn test_timed_out_wire_name() {
        let json = serde_json::to_string(&OperationStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
    }
}
