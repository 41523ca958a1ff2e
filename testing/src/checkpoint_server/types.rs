//! Request and response shapes of the checkpoint server.
//!
//! These are the logical shapes a transport layer would carry; the
//! in-process [`super::CheckpointServer`] passes them directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use durable_execution_sdk::{
    ErrorObject, Operation, OperationAction, OperationStatus, OperationUpdate,
};

/// Unique identifier for an execution.
pub type ExecutionId = String;

/// Unique identifier for an invocation within an execution.
pub type InvocationId = String;

/// Opaque checkpoint token handed to an invocation.
pub type CheckpointToken = String;

/// An operation paired with the update that produced its current state.
///
/// `update` is `None` for records that changed without a worker update,
/// such as the initial EXECUTION operation or a status set by the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOperation {
    pub operation: Operation,
    pub update: Option<OperationUpdate>,
}

impl CheckpointOperation {
    pub fn new(operation: Operation, update: Option<OperationUpdate>) -> Self {
        Self { operation, update }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation.operation_id
    }
}

/// Request to start a new durable execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDurableExecutionRequest {
    /// The input payload for the execution (JSON string)
    pub payload: Option<String>,
}

/// Everything an invocation needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub execution_id: ExecutionId,
    pub checkpoint_token: CheckpointToken,
    pub invocation_id: InvocationId,
    pub operations: Vec<Operation>,
}

/// Result of a long poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollCheckpointDataResponse {
    pub operations: Vec<CheckpointOperation>,
    /// Invocations that touched each delivered operation
    pub operation_invocation_id_map: HashMap<String, Vec<InvocationId>>,
}

/// Exactly one of an action or a status to apply to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointDataUpdate {
    Action(OperationAction),
    Status(OperationStatus),
}

/// Orchestrator-side mutation of a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckpointDataRequest {
    pub execution_id: ExecutionId,
    pub operation_id: String,
    #[serde(flatten)]
    pub update: CheckpointDataUpdate,
}

/// Timestamps for a completed invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationTimestamps {
    pub start_timestamp: chrono::DateTime<chrono::Utc>,
    pub end_timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCallbackSuccessRequest {
    pub callback_id: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCallbackFailureRequest {
    pub callback_id: String,
    pub error: Option<ErrorObject>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_is_tagged_by_field() {
        let request = UpdateCheckpointDataRequest {
            execution_id: "exec-1".to_string(),
            operation_id: "w1".to_string(),
            update: CheckpointDataUpdate::Action(OperationAction::Succeed),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "SUCCEED");
        assert!(json.get("status").is_none());

        let parsed: UpdateCheckpointDataRequest = serde_json::from_str(
            r#"{"executionId":"exec-1","operationId":"s1","status":"READY"}"#,
        )
        .unwrap();
        assert_eq!(parsed.update, CheckpointDataUpdate::Status(OperationStatus::Ready));
    }

    #[test]
    fn test_update_request_rejects_untagged_body() {
        let parsed: Result<UpdateCheckpointDataRequest, _> =
            serde_json::from_str(r#"{"executionId":"exec-1","operationId":"s1"}"#);
        assert!(parsed.is_err());
    }
}
