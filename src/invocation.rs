//! Invocation input/output types and the handler wrapper.
//!
//! An orchestrator invokes a durable handler with a
//! [`DurableExecutionInvocationInput`] and reads back a
//! [`DurableExecutionInvocationOutput`] whose status says whether the
//! execution finished or must be re-invoked later.

use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::client::SharedDurableServiceClient;
use crate::context::DurableContext;
use crate::error::{DurableError, DurableResult, ErrorObject};
use crate::operation::{Operation, OperationType, OperationUpdate};
use crate::state::ExecutionState;

/// Input payload for one handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableExecutionInvocationInput {
    #[serde(rename = "DurableExecutionArn")]
    pub durable_execution_arn: String,

    /// Token used for checkpointing operations
    #[serde(rename = "CheckpointToken")]
    pub checkpoint_token: String,

    /// Previously checkpointed operations
    #[serde(rename = "InitialExecutionState")]
    pub initial_execution_state: InitialExecutionState,
}

/// Operations delivered with an invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialExecutionState {
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,

    #[serde(rename = "NextMarker", skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

impl InitialExecutionState {
    pub fn with_operations(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            next_marker: None,
        }
    }

    /// Returns true if more operations must be paged in.
    pub fn has_more(&self) -> bool {
        self.next_marker.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Output of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableExecutionInvocationOutput {
    #[serde(rename = "Status")]
    pub status: InvocationStatus,

    /// Serialized result, present on success unless it was checkpointed
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl DurableExecutionInvocationOutput {
    /// Largest result returned inline.
    pub const MAX_RESPONSE_SIZE: usize = 6 * 1024 * 1024;

    pub fn succeeded(result: Option<String>) -> Self {
        Self {
            status: InvocationStatus::Succeeded,
            result,
            error: None,
        }
    }

    pub fn failed(error: ErrorObject) -> Self {
        Self {
            status: InvocationStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    pub fn pending() -> Self {
        Self {
            status: InvocationStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, InvocationStatus::Pending)
    }

    /// Creates an output from a DurableError. Suspend maps to `PENDING`.
    pub fn from_error(error: &DurableError) -> Self {
        match error {
            DurableError::Suspend { .. } => Self::pending(),
            _ => Self::failed(ErrorObject::from(error)),
        }
    }
}

/// Status of a durable execution invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// Execution completed successfully
    Succeeded,
    /// Execution failed with an error
    Failed,
    /// Execution suspended and must be re-invoked
    Pending,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Pending => write!(f, "PENDING"),
        }
    }
}

/// Runs a typed handler for one invocation.
///
/// The handler input is read from the EXECUTION operation's input payload.
/// Results larger than [`DurableExecutionInvocationOutput::MAX_RESPONSE_SIZE`]
/// are checkpointed on the EXECUTION operation instead of returned inline.
pub async fn run_durable_handler<I, O, F, Fut>(
    input: DurableExecutionInvocationInput,
    client: SharedDurableServiceClient,
    handler: F,
) -> DurableExecutionInvocationOutput
where
    I: DeserializeOwned,
    O: Serialize,
    F: FnOnce(I, DurableContext) -> Fut,
    Fut: Future<Output = DurableResult<O>>,
{
    match run_inner(input, client, handler).await {
        Ok(output) => output,
        Err(error) => DurableExecutionInvocationOutput::from_error(&error),
    }
}

async fn run_inner<I, O, F, Fut>(
    input: DurableExecutionInvocationInput,
    client: SharedDurableServiceClient,
    handler: F,
) -> DurableResult<DurableExecutionInvocationOutput>
where
    I: DeserializeOwned,
    O: Serialize,
    F: FnOnce(I, DurableContext) -> Fut,
    Fut: Future<Output = DurableResult<O>>,
{
    let arn = input.durable_execution_arn;
    let mut operations = input.initial_execution_state.operations;
    let mut marker = input.initial_execution_state.next_marker;
    while let Some(next) = marker.filter(|m| !m.is_empty()) {
        let page = client.get_operations(&arn, &next).await?;
        operations.extend(page.operations);
        marker = page.next_marker;
    }

    let state = Arc::new(ExecutionState::new(
        arn,
        input.checkpoint_token,
        operations,
        client,
    ));
    let execution_op = state
        .execution_operation()
        .ok_or_else(|| DurableError::execution("no EXECUTION operation in invocation state"))?;
    let raw_input = execution_op
        .execution_details
        .as_ref()
        .and_then(|d| d.input_payload.as_deref())
        .unwrap_or("null");
    let handler_input: I = serde_json::from_str(raw_input)?;

    let result = handler(handler_input, DurableContext::new(Arc::clone(&state))).await;

    if let Some(error) = state.termination() {
        return Ok(DurableExecutionInvocationOutput::failed(error));
    }

    let value = match result {
        Ok(value) => value,
        Err(error) => return Ok(DurableExecutionInvocationOutput::from_error(&error)),
    };
    let json = serde_json::to_string(&value)?;
    if json.len() > DurableExecutionInvocationOutput::MAX_RESPONSE_SIZE {
        tracing::debug!(size = json.len(), "checkpointing oversized execution result");
        let update = OperationUpdate::succeed(
            &execution_op.operation_id,
            OperationType::Execution,
            Some(json),
        );
        state.checkpoint(vec![update]).await?;
        return Ok(DurableExecutionInvocationOutput::succeeded(None));
    }
    Ok(DurableExecutionInvocationOutput::succeeded(Some(json)))
}
