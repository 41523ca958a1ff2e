//! In-process checkpoint server.
//!
//! [`CheckpointApi`] is the surface an orchestrator drives. The same server
//! implements [`DurableServiceClient`] so handlers checkpoint straight into
//! it, and [`CallbackSender`] so tests can complete callbacks.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use durable_execution_sdk::{
    CheckpointResponse, DurableError, DurableServiceClient, ErrorObject, GetOperationsResponse,
    NewExecutionState, Operation, OperationUpdate,
};

use super::abort::AbortSignal;
use super::callback_manager::{decode_callback_id, CompleteCallbackStatus};
use super::checkpoint_manager::CheckpointManager;
use super::checkpoint_token::{encode_checkpoint_token, CheckpointTokenData};
use super::execution_manager::ExecutionManager;
use super::types::{
    CheckpointOperation, InvocationResult, InvocationTimestamps, PollCheckpointDataResponse,
    StartDurableExecutionRequest, UpdateCheckpointDataRequest,
};
use crate::error::TestError;

/// Operations an orchestrator performs against a checkpoint server.
#[async_trait]
pub trait CheckpointApi: Send + Sync {
    async fn start_durable_execution(
        &self,
        request: StartDurableExecutionRequest,
    ) -> Result<InvocationResult, TestError>;

    async fn start_invocation(&self, execution_id: &str) -> Result<InvocationResult, TestError>;

    async fn complete_invocation(
        &self,
        execution_id: &str,
        invocation_id: &str,
    ) -> Result<InvocationTimestamps, TestError>;

    /// Long poll for updates applied to `execution_id`.
    async fn poll_checkpoint_data(
        &self,
        execution_id: &str,
        signal: AbortSignal,
    ) -> Result<PollCheckpointDataResponse, TestError>;

    async fn update_checkpoint_data(
        &self,
        request: UpdateCheckpointDataRequest,
    ) -> Result<CheckpointOperation, TestError>;

    async fn checkpoint(
        &self,
        checkpoint_token: &str,
        updates: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, TestError>;

    async fn get_state(&self, execution_id: &str) -> Result<Vec<Operation>, TestError>;
}

/// Delivers external callback results.
#[async_trait]
pub trait CallbackSender: Send + Sync {
    async fn send_success(&self, callback_id: &str, result: Option<String>) -> Result<(), TestError>;

    async fn send_failure(
        &self,
        callback_id: &str,
        error: Option<ErrorObject>,
    ) -> Result<(), TestError>;

    async fn send_heartbeat(&self, callback_id: &str) -> Result<(), TestError>;
}

#[derive(Debug, Default)]
pub struct CheckpointServer {
    executions: Mutex<ExecutionManager>,
    checkpoint_delay: Option<Duration>,
}

impl CheckpointServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every checkpoint call, to simulate service latency.
    pub fn with_checkpoint_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_delay = Some(delay);
        self
    }

    pub fn execution(&self, execution_id: &str) -> Result<Arc<CheckpointManager>, TestError> {
        self.lock()?.get(execution_id)
    }

    /// Drops an execution and stops its callback timers.
    pub fn remove_execution(&self, execution_id: &str) -> Result<(), TestError> {
        self.lock()?
            .remove_execution(execution_id)
            .map(|_| ())
            .ok_or_else(|| TestError::ExecutionNotFound(execution_id.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ExecutionManager>, TestError> {
        self.executions
            .lock()
            .map_err(|_| TestError::checkpoint_server_error("execution registry lock poisoned"))
    }

    fn callback_owner(&self, callback_id: &str) -> Result<Arc<CheckpointManager>, TestError> {
        let data = decode_callback_id(callback_id)?;
        self.lock()?
            .get(&data.execution_id)
            .map_err(|_| TestError::CallbackNotFound(callback_id.to_string()))
    }

    fn complete_callback(
        &self,
        callback_id: &str,
        status: CompleteCallbackStatus,
        result: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<(), TestError> {
        self.callback_owner(callback_id)?
            .complete_callback(callback_id, status, result, error)
            .map(|_| ())
    }
}

#[async_trait]
impl CheckpointApi for CheckpointServer {
    async fn start_durable_execution(
        &self,
        request: StartDurableExecutionRequest,
    ) -> Result<InvocationResult, TestError> {
        self.lock()?.start_execution(request)
    }

    async fn start_invocation(&self, execution_id: &str) -> Result<InvocationResult, TestError> {
        self.lock()?.start_invocation(execution_id)
    }

    async fn complete_invocation(
        &self,
        execution_id: &str,
        invocation_id: &str,
    ) -> Result<InvocationTimestamps, TestError> {
        self.execution(execution_id)?.complete_invocation(invocation_id)
    }

    async fn poll_checkpoint_data(
        &self,
        execution_id: &str,
        signal: AbortSignal,
    ) -> Result<PollCheckpointDataResponse, TestError> {
        let manager = self.execution(execution_id)?;
        manager.get_pending_checkpoint_updates(&signal).await
    }

    async fn update_checkpoint_data(
        &self,
        request: UpdateCheckpointDataRequest,
    ) -> Result<CheckpointOperation, TestError> {
        self.execution(&request.execution_id)?
            .update_checkpoint_data(&request.operation_id, request.update)
    }

    async fn checkpoint(
        &self,
        checkpoint_token: &str,
        updates: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, TestError> {
        if let Some(delay) = self.checkpoint_delay {
            tokio::time::sleep(delay).await;
        }

        let (manager, token) = self.lock()?.get_by_token(checkpoint_token)?;
        let applied = manager.process_checkpoint(updates, &token.invocation_id)?;
        let next_token = encode_checkpoint_token(&CheckpointTokenData::issue(
            &token.execution_id,
            &token.invocation_id,
        ))?;

        Ok(CheckpointResponse {
            checkpoint_token: next_token,
            new_execution_state: Some(NewExecutionState {
                operations: applied.into_iter().map(|record| record.operation).collect(),
                next_marker: None,
            }),
        })
    }

    async fn get_state(&self, execution_id: &str) -> Result<Vec<Operation>, TestError> {
        self.execution(execution_id)?.get_state()
    }
}

#[async_trait]
impl CallbackSender for CheckpointServer {
    async fn send_success(&self, callback_id: &str, result: Option<String>) -> Result<(), TestError> {
        self.complete_callback(callback_id, CompleteCallbackStatus::Succeeded, result, None)
    }

    async fn send_failure(
        &self,
        callback_id: &str,
        error: Option<ErrorObject>,
    ) -> Result<(), TestError> {
        self.complete_callback(callback_id, CompleteCallbackStatus::Failed, None, error)
    }

    async fn send_heartbeat(&self, callback_id: &str) -> Result<(), TestError> {
        self.callback_owner(callback_id)?.heartbeat_callback(callback_id)
    }
}

fn to_durable_error(error: TestError) -> DurableError {
    match error {
        TestError::CheckpointServerError(message) => DurableError::checkpoint_retriable(message),
        other => DurableError::checkpoint_non_retriable(other.to_string()),
    }
}

#[async_trait]
impl DurableServiceClient for CheckpointServer {
    async fn checkpoint(
        &self,
        durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError> {
        tracing::trace!(
            durable_execution_arn = %durable_execution_arn,
            count = operations.len(),
            "Checkpoint"
        );
        CheckpointApi::checkpoint(self, checkpoint_token, operations)
            .await
            .map_err(to_durable_error)
    }

    async fn get_operations(
        &self,
        durable_execution_arn: &str,
        _next_marker: &str,
    ) -> Result<GetOperationsResponse, DurableError> {
        let operations = CheckpointApi::get_state(self, durable_execution_arn)
            .await
            .map_err(to_durable_error)?;
        Ok(GetOperationsResponse {
            operations,
            next_marker: None,
        })
    }
}
