//! Per-invocation execution state.
//!
//! `ExecutionState` holds the operations replayed into the current
//! invocation, the rolling checkpoint token, and the client used to submit
//! updates. Every handler primitive goes through it.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::client::SharedDurableServiceClient;
use crate::error::{DurableError, DurableResult, ErrorObject};
use crate::operation::{Operation, OperationType, OperationUpdate};

/// Checkpointed state visible to one handler invocation.
pub struct ExecutionState {
    durable_execution_arn: String,
    checkpoint_token: tokio::sync::Mutex<String>,
    operations: RwLock<HashMap<String, Operation>>,
    client: SharedDurableServiceClient,
    termination: Mutex<Option<ErrorObject>>,
}

impl ExecutionState {
    /// Creates the state from the operations delivered with the invocation.
    pub fn new(
        durable_execution_arn: impl Into<String>,
        checkpoint_token: impl Into<String>,
        operations: Vec<Operation>,
        client: SharedDurableServiceClient,
    ) -> Self {
        let operations = operations
            .into_iter()
            .map(|op| (op.operation_id.clone(), op))
            .collect();
        Self {
            durable_execution_arn: durable_execution_arn.into(),
            checkpoint_token: tokio::sync::Mutex::new(checkpoint_token.into()),
            operations: RwLock::new(operations),
            client,
            termination: Mutex::new(None),
        }
    }

    pub fn durable_execution_arn(&self) -> &str {
        &self.durable_execution_arn
    }

    /// Returns a snapshot of the operation with the given ID.
    pub fn get_operation(&self, operation_id: &str) -> Option<Operation> {
        self.operations
            .read()
            .ok()
            .and_then(|ops| ops.get(operation_id).cloned())
    }

    /// Returns the root EXECUTION operation.
    pub fn execution_operation(&self) -> Option<Operation> {
        self.operations.read().ok().and_then(|ops| {
            ops.values()
                .find(|op| op.operation_type == OperationType::Execution)
                .cloned()
        })
    }

    /// Submits a batch of updates and merges the returned operations.
    ///
    /// Batches are serialized through the checkpoint token lock so each
    /// request carries the token returned by the previous one.
    pub async fn checkpoint(&self, updates: Vec<OperationUpdate>) -> DurableResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut token = self.checkpoint_token.lock().await;
        let count = updates.len();
        let response = self
            .client
            .checkpoint(&self.durable_execution_arn, &token, updates)
            .await?;
        *token = response.checkpoint_token;

        if let Some(new_state) = response.new_execution_state {
            let mut ops = self
                .operations
                .write()
                .map_err(|_| DurableError::execution("operation map lock poisoned"))?;
            for op in new_state.operations {
                ops.insert(op.operation_id.clone(), op);
            }
        }
        tracing::debug!(
            durable_execution_arn = %self.durable_execution_arn,
            updates = count,
            "checkpoint applied"
        );
        Ok(())
    }

    /// Records an unrecoverable error that terminates the execution.
    pub fn terminate(&self, error: ErrorObject) {
        if let Ok(mut slot) = self.termination.lock() {
            slot.get_or_insert(error);
        }
    }

    /// Returns the error the execution was terminated with, if any.
    pub fn termination(&self) -> Option<ErrorObject> {
        self.termination.lock().ok().and_then(|slot| slot.clone())
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("durable_execution_arn", &self.durable_execution_arn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{CheckpointResponse, MockDurableServiceClient, NewExecutionState};
    use crate::operation::OperationStatus;

    #[tokio::test]
    async fn test_checkpoint_merges_returned_operations() {
        let returned = Operation::new("s1", OperationType::Step).with_status(OperationStatus::Succeeded);
        let client = Arc::new(MockDurableServiceClient::new().with_checkpoint_response(Ok(
            CheckpointResponse {
                checkpoint_token: "t1".to_string(),
                new_execution_state: Some(NewExecutionState {
                    operations: vec![returned.clone()],
                    next_marker: None,
                }),
            },
        )));
        let state = ExecutionState::new("arn", "t0", vec![], client.clone());

        state
            .checkpoint(vec![OperationUpdate::succeed("s1", OperationType::Step, None)])
            .await
            .unwrap();

        assert_eq!(state.get_operation("s1"), Some(returned));
        assert_eq!(client.checkpoint_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let client = Arc::new(MockDurableServiceClient::new());
        let state = ExecutionState::new("arn", "t0", vec![], client.clone());
        state.checkpoint(vec![]).await.unwrap();
        assert!(client.checkpoint_calls().is_empty());
    }

    #[test]
    fn test_first_termination_wins() {
        let state = ExecutionState::new("arn", "t0", vec![], Arc::new(MockDurableServiceClient::new()));
        state.terminate(ErrorObject::new("A", "first"));
        state.terminate(ErrorObject::new("B", "second"));
        assert_eq!(state.termination().map(|e| e.error_type), Some("A".to_string()));
    }
}
