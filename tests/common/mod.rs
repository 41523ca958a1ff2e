//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use durable_execution_sdk::{
    CallbackDetails, CheckpointResponse, DurableError, DurableExecutionInvocationInput,
    DurableServiceClient, ExecutionDetails, GetOperationsResponse, InitialExecutionState,
    NewExecutionState, Operation, OperationAction, OperationStatus, OperationType,
    OperationUpdate, StepDetails,
};

pub const TEST_EXECUTION_ARN: &str = "arn:test:durable-execution:1";
pub const TEST_CHECKPOINT_TOKEN: &str = "token-0";

/// Applies each update to a local operation table and echoes the touched
/// operations back, so handler code sees ids the way a real service assigns
/// them. Every batch is recorded.
#[derive(Default)]
pub struct EchoClient {
    operations: Mutex<HashMap<String, Operation>>,
    batches: Mutex<Vec<Vec<OperationUpdate>>>,
}

impl EchoClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<OperationUpdate>> {
        self.batches.lock().unwrap().clone()
    }

    /// Every update sent, flattened in order.
    pub fn updates(&self) -> Vec<OperationUpdate> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn operation(&self, id: &str) -> Option<Operation> {
        self.operations.lock().unwrap().get(id).cloned()
    }

    fn apply(&self, update: &OperationUpdate) -> Operation {
        let mut operations = self.operations.lock().unwrap();
        let op = operations
            .entry(update.operation_id.clone())
            .or_insert_with(|| {
                let mut op = Operation::new(&update.operation_id, update.operation_type);
                op.parent_id = update.parent_id.clone();
                op.name = update.name.clone();
                op
            });
        op.status = update.action.resulting_status();
        match (update.operation_type, update.action) {
            (OperationType::Callback, OperationAction::Start) => {
                op.callback_details = Some(CallbackDetails {
                    callback_id: Some(format!("cb-{}", update.operation_id)),
                    ..Default::default()
                });
            }
            (OperationType::Step, _) => {
                let details = op.step_details.get_or_insert_with(StepDetails::default);
                details.result = update.payload.clone();
                details.error = update.error.clone();
            }
            _ => {}
        }
        op.clone()
    }
}

#[async_trait]
impl DurableServiceClient for EchoClient {
    async fn checkpoint(
        &self,
        _durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError> {
        let touched = operations.iter().map(|u| self.apply(u)).collect();
        self.batches.lock().unwrap().push(operations);
        Ok(CheckpointResponse {
            checkpoint_token: format!("{}+", checkpoint_token),
            new_execution_state: Some(NewExecutionState {
                operations: touched,
                next_marker: None,
            }),
        })
    }

    async fn get_operations(
        &self,
        _durable_execution_arn: &str,
        _next_marker: &str,
    ) -> Result<GetOperationsResponse, DurableError> {
        Ok(GetOperationsResponse {
            operations: Vec::new(),
            next_marker: None,
        })
    }
}

pub fn execution_operation(input: &str) -> Operation {
    let mut op = Operation::new("exec-op", OperationType::Execution);
    op.execution_details = Some(ExecutionDetails {
        input_payload: Some(input.to_string()),
    });
    op
}

pub fn succeeded_step(id: &str, result: &str) -> Operation {
    let mut op = Operation::new(id, OperationType::Step).with_status(OperationStatus::Succeeded);
    op.step_details = Some(StepDetails {
        attempt: Some(0),
        result: Some(result.to_string()),
        ..Default::default()
    });
    op
}

/// Invocation input carrying the EXECUTION operation plus `operations`.
pub fn invocation_input(input: &str, operations: Vec<Operation>) -> DurableExecutionInvocationInput {
    let mut all = vec![execution_operation(input)];
    all.extend(operations);
    DurableExecutionInvocationInput {
        durable_execution_arn: TEST_EXECUTION_ARN.to_string(),
        checkpoint_token: TEST_CHECKPOINT_TOKEN.to_string(),
        initial_execution_state: InitialExecutionState::with_operations(all),
    }
}
