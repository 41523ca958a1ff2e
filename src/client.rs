//! Service client for the durable execution SDK.
//!
//! This module defines the `DurableServiceClient` trait, the seam between
//! handler-side primitives and whatever checkpoint service persists
//! operation updates. The local testing crate implements it in-process.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DurableError;
use crate::operation::{Operation, OperationUpdate};

/// Trait for communicating with the durable execution service.
#[async_trait]
pub trait DurableServiceClient: Send + Sync {
    /// Sends a batch of checkpoint operations to the service.
    ///
    /// # Arguments
    ///
    /// * `durable_execution_arn` - The identifier of the durable execution
    /// * `checkpoint_token` - The token for this checkpoint batch
    /// * `operations` - The operation updates to apply, in order
    ///
    /// # Returns
    ///
    /// A new checkpoint token and the operations the batch touched, or an
    /// error if the batch was rejected as a whole.
    async fn checkpoint(
        &self,
        durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError>;

    /// Retrieves additional operations for pagination.
    async fn get_operations(
        &self,
        durable_execution_arn: &str,
        next_marker: &str,
    ) -> Result<GetOperationsResponse, DurableError>;
}

/// Response from a checkpoint operation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointResponse {
    /// The new checkpoint token to use for subsequent checkpoints
    #[serde(rename = "CheckpointToken", default)]
    pub checkpoint_token: String,

    /// Updated operations, including service-generated values such as
    /// `CallbackDetails.CallbackId`
    #[serde(rename = "NewExecutionState", skip_serializing_if = "Option::is_none", default)]
    pub new_execution_state: Option<NewExecutionState>,
}

impl CheckpointResponse {
    /// Creates a new CheckpointResponse with just a checkpoint token.
    pub fn new(checkpoint_token: impl Into<String>) -> Self {
        Self {
            checkpoint_token: checkpoint_token.into(),
            new_execution_state: None,
        }
    }
}

/// New execution state returned from checkpoint operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewExecutionState {
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,

    /// Marker for the next page of results, if any
    #[serde(rename = "NextMarker", skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

impl NewExecutionState {
    /// Finds an operation by its ID.
    pub fn find_operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.operation_id == operation_id)
    }
}

/// Response from a get_operations call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOperationsResponse {
    #[serde(rename = "Operations")]
    pub operations: Vec<Operation>,

    #[serde(rename = "NextMarker", skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// Type alias for a shared DurableServiceClient.
pub type SharedDurableServiceClient = Arc<dyn DurableServiceClient>;

/// A recording mock of DurableServiceClient for unit tests.
#[cfg(test)]
#[derive(Default)]
pub struct MockDurableServiceClient {
    checkpoint_responses: std::sync::Mutex<Vec<Result<CheckpointResponse, DurableError>>>,
    checkpoint_calls: std::sync::Mutex<Vec<Vec<OperationUpdate>>>,
}

#[cfg(test)]
impl MockDurableServiceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_response(
        self,
        response: Result<CheckpointResponse, DurableError>,
    ) -> Self {
        self.checkpoint_responses.lock().unwrap().push(response);
        self
    }

    /// Returns every batch sent so far.
    pub fn checkpoint_calls(&self) -> Vec<Vec<OperationUpdate>> {
        self.checkpoint_calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl DurableServiceClient for MockDurableServiceClient {
    async fn checkpoint(
        &self,
        _durable_execution_arn: &str,
        _checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, DurableError> {
        self.checkpoint_calls.lock().unwrap().push(operations);
        let mut responses = self.checkpoint_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(CheckpointResponse::new("mock-token"))
        } else {
            responses.remove(0)
        }
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
