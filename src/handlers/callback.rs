//! Callback operation handler.
//!
//! Creating a callback checkpoints a CALLBACK START; the checkpoint service
//! assigns the callback ID returned in the new execution state. Awaiting the
//! result suspends until an external system completes the callback.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::CallbackConfig;
use crate::context::OperationIdentifier;
use crate::error::{DurableError, DurableResult};
use crate::handlers::{StepOutcome, SuspendReason};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;

/// Handle to a created callback.
pub struct Callback<T> {
    /// ID to hand to the external system that completes the callback
    pub callback_id: String,
    pub operation_id: String,
    state: Arc<ExecutionState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("callback_id", &self.callback_id)
            .field("operation_id", &self.operation_id)
            .finish()
    }
}

impl<T: DeserializeOwned> Callback<T> {
    /// Returns the callback result, or suspends while it is outstanding.
    pub async fn result(&self) -> DurableResult<T> {
        self.outcome().into_result()
    }

    fn outcome(&self) -> StepOutcome<T> {
        let Some(op) = self.state.get_operation(&self.operation_id) else {
            return StepOutcome::Fail(DurableError::callback(
                "callback operation missing from execution state",
                Some(self.callback_id.clone()),
            ));
        };
        match op.status {
            OperationStatus::Started => StepOutcome::Suspend(SuspendReason::CallbackPending {
                operation_id: self.operation_id.clone(),
            }),
            OperationStatus::Succeeded => {
                let raw = op.result().unwrap_or("null");
                match serde_json::from_str(raw) {
                    Ok(value) => StepOutcome::Continue(value),
                    Err(e) => StepOutcome::Fail(DurableError::serdes(format!(
                        "Failed to deserialize callback result: {}",
                        e
                    ))),
                }
            }
            status => {
                let message = op
                    .error()
                    .map(|e| format!("{}: {}", e.error_type, e.error_message))
                    .unwrap_or_else(|| format!("callback {}", status));
                StepOutcome::Fail(DurableError::callback(message, Some(self.callback_id.clone())))
            }
        }
    }
}

pub async fn create_callback_handler<T>(
    state: &Arc<ExecutionState>,
    op_id: &OperationIdentifier,
    config: &CallbackConfig,
) -> DurableResult<Callback<T>> {
    let existing = state.get_operation(&op_id.operation_id);
    match &existing {
        Some(op) if op.operation_type != OperationType::Callback => {
            return Err(DurableError::NonDeterministic {
                message: format!(
                    "Expected Callback operation but found {} at operation_id {}",
                    op.operation_type, op_id.operation_id
                ),
                operation_id: Some(op_id.operation_id.clone()),
            });
        }
        Some(_) => {}
        None => {
            let update = OperationUpdate::start(&op_id.operation_id, OperationType::Callback)
                .with_optional_parent_id(op_id.parent_id.clone())
                .with_optional_name(op_id.name.clone())
                .with_callback_options(config.timeout_seconds, config.heartbeat_timeout_seconds);
            state.checkpoint(vec![update]).await?;
        }
    }

    let callback_id = state
        .get_operation(&op_id.operation_id)
        .and_then(|op| op.callback_details)
        .and_then(|d| d.callback_id)
        .ok_or_else(|| {
            DurableError::callback(
                format!("no callback ID assigned to operation {}", op_id),
                None,
            )
        })?;
    tracing::debug!(operation_id = %op_id, %callback_id, "callback created");

    Ok(Callback {
        callback_id,
        operation_id: op_id.operation_id.clone(),
        state: Arc::clone(state),
        _marker: PhantomData,
    })
}
