//! Wait operation handler.
//!
//! The first invocation that reaches a wait checkpoints START with the wait
//! duration and suspends. The orchestrator marks the wait SUCCEEDED once it
//! elapses and re-invokes; the replayed wait then continues.

use std::sync::Arc;
use std::time::Duration;

use crate::context::OperationIdentifier;
use crate::error::DurableError;
use crate::handlers::{StepOutcome, SuspendReason};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;

pub async fn wait_handler(
    duration: Duration,
    state: &Arc<ExecutionState>,
    op_id: &OperationIdentifier,
) -> StepOutcome<()> {
    if let Some(op) = state.get_operation(&op_id.operation_id) {
        if op.operation_type != OperationType::Wait {
            return StepOutcome::Fail(DurableError::NonDeterministic {
                message: format!(
                    "Expected Wait operation but found {} at operation_id {}",
                    op.operation_type, op_id.operation_id
                ),
                operation_id: Some(op_id.operation_id.clone()),
            });
        }
        return match op.status {
            OperationStatus::Succeeded => StepOutcome::Continue(()),
            OperationStatus::Started => StepOutcome::Suspend(SuspendReason::WaitScheduled {
                operation_id: op_id.operation_id.clone(),
                scheduled_end_timestamp: op
                    .wait_details
                    .as_ref()
                    .and_then(|d| d.scheduled_end_timestamp),
            }),
            status => StepOutcome::Fail(DurableError::execution(format!(
                "Wait {} was {}",
                op_id, status
            ))),
        };
    }

    let update = OperationUpdate::start(&op_id.operation_id, OperationType::Wait)
        .with_optional_parent_id(op_id.parent_id.clone())
        .with_optional_name(op_id.name.clone())
        .with_wait_seconds(duration.as_secs_f64());
    if let Err(e) = state.checkpoint(vec![update]).await {
        return StepOutcome::Fail(e);
    }

    let scheduled_end_timestamp = state
        .get_operation(&op_id.operation_id)
        .and_then(|op| op.wait_details)
        .and_then(|d| d.scheduled_end_timestamp);
    tracing::debug!(operation_id = %op_id, wait_ms = duration.as_millis() as u64, "wait started");
    StepOutcome::Suspend(SuspendReason::WaitScheduled {
        operation_id: op_id.operation_id.clone(),
        scheduled_end_timestamp,
    })
}
