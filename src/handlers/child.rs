//! Child context handler.
//!
//! A child context groups the operations issued inside it under one
//! CONTEXT operation. Once the context completes its result is replayed
//! directly; when `replay_children` is off the checkpoint service stops
//! returning the children at all.

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};

use crate::config::ChildContextConfig;
use crate::context::{DurableContext, OperationIdentifier};
use crate::error::{DurableError, DurableResult, ErrorObject};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};

pub async fn child_context_handler<T, F, Fut>(
    parent: &DurableContext,
    func: F,
    op_id: &OperationIdentifier,
    config: &ChildContextConfig,
) -> DurableResult<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(DurableContext) -> Fut + Send,
    Fut: Future<Output = DurableResult<T>> + Send,
{
    let state = parent.state();

    match state.get_operation(&op_id.operation_id) {
        Some(op) if op.operation_type != OperationType::Context => {
            return Err(DurableError::NonDeterministic {
                message: format!(
                    "Expected Context operation but found {} at operation_id {}",
                    op.operation_type, op_id.operation_id
                ),
                operation_id: Some(op_id.operation_id.clone()),
            });
        }
        Some(op) if op.status == OperationStatus::Succeeded => {
            tracing::debug!(operation_id = %op_id, "replaying completed child context");
            return Ok(serde_json::from_str(op.result().unwrap_or("null"))?);
        }
        Some(op) if op.status.is_terminal() => {
            return Err(match op.error() {
                Some(error) => error.clone().into(),
                None => DurableError::execution(format!("Child context was {}", op.status)),
            });
        }
        Some(_) => {}
        None => {
            let start = OperationUpdate::start(&op_id.operation_id, OperationType::Context)
                .with_optional_parent_id(op_id.parent_id.clone())
                .with_optional_name(op_id.name.clone())
                .with_replay_children(config.replay_children);
            state.checkpoint(vec![start]).await?;
        }
    }

    let child = parent.child(op_id.operation_id.clone());
    match func(child).await {
        Ok(value) => {
            let payload = serde_json::to_string(&value)?;
            let update = OperationUpdate::succeed(&op_id.operation_id, OperationType::Context, Some(payload))
                .with_optional_parent_id(op_id.parent_id.clone())
                .with_replay_children(config.replay_children);
            state.checkpoint(vec![update]).await?;
            Ok(value)
        }
        Err(error) if error.is_suspend() => Err(error),
        Err(error) => {
            let update = OperationUpdate::fail(
                &op_id.operation_id,
                OperationType::Context,
                ErrorObject::from(&error),
            )
            .with_optional_parent_id(op_id.parent_id.clone());
            state.checkpoint(vec![update]).await?;
            Err(error)
        }
    }
}
