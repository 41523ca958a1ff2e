//! Step operation handler for the durable execution SDK.
//!
//! A step runs a closure once per attempt and checkpoints the outcome.
//! Failures flow through the configured retry strategy: a retry is
//! checkpointed as RETRY and the invocation suspends until the
//! orchestrator re-invokes after the delay.

use std::sync::Arc;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};

use crate::config::{RetryDecision, StepConfig, StepSemantics};
use crate::context::OperationIdentifier;
use crate::error::{DurableError, ErrorObject};
use crate::handlers::{StepOutcome, SuspendReason};
use crate::operation::{OperationStatus, OperationType, OperationUpdate};
use crate::state::ExecutionState;

/// Context provided to step functions during execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The operation identifier for this step
    pub operation_id: String,
    /// The parent operation ID, if any
    pub parent_id: Option<String>,
    /// The name of the step, if provided
    pub name: Option<String>,
    pub durable_execution_arn: String,
    /// The current attempt, starting at 1
    pub attempt: u32,
}

/// Executes a step operation with checkpointing and optional retry.
///
/// # Arguments
///
/// * `func` - The function to execute
/// * `state` - The execution state for checkpointing
/// * `op_id` - The operation identifier
/// * `config` - Step configuration (retry strategy, semantics)
pub async fn step_handler<T, F>(
    func: F,
    state: &Arc<ExecutionState>,
    op_id: &OperationIdentifier,
    config: &StepConfig,
) -> StepOutcome<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(StepContext) -> Result<T, DurableError> + Send,
{
    let existing = state.get_operation(&op_id.operation_id);

    if let Some(op) = &existing {
        if op.operation_type != OperationType::Step {
            return StepOutcome::Fail(DurableError::NonDeterministic {
                message: format!(
                    "Expected Step operation but found {} at operation_id {}",
                    op.operation_type, op_id.operation_id
                ),
                operation_id: Some(op_id.operation_id.clone()),
            });
        }
        match op.status {
            OperationStatus::Succeeded => {
                tracing::debug!(operation_id = %op_id, "replaying succeeded step");
                return deserialize_result(op.result());
            }
            OperationStatus::Pending => {
                return StepOutcome::Suspend(SuspendReason::RetryScheduled {
                    operation_id: op_id.operation_id.clone(),
                    next_attempt_timestamp: op
                        .step_details
                        .as_ref()
                        .and_then(|d| d.next_attempt_timestamp),
                });
            }
            OperationStatus::Started | OperationStatus::Ready => {}
            status => {
                tracing::debug!(operation_id = %op_id, %status, "replaying failed step");
                return StepOutcome::Fail(match op.error() {
                    Some(error) => error.clone().into(),
                    None => DurableError::execution(format!("Step was {}", status)),
                });
            }
        }
    }

    let prior_attempts = existing
        .as_ref()
        .and_then(|op| op.step_details.as_ref())
        .and_then(|d| d.attempt)
        .unwrap_or(0);
    let step_ctx = StepContext {
        operation_id: op_id.operation_id.clone(),
        parent_id: op_id.parent_id.clone(),
        name: op_id.name.clone(),
        durable_execution_arn: state.durable_execution_arn().to_string(),
        attempt: prior_attempts + 1,
    };

    let interrupted = config.step_semantics == StepSemantics::AtMostOncePerRetry
        && existing
            .as_ref()
            .map(|op| op.status == OperationStatus::Started)
            .unwrap_or(false);

    let result = if interrupted {
        // At-most-once: a STARTED attempt may have run, so it counts as failed.
        Err(DurableError::execution(format!(
            "Step {} was interrupted before completing",
            op_id
        )))
    } else {
        if config.step_semantics == StepSemantics::AtMostOncePerRetry {
            let start = base_update(op_id, OperationUpdate::start(&op_id.operation_id, OperationType::Step));
            if let Err(e) = state.checkpoint(vec![start]).await {
                return StepOutcome::Fail(e);
            }
        }
        tracing::debug!(operation_id = %op_id, attempt = step_ctx.attempt, "executing step");
        func(step_ctx.clone())
    };

    match result {
        Ok(value) => {
            let payload = match serde_json::to_string(&value) {
                Ok(payload) => payload,
                Err(e) => {
                    return StepOutcome::Fail(DurableError::serdes(format!(
                        "Failed to serialize step result: {}",
                        e
                    )))
                }
            };
            let update = base_update(
                op_id,
                OperationUpdate::succeed(&op_id.operation_id, OperationType::Step, Some(payload)),
            );
            match state.checkpoint(vec![update]).await {
                Ok(()) => StepOutcome::Continue(value),
                Err(e) => StepOutcome::Fail(e),
            }
        }
        Err(error) => handle_failure(error, state, op_id, config, step_ctx.attempt).await,
    }
}

async fn handle_failure<T>(
    error: DurableError,
    state: &Arc<ExecutionState>,
    op_id: &OperationIdentifier,
    config: &StepConfig,
    attempt: u32,
) -> StepOutcome<T> {
    let error_obj = ErrorObject::from(&error);

    let decision = if error.is_unrecoverable() {
        RetryDecision::stop()
    } else {
        config
            .retry_strategy
            .as_ref()
            .map(|strategy| strategy.should_retry(&error, attempt))
            .unwrap_or_else(RetryDecision::stop)
    };

    if decision.should_retry {
        tracing::debug!(
            operation_id = %op_id,
            attempt,
            delay_seconds = decision.delay_seconds,
            "step failed, scheduling retry"
        );
        let update = base_update(
            op_id,
            OperationUpdate::retry(&op_id.operation_id, error_obj, decision.delay_seconds),
        );
        if let Err(e) = state.checkpoint(vec![update]).await {
            return StepOutcome::Fail(e);
        }
        let delay_ms = (decision.delay_seconds as i64).saturating_mul(1000);
        return StepOutcome::Suspend(SuspendReason::RetryScheduled {
            operation_id: op_id.operation_id.clone(),
            next_attempt_timestamp: Some(Utc::now().timestamp_millis() + delay_ms),
        });
    }

    tracing::warn!(operation_id = %op_id, attempt, error = %error, "step failed");
    let update = base_update(
        op_id,
        OperationUpdate::fail(&op_id.operation_id, OperationType::Step, error_obj.clone()),
    );
    if let Err(e) = state.checkpoint(vec![update]).await {
        return StepOutcome::Fail(e);
    }
    if error.is_unrecoverable() {
        state.terminate(error_obj);
    }
    StepOutcome::Fail(error)
}

fn base_update(op_id: &OperationIdentifier, update: OperationUpdate) -> OperationUpdate {
    update
        .with_optional_parent_id(op_id.parent_id.clone())
        .with_optional_name(op_id.name.clone())
}

fn deserialize_result<T: DeserializeOwned>(result: Option<&str>) -> StepOutcome<T> {
    let raw = result.unwrap_or("null");
    match serde_json::from_str(raw) {
        Ok(value) => StepOutcome::Continue(value),
        Err(e) => StepOutcome::Fail(DurableError::serdes(format!(
            "Failed to deserialize checkpointed result: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockDurableServiceClient;
    use crate::config::RetryFn;
    use crate::operation::{Operation, OperationAction, StepDetails};

    fn op_id(id: &str) -> OperationIdentifier {
        OperationIdentifier {
            operation_id: id.to_string(),
            parent_id: None,
            name: Some("charge".to_string()),
        }
    }

    fn state_with(
        ops: Vec<Operation>,
    ) -> (Arc<ExecutionState>, Arc<MockDurableServiceClient>) {
        let client = Arc::new(MockDurableServiceClient::new());
        let state = Arc::new(ExecutionState::new("arn", "t0", ops, client.clone()));
        (state, client)
    }

    #[tokio::test]
    async fn test_first_run_checkpoints_succeed() {
        let (state, client) = state_with(vec![]);
        let outcome = step_handler(|_| Ok(42u32), &state, &op_id("s1"), &StepConfig::default()).await;

        assert_eq!(outcome.into_result().unwrap(), 42);
        let calls = client.checkpoint_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].action, OperationAction::Succeed);
        assert_eq!(calls[0][0].payload.as_deref(), Some("42"));
        assert_eq!(calls[0][0].name.as_deref(), Some("charge"));
    }

    #[tokio::test]
    async fn test_replay_returns_recorded_result_without_running() {
        let mut op = Operation::new("s1", OperationType::Step).with_status(OperationStatus::Succeeded);
        op.step_details = Some(StepDetails {
            result: Some("\"cached\"".to_string()),
            ..Default::default()
        });
        let (state, client) = state_with(vec![op]);

        let outcome: StepOutcome<String> = step_handler(
            |_| panic!("step must not run on replay"),
            &state,
            &op_id("s1"),
            &StepConfig::default(),
        )
        .await;

        assert_eq!(outcome.into_result().unwrap(), "cached");
        assert!(client.checkpoint_calls().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_suspends_with_retry() {
        let (state, client) = state_with(vec![]);
        let config = StepConfig::default()
            .with_retry_strategy(RetryFn::new(|_, _| RetryDecision::retry_after(5)));

        let outcome: StepOutcome<u32> = step_handler(
            |_| Err(DurableError::user_code("flaky")),
            &state,
            &op_id("s1"),
            &config,
        )
        .await;

        assert!(outcome.is_suspend());
        let update = &client.checkpoint_calls()[0][0];
        assert_eq!(update.action, OperationAction::Retry);
        assert_eq!(
            update.step_options.as_ref().and_then(|o| o.next_attempt_delay_seconds),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_ready_step_runs_next_attempt() {
        let mut op = Operation::new("s1", OperationType::Step).with_status(OperationStatus::Ready);
        op.step_details = Some(StepDetails {
            attempt: Some(1),
            ..Default::default()
        });
        let (state, _client) = state_with(vec![op]);

        let outcome = step_handler(
            |ctx| Ok(ctx.attempt),
            &state,
            &op_id("s1"),
            &StepConfig::default(),
        )
        .await;

        assert_eq!(outcome.into_result().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_step_suspends() {
        let op = Operation::new("s1", OperationType::Step).with_status(OperationStatus::Pending);
        let (state, client) = state_with(vec![op]);

        let outcome: StepOutcome<u32> =
            step_handler(|_| Ok(1), &state, &op_id("s1"), &StepConfig::default()).await;

        assert!(outcome.is_suspend());
        assert!(client.checkpoint_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecoverable_error_bypasses_retry() {
        let (state, client) = state_with(vec![]);
        let config = StepConfig::default()
            .with_retry_strategy(RetryFn::new(|_, _| RetryDecision::retry_after(1)));

        let outcome: StepOutcome<u32> = step_handler(
            |_| Err(DurableError::unrecoverable("poison")),
            &state,
            &op_id("s1"),
            &config,
        )
        .await;

        assert!(matches!(outcome, StepOutcome::Fail(DurableError::Unrecoverable { .. })));
        assert_eq!(client.checkpoint_calls()[0][0].action, OperationAction::Fail);
        assert!(state.termination().is_some());
    }

    #[tokio::test]
    async fn test_at_most_once_checkpoints_start_first() {
        let (state, client) = state_with(vec![]);
        let config = StepConfig::default().with_semantics(StepSemantics::AtMostOncePerRetry);

        step_handler(|_| Ok(()), &state, &op_id("s1"), &config)
            .await
            .into_result()
            .unwrap();

        let actions: Vec<_> = client
            .checkpoint_calls()
            .iter()
            .map(|batch| batch[0].action)
            .collect();
        assert_eq!(actions, vec![OperationAction::Start, OperationAction::Succeed]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_non_deterministic() {
        let op = Operation::new("s1", OperationType::Wait);
        let (state, _client) = state_with(vec![op]);

        let outcome: StepOutcome<u32> =
            step_handler(|_| Ok(1), &state, &op_id("s1"), &StepConfig::default()).await;

        assert!(matches!(
            outcome,
            StepOutcome::Fail(DurableError::NonDeterministic { .. })
        ));
    }
}
