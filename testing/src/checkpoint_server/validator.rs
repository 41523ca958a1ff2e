//! Stateless checks run on every checkpoint batch before it is applied.
//!
//! Each check returns `TestError::InvalidParameterValue` with the message
//! surfaced to the submitting worker. [`validate_batch`] checks a whole
//! batch against a projection of the registry, so an invalid update
//! anywhere rejects the batch before anything is mutated.

use std::collections::{HashMap, HashSet};

use durable_execution_sdk::{
    Operation, OperationAction, OperationStatus, OperationType, OperationUpdate,
};

use crate::error::TestError;
use crate::indexed_operations::IndexedOperations;

/// Maximum serialized size of an update's error object.
pub const MAX_ERROR_PAYLOAD_BYTES: usize = 32_768;

/// Longest wait or retry delay a worker may schedule, one year.
pub const MAX_SCHEDULE_SECONDS: u64 = 31_622_400;

pub const DUPLICATE_ACTION_MESSAGE: &str =
    "Cannot update the same operation with the same action twice in a single request.";

/// Returns the actions an operation type admits.
pub fn allowed_actions(operation_type: OperationType) -> &'static [OperationAction] {
    use OperationAction::*;
    match operation_type {
        OperationType::Step => &[Start, Fail, Retry, Succeed],
        OperationType::Execution => &[Succeed, Fail],
        OperationType::Wait | OperationType::Callback | OperationType::Invoke => &[Start, Cancel],
        OperationType::Context => &[Start, Fail, Succeed],
    }
}

pub fn valid_action_for_type(
    operation_type: OperationType,
    action: OperationAction,
) -> Result<(), TestError> {
    if allowed_actions(operation_type).contains(&action) {
        Ok(())
    } else {
        Err(TestError::invalid_parameter(format!(
            "Invalid action {} for operation type {}.",
            action, operation_type
        )))
    }
}

/// A worker re-checkpointing START for a wait it already started.
pub fn is_wait_redelivery(update: &OperationUpdate, current: Option<&Operation>) -> bool {
    match current {
        Some(op) => {
            op.operation_type == OperationType::Wait
                && update.action == OperationAction::Start
                && op.status == OperationStatus::Started
                && op
                    .wait_details
                    .as_ref()
                    .and_then(|d| d.scheduled_end_timestamp)
                    .is_some()
        }
        None => false,
    }
}

/// Checks the status guard for applying `update` to `current`.
///
/// An absent `current` is the creation case and always passes.
pub fn valid_transition(
    update: &OperationUpdate,
    current: Option<&Operation>,
) -> Result<(), TestError> {
    let Some(current) = current else {
        return Ok(());
    };
    if current.operation_type != update.operation_type {
        return Err(TestError::invalid_parameter(format!(
            "Operation {} is a {}, not a {}.",
            current.operation_id, current.operation_type, update.operation_type
        )));
    }

    let status = current.status;
    let action = update.action;
    let legal = match update.operation_type {
        OperationType::Step => match action {
            OperationAction::Start => status == OperationStatus::Ready,
            OperationAction::Succeed | OperationAction::Fail | OperationAction::Retry => {
                matches!(status, OperationStatus::Started | OperationStatus::Ready)
            }
            OperationAction::Cancel => false,
        },
        OperationType::Execution => !status.is_terminal(),
        OperationType::Wait => match action {
            OperationAction::Start => is_wait_redelivery(update, Some(current)),
            OperationAction::Cancel => status == OperationStatus::Started,
            _ => false,
        },
        OperationType::Callback | OperationType::Invoke => {
            action == OperationAction::Cancel && status == OperationStatus::Started
        }
        OperationType::Context => match action {
            OperationAction::Succeed | OperationAction::Fail => status == OperationStatus::Started,
            _ => false,
        },
    };

    if legal {
        Ok(())
    } else {
        Err(TestError::invalid_parameter(format!(
            "Invalid current {} state to {}: operation {} is {}.",
            update.operation_type, action, current.operation_id, status
        )))
    }
}

/// SUCCEED on EXECUTION carries no error, FAIL carries no payload.
pub fn valid_execution_payload(update: &OperationUpdate) -> Result<(), TestError> {
    if update.operation_type != OperationType::Execution {
        return Ok(());
    }
    match update.action {
        OperationAction::Succeed if update.error.is_some() => Err(TestError::invalid_parameter(
            "Cannot provide an Error for a SUCCEED action on an EXECUTION operation.",
        )),
        OperationAction::Fail if update.payload.is_some() => Err(TestError::invalid_parameter(
            "Cannot provide a Payload for a FAIL action on an EXECUTION operation.",
        )),
        _ => Ok(()),
    }
}

/// A parent must be a CONTEXT created earlier in the batch or already stored.
pub fn valid_parent(
    update: &OperationUpdate,
    batch_types: &HashMap<&str, OperationType>,
    registry: &IndexedOperations,
) -> Result<(), TestError> {
    let Some(parent_id) = update.parent_id.as_deref() else {
        return Ok(());
    };
    let parent_type = batch_types
        .get(parent_id)
        .copied()
        .or_else(|| registry.get_operation(parent_id).map(|op| op.operation_type));
    match parent_type {
        Some(OperationType::Context) => Ok(()),
        _ => Err(TestError::invalid_parameter(format!(
            "Invalid parent operation id {} for operation {}.",
            parent_id, update.operation_id
        ))),
    }
}

pub fn payload_size_limit(update: &OperationUpdate) -> Result<(), TestError> {
    match &update.error {
        Some(error) if error.serialized_len() > MAX_ERROR_PAYLOAD_BYTES => {
            Err(TestError::invalid_parameter(format!(
                "Error object for operation {} exceeds the maximum size of {} bytes.",
                update.operation_id, MAX_ERROR_PAYLOAD_BYTES
            )))
        }
        _ => Ok(()),
    }
}

/// Wait lengths must be finite and non-negative, and neither a wait nor a
/// retry delay may exceed [`MAX_SCHEDULE_SECONDS`].
pub fn valid_schedule(update: &OperationUpdate) -> Result<(), TestError> {
    if let Some(wait) = &update.wait_options {
        let seconds = wait.wait_seconds;
        if !seconds.is_finite() || seconds < 0.0 || seconds > MAX_SCHEDULE_SECONDS as f64 {
            return Err(TestError::invalid_parameter(format!(
                "Invalid WaitSeconds {} for operation {}.",
                seconds, update.operation_id
            )));
        }
    }
    match update
        .step_options
        .as_ref()
        .and_then(|o| o.next_attempt_delay_seconds)
    {
        Some(delay) if delay > MAX_SCHEDULE_SECONDS => Err(TestError::invalid_parameter(format!(
            "Invalid NextAttemptDelaySeconds {} for operation {}.",
            delay, update.operation_id
        ))),
        _ => Ok(()),
    }
}

/// An existing operation keeps the parent it was created with.
pub fn valid_parent_unchanged(
    update: &OperationUpdate,
    current: Option<&Operation>,
) -> Result<(), TestError> {
    match (current, update.parent_id.as_deref()) {
        (Some(current), Some(parent_id)) if current.parent_id.as_deref() != Some(parent_id) => {
            Err(TestError::invalid_parameter(format!(
                "Cannot change the parent of operation {} to {}.",
                update.operation_id, parent_id
            )))
        }
        _ => Ok(()),
    }
}

/// Validates a whole checkpoint batch without mutating anything.
///
/// Updates later in the batch are checked against the statuses earlier
/// updates would produce, so START then SUCCEED of a new step in one
/// batch is accepted. EXECUTION updates may only target
/// `execution_operation_id`, the operation the execution was initialized with.
pub fn validate_batch(
    updates: &[OperationUpdate],
    registry: &IndexedOperations,
    execution_operation_id: Option<&str>,
) -> Result<(), TestError> {
    let mut seen_actions: HashSet<(&str, OperationAction)> = HashSet::new();
    let mut batch_types: HashMap<&str, OperationType> = HashMap::new();
    let mut projected: HashMap<&str, Operation> = HashMap::new();
    let mut execution_updates = 0usize;

    for (position, update) in updates.iter().enumerate() {
        let id = update.operation_id.as_str();

        if !seen_actions.insert((id, update.action)) {
            return Err(TestError::invalid_parameter(DUPLICATE_ACTION_MESSAGE));
        }

        valid_action_for_type(update.operation_type, update.action)?;

        if update.operation_type == OperationType::Execution {
            if execution_operation_id != Some(id) {
                return Err(TestError::invalid_parameter(format!(
                    "Operation {} is not the EXECUTION operation of this execution.",
                    id
                )));
            }
            execution_updates += 1;
            if execution_updates > 1 {
                return Err(TestError::invalid_parameter(
                    "Cannot checkpoint more than one EXECUTION update in a single request.",
                ));
            }
            if position + 1 != updates.len() {
                return Err(TestError::invalid_parameter(
                    "EXECUTION update must be the last update in a request.",
                ));
            }
        }

        valid_execution_payload(update)?;
        payload_size_limit(update)?;
        valid_schedule(update)?;
        valid_parent(update, &batch_types, registry)?;

        let current = projected
            .get(id)
            .cloned()
            .or_else(|| registry.get_operation(id).cloned());
        valid_parent_unchanged(update, current.as_ref())?;
        valid_transition(update, current.as_ref())?;

        if !is_wait_redelivery(update, current.as_ref()) {
            let mut next = current.unwrap_or_else(|| {
                let mut created = Operation::new(id, update.operation_type);
                created.parent_id = update.parent_id.clone();
                created
            });
            next.status = update.action.resulting_status();
            projected.insert(id, next);
        }
        batch_types.insert(id, update.operation_type);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_server::CheckpointOperation;
    use durable_execution_sdk::{ErrorObject, WaitDetails};

    fn registry(ops: Vec<Operation>) -> IndexedOperations {
        IndexedOperations::from_entries(ops.into_iter().map(|op| CheckpointOperation::new(op, None)))
            .unwrap()
    }

    fn check(updates: &[OperationUpdate], registry: &IndexedOperations) -> Result<(), TestError> {
        validate_batch(updates, registry, Some("exec"))
    }

    fn message(err: TestError) -> String {
        match err {
            TestError::InvalidParameterValue(m) => m,
            other => panic!("expected InvalidParameterValue, got {other:?}"),
        }
    }

    #[test]
    fn test_action_table() {
        assert!(valid_action_for_type(OperationType::Step, OperationAction::Retry).is_ok());
        assert!(valid_action_for_type(OperationType::Execution, OperationAction::Start).is_err());
        assert!(valid_action_for_type(OperationType::Wait, OperationAction::Succeed).is_err());
        assert!(valid_action_for_type(OperationType::Callback, OperationAction::Cancel).is_ok());
        assert!(valid_action_for_type(OperationType::Context, OperationAction::Retry).is_err());
        assert!(valid_action_for_type(OperationType::Invoke, OperationAction::Start).is_ok());
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let updates = vec![
            OperationUpdate::succeed("op1", OperationType::Step, Some("1".into())),
            OperationUpdate::succeed("op1", OperationType::Step, Some("2".into())),
        ];
        let err = check(&updates, &IndexedOperations::new()).unwrap_err();
        assert_eq!(message(err), DUPLICATE_ACTION_MESSAGE);
    }

    #[test]
    fn test_start_then_succeed_in_one_batch() {
        let updates = vec![
            OperationUpdate::start("s1", OperationType::Step),
            OperationUpdate::succeed("s1", OperationType::Step, Some("42".into())),
        ];
        assert!(check(&updates, &IndexedOperations::new()).is_ok());
    }

    #[test]
    fn test_step_start_requires_ready() {
        let reg = registry(vec![Operation::new("s1", OperationType::Step)]);
        let updates = vec![OperationUpdate::start("s1", OperationType::Step)];
        assert!(check(&updates, &reg).is_err());

        let reg = registry(vec![
            Operation::new("s1", OperationType::Step).with_status(OperationStatus::Ready)
        ]);
        assert!(check(&updates, &reg).is_ok());
    }

    #[test]
    fn test_step_cannot_complete_twice() {
        let reg = registry(vec![
            Operation::new("s1", OperationType::Step).with_status(OperationStatus::Succeeded)
        ]);
        let updates = vec![OperationUpdate::succeed("s1", OperationType::Step, None)];
        assert!(check(&updates, &reg).is_err());
    }

    #[test]
    fn test_execution_payload_rules() {
        let reg = registry(vec![Operation::new("exec", OperationType::Execution)]);

        let update = OperationUpdate::succeed("exec", OperationType::Execution, Some("1".into()))
            .with_error(ErrorObject::new("E", "m"));
        assert!(check(&[update], &reg).is_err());

        let update = OperationUpdate::fail("exec", OperationType::Execution, ErrorObject::new("E", "m"))
            .with_payload("1");
        assert!(check(&[update], &reg).is_err());

        let update = OperationUpdate::succeed("exec", OperationType::Execution, Some("1".into()));
        assert!(check(&[update], &reg).is_ok());
    }

    #[test]
    fn test_execution_update_must_be_last() {
        let reg = registry(vec![Operation::new("exec", OperationType::Execution)]);
        let updates = vec![
            OperationUpdate::succeed("exec", OperationType::Execution, None),
            OperationUpdate::start("s1", OperationType::Step),
        ];
        assert!(check(&updates, &reg).is_err());
    }

    #[test]
    fn test_execution_is_single_shot() {
        let reg = registry(vec![
            Operation::new("exec", OperationType::Execution).with_status(OperationStatus::Succeeded)
        ]);
        let updates = vec![OperationUpdate::fail(
            "exec",
            OperationType::Execution,
            ErrorObject::new("E", "m"),
        )];
        assert!(check(&updates, &reg).is_err());
    }

    #[test]
    fn test_execution_update_must_target_the_execution() {
        let reg = registry(vec![Operation::new("exec", OperationType::Execution)]);
        let bogus = OperationUpdate::succeed("bogus", OperationType::Execution, Some("1".into()));
        let err = validate_batch(&[bogus.clone()], &reg, Some("exec")).unwrap_err();
        assert!(message(err).contains("bogus"));
        assert!(validate_batch(&[bogus], &IndexedOperations::new(), None).is_err());
    }

    #[test]
    fn test_schedule_bounds() {
        let error = ErrorObject::new("E", "m");
        let huge = OperationUpdate::retry("s1", error.clone(), 10_000_000_000_000_000);
        assert!(check(&[huge], &IndexedOperations::new()).is_err());
        let capped = OperationUpdate::retry("s1", error, MAX_SCHEDULE_SECONDS);
        assert!(check(&[capped], &IndexedOperations::new()).is_ok());

        for seconds in [f64::NAN, f64::INFINITY, -1.0, 1e300] {
            let wait = OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(seconds);
            assert!(check(&[wait], &IndexedOperations::new()).is_err(), "{seconds}");
        }
        let wait = OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(0.5);
        assert!(check(&[wait], &IndexedOperations::new()).is_ok());
    }

    #[test]
    fn test_parent_cannot_change() {
        let reg = registry(vec![
            Operation::new("ctx", OperationType::Context),
            Operation::new("other", OperationType::Context),
            Operation::new("s1", OperationType::Step).with_parent_id("ctx"),
        ]);

        let moved = OperationUpdate::succeed("s1", OperationType::Step, None).with_parent_id("other");
        let err = check(&[moved], &reg).unwrap_err();
        assert!(message(err).contains("parent"));

        let same = OperationUpdate::succeed("s1", OperationType::Step, None).with_parent_id("ctx");
        assert!(check(&[same], &reg).is_ok());

        let within_batch = vec![
            OperationUpdate::start("s2", OperationType::Step).with_parent_id("ctx"),
            OperationUpdate::succeed("s2", OperationType::Step, None).with_parent_id("other"),
        ];
        assert!(check(&within_batch, &reg).is_err());
    }

    #[test]
    fn test_parent_must_be_context() {
        let reg = registry(vec![
            Operation::new("ctx", OperationType::Context),
            Operation::new("s0", OperationType::Step),
        ]);

        let ok = vec![OperationUpdate::start("s1", OperationType::Step).with_parent_id("ctx")];
        assert!(check(&ok, &reg).is_ok());

        let not_context = vec![OperationUpdate::start("s1", OperationType::Step).with_parent_id("s0")];
        assert!(check(&not_context, &reg).is_err());

        let missing = vec![OperationUpdate::start("s1", OperationType::Step).with_parent_id("nope")];
        assert!(check(&missing, &reg).is_err());

        let same_batch = vec![
            OperationUpdate::start("ctx2", OperationType::Context),
            OperationUpdate::start("s1", OperationType::Step).with_parent_id("ctx2"),
        ];
        assert!(check(&same_batch, &reg).is_ok());
    }

    #[test]
    fn test_parent_declared_later_in_batch_is_rejected() {
        let updates = vec![
            OperationUpdate::start("s1", OperationType::Step).with_parent_id("ctx"),
            OperationUpdate::start("ctx", OperationType::Context),
        ];
        assert!(check(&updates, &IndexedOperations::new()).is_err());
    }

    #[test]
    fn test_error_payload_limit() {
        let big = ErrorObject::new("E", "x".repeat(MAX_ERROR_PAYLOAD_BYTES));
        let updates = vec![OperationUpdate::fail("s1", OperationType::Step, big)];
        assert!(check(&updates, &IndexedOperations::new()).is_err());

        let small = ErrorObject::new("E", "x".repeat(100));
        let updates = vec![OperationUpdate::fail("s1", OperationType::Step, small)];
        assert!(check(&updates, &IndexedOperations::new()).is_ok());
    }

    #[test]
    fn test_wait_transitions() {
        let mut waiting = Operation::new("w1", OperationType::Wait);
        waiting.wait_details = Some(WaitDetails {
            scheduled_end_timestamp: Some(1_000),
        });
        let reg = registry(vec![waiting]);

        let redelivery = OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(1.0);
        assert!(check(&[redelivery], &reg).is_ok());

        let cancel = OperationUpdate::cancel("w1", OperationType::Wait);
        assert!(check(&[cancel], &reg).is_ok());

        let reg = registry(vec![
            Operation::new("w1", OperationType::Wait).with_status(OperationStatus::Succeeded)
        ]);
        let cancel = OperationUpdate::cancel("w1", OperationType::Wait);
        assert!(check(&[cancel], &reg).is_err());
    }

    #[test]
    fn test_callback_start_on_existing_rejected() {
        let reg = registry(vec![Operation::new("cb", OperationType::Callback)]);
        let updates = vec![OperationUpdate::start("cb", OperationType::Callback)];
        assert!(check(&updates, &reg).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let reg = registry(vec![Operation::new("x", OperationType::Context)]);
        let updates = vec![OperationUpdate::succeed("x", OperationType::Step, None)];
        assert!(check(&updates, &reg).is_err());
    }
}
