//! Authoritative operation registry of a single execution.
//!
//! Checkpoint batches are validated as a whole and then applied under one
//! lock, with no await in between, so a rejected batch never leaves partial
//! state behind. Every applied batch is pushed onto a pending queue that the
//! orchestrator drains with [`CheckpointManager::get_pending_checkpoint_updates`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use durable_execution_sdk::{
    CallbackDetails, ChainedInvokeDetails, ContextDetails, ErrorObject, ExecutionDetails,
    Operation, OperationAction, OperationStatus, OperationType, OperationUpdate, StepDetails,
    WaitDetails,
};

use super::abort::AbortSignal;
use super::callback_manager::{
    CallbackManager, CallbackTimeout, CompleteCallbackStatus, TimeoutSink,
};
use super::types::{
    CheckpointDataUpdate, CheckpointOperation, ExecutionId, InvocationId, InvocationTimestamps,
    PollCheckpointDataResponse,
};
use super::validator;
use crate::error::TestError;
use crate::indexed_operations::IndexedOperations;

type PendingBatch = Vec<CheckpointOperation>;

#[derive(Debug)]
struct ManagerState {
    operations: IndexedOperations,
    callbacks: CallbackManager,
    /// Invocations that touched each operation, in first-touch order
    operation_invocations: HashMap<String, Vec<InvocationId>>,
    /// Start time of each invocation that has not completed
    invocations: HashMap<InvocationId, DateTime<Utc>>,
    execution_operation_id: Option<String>,
    execution_completed: bool,
}

#[derive(Debug)]
pub struct CheckpointManager {
    execution_id: ExecutionId,
    state: Mutex<ManagerState>,
    pending_tx: mpsc::UnboundedSender<PendingBatch>,
    pending_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingBatch>>,
}

impl CheckpointManager {
    /// Creates the manager for `execution_id`.
    ///
    /// Callback timers hold a weak reference back to the manager, so the
    /// manager is always handed out behind an `Arc`.
    pub fn new(execution_id: impl Into<String>) -> Arc<Self> {
        let execution_id = execution_id.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let sink: TimeoutSink = Arc::new(move |fired| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_callback_timeout(fired);
                }
            });
            let (pending_tx, pending_rx) = mpsc::unbounded_channel();
            Self {
                state: Mutex::new(ManagerState {
                    operations: IndexedOperations::new(),
                    callbacks: CallbackManager::new(execution_id.clone(), sink),
                    operation_invocations: HashMap::new(),
                    invocations: HashMap::new(),
                    execution_operation_id: None,
                    execution_completed: false,
                }),
                execution_id,
                pending_tx,
                pending_rx: tokio::sync::Mutex::new(pending_rx),
            }
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Creates the EXECUTION operation. Called once per execution; the
    /// initial operation is not queued for polling.
    pub fn initialize(
        &self,
        payload: Option<String>,
        invocation_id: &str,
    ) -> Result<Operation, TestError> {
        let mut state = self.lock()?;
        if state.execution_operation_id.is_some() {
            return Err(TestError::protocol_violation(format!(
                "execution {} is already initialized",
                self.execution_id
            )));
        }

        let now = Utc::now();
        let mut operation = Operation::new(Uuid::new_v4().to_string(), OperationType::Execution);
        operation.start_timestamp = Some(now.timestamp_millis());
        operation.execution_details = Some(ExecutionDetails {
            input_payload: payload,
        });

        let id = operation.operation_id.clone();
        state
            .operations
            .upsert(CheckpointOperation::new(operation.clone(), None))?;
        state.execution_operation_id = Some(id.clone());
        state.invocations.insert(invocation_id.to_string(), now);
        state
            .operation_invocations
            .insert(id, vec![invocation_id.to_string()]);

        tracing::debug!(execution_id = %self.execution_id, "Initialized execution");
        Ok(operation)
    }

    /// Registers a new invocation and returns the state it replays from.
    pub fn start_invocation(&self, invocation_id: &str) -> Result<Vec<Operation>, TestError> {
        let mut state = self.lock()?;
        if state.execution_completed {
            return Err(TestError::invalid_parameter(format!(
                "Execution {} has already completed.",
                self.execution_id
            )));
        }
        state.invocations.insert(invocation_id.to_string(), Utc::now());
        Ok(state.visible_operations())
    }

    pub fn complete_invocation(&self, invocation_id: &str) -> Result<InvocationTimestamps, TestError> {
        let mut state = self.lock()?;
        let start_timestamp = state
            .invocations
            .remove(invocation_id)
            .ok_or_else(|| TestError::InvocationNotFound(invocation_id.to_string()))?;
        Ok(InvocationTimestamps {
            start_timestamp,
            end_timestamp: Utc::now(),
        })
    }

    /// Validates and applies one checkpoint batch, then queues it for polling.
    ///
    /// Returns the resulting records in update order.
    pub fn process_checkpoint(
        &self,
        updates: Vec<OperationUpdate>,
        invocation_id: &str,
    ) -> Result<Vec<CheckpointOperation>, TestError> {
        let mut state = self.lock()?;
        validator::validate_batch(
            &updates,
            &state.operations,
            state.execution_operation_id.as_deref(),
        )?;
        state.check_new_operations(&updates)?;

        let now = Utc::now().timestamp_millis();
        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            applied.push(state.register_update(update, invocation_id, now)?);
        }

        if !applied.is_empty() {
            tracing::debug!(
                execution_id = %self.execution_id,
                invocation_id = %invocation_id,
                count = applied.len(),
                "Applied checkpoint batch"
            );
            self.queue(applied.clone());
        }
        Ok(applied)
    }

    /// Operations a worker sees on replay.
    ///
    /// Descendants of a completed CONTEXT that does not replay its children
    /// are left out.
    pub fn get_state(&self) -> Result<Vec<Operation>, TestError> {
        Ok(self.lock()?.visible_operations())
    }

    /// Long poll for applied updates.
    ///
    /// Returns everything queued so far, or waits for the next batch. Only
    /// one poll may wait at a time. Cancelling through `signal` fails with
    /// [`TestError::Aborted`] and loses nothing. Queued data wins over an
    /// already-aborted signal, so an aborted poll doubles as a final drain.
    pub async fn get_pending_checkpoint_updates(
        &self,
        signal: &AbortSignal,
    ) -> Result<PollCheckpointDataResponse, TestError> {
        let mut rx = self.pending_rx.try_lock().map_err(|_| {
            TestError::checkpoint_server_error(format!(
                "a poll is already waiting on execution {}",
                self.execution_id
            ))
        })?;

        let mut operations = tokio::select! {
            biased;
            batch = rx.recv() => batch.ok_or_else(|| {
                TestError::checkpoint_server_error("pending update queue closed")
            })?,
            _ = signal.aborted() => return Err(TestError::aborted("checkpoint poll cancelled")),
        };
        while let Ok(batch) = rx.try_recv() {
            operations.extend(batch);
        }
        drop(rx);

        let state = self.lock()?;
        let operation_invocation_id_map = operations
            .iter()
            .filter_map(|record| {
                let id = record.operation_id();
                state
                    .operation_invocations
                    .get(id)
                    .map(|invocations| (id.to_string(), invocations.clone()))
            })
            .collect();

        Ok(PollCheckpointDataResponse {
            operations,
            operation_invocation_id_map,
        })
    }

    /// Applies an orchestrator-side action or status to an existing operation.
    ///
    /// These are trusted transitions, such as a WAIT elapsing or a retried
    /// STEP becoming READY, and skip worker validation.
    pub fn update_checkpoint_data(
        &self,
        operation_id: &str,
        update: CheckpointDataUpdate,
    ) -> Result<CheckpointOperation, TestError> {
        let mut state = self.lock()?;
        let existing = state
            .operations
            .get(operation_id)
            .cloned()
            .ok_or_else(|| TestError::operation_not_found(operation_id))?;

        let mut operation = existing.operation;
        let record = match update {
            CheckpointDataUpdate::Action(action) => {
                let update = OperationUpdate::new(operation_id, operation.operation_type, action)
                    .with_optional_parent_id(operation.parent_id.clone())
                    .with_optional_name(operation.name.clone());
                state.apply_action(&mut operation, &update, Utc::now().timestamp_millis());
                CheckpointOperation::new(operation, Some(update))
            }
            CheckpointDataUpdate::Status(status) => {
                operation.status = status;
                CheckpointOperation::new(operation, None)
            }
        };

        state.operations.upsert(record.clone())?;
        state.note_execution_completion(&record.operation);
        self.queue(vec![record.clone()]);
        Ok(record)
    }

    pub fn complete_callback(
        &self,
        callback_id: &str,
        status: CompleteCallbackStatus,
        result: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<CheckpointOperation, TestError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let record =
            state
                .callbacks
                .complete_callback(callback_id, status, result, error, &mut state.operations)?;
        self.queue(vec![record.clone()]);
        Ok(record)
    }

    pub fn heartbeat_callback(&self, callback_id: &str) -> Result<(), TestError> {
        self.lock()?.callbacks.heartbeat_callback(callback_id)
    }

    pub fn has_operation(&self, operation_id: &str) -> bool {
        self.lock()
            .map(|state| state.operations.contains(operation_id))
            .unwrap_or(false)
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<CheckpointOperation> {
        self.lock()
            .ok()
            .and_then(|state| state.operations.get(operation_id).cloned())
    }

    pub fn is_execution_completed(&self) -> bool {
        self.lock()
            .map(|state| state.execution_completed)
            .unwrap_or(false)
    }

    /// Clears all callback timers.
    pub fn cleanup(&self) {
        if let Ok(mut state) = self.lock() {
            state.callbacks.cleanup();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>, TestError> {
        self.state
            .lock()
            .map_err(|_| TestError::checkpoint_server_error("checkpoint state lock poisoned"))
    }

    fn queue(&self, batch: PendingBatch) {
        // The receiver lives as long as `self`.
        let _ = self.pending_tx.send(batch);
    }

    fn on_callback_timeout(&self, fired: CallbackTimeout) {
        let Ok(mut guard) = self.lock() else {
            return;
        };
        let state = &mut *guard;
        if !state.callbacks.is_current(&fired) {
            tracing::trace!(callback_id = %fired.callback_id, "Ignoring stale callback timer");
            return;
        }
        match state.callbacks.complete_callback(
            &fired.callback_id,
            CompleteCallbackStatus::TimedOut,
            None,
            Some(fired.error()),
            &mut state.operations,
        ) {
            Ok(record) => {
                tracing::debug!(
                    callback_id = %fired.callback_id,
                    kind = ?fired.kind,
                    "Callback timed out"
                );
                self.queue(vec![record]);
            }
            Err(e) => {
                tracing::warn!(callback_id = %fired.callback_id, error = %e, "Failed to time out callback");
            }
        }
    }
}

impl ManagerState {
    fn visible_operations(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|record| !self.is_pruned(&record.operation))
            .map(|record| record.operation.clone())
            .collect()
    }

    fn is_pruned(&self, operation: &Operation) -> bool {
        let mut parent_id = operation.parent_id.as_deref();
        while let Some(id) = parent_id {
            let Some(parent) = self.operations.get_operation(id) else {
                return false;
            };
            let replays_children = parent
                .context_details
                .as_ref()
                .and_then(|d| d.replay_children)
                .unwrap_or(false);
            if parent.operation_type == OperationType::Context
                && parent.is_completed()
                && !replays_children
            {
                return true;
            }
            parent_id = parent.parent_id.as_deref();
        }
        false
    }

    /// An operation that has never existed cannot already have invocations.
    fn check_new_operations(&self, updates: &[OperationUpdate]) -> Result<(), TestError> {
        let mut seen = HashSet::new();
        for update in updates {
            let id = update.operation_id.as_str();
            if !self.operations.contains(id)
                && seen.insert(id)
                && self.operation_invocations.contains_key(id)
            {
                return Err(TestError::protocol_violation(format!(
                    "invocations already recorded for new operation {}",
                    id
                )));
            }
        }
        Ok(())
    }

    fn register_update(
        &mut self,
        update: OperationUpdate,
        invocation_id: &str,
        now: i64,
    ) -> Result<CheckpointOperation, TestError> {
        let existing = self.operations.get(&update.operation_id).cloned();
        let record = match existing {
            Some(existing) if validator::is_wait_redelivery(&update, Some(&existing.operation)) => {
                tracing::trace!(operation_id = %update.operation_id, "Re-queueing started wait");
                existing
            }
            Some(existing) => {
                let mut operation = existing.operation;
                self.apply_action(&mut operation, &update, now);
                CheckpointOperation::new(operation, Some(update))
            }
            None => {
                let operation = self.create_operation(&update, now)?;
                CheckpointOperation::new(operation, Some(update))
            }
        };

        self.operations.upsert(record.clone())?;
        self.note_execution_completion(&record.operation);

        let invocations = self
            .operation_invocations
            .entry(record.operation.operation_id.clone())
            .or_default();
        if !invocations.iter().any(|id| id == invocation_id) {
            invocations.push(invocation_id.to_string());
        }
        Ok(record)
    }

    fn create_operation(
        &mut self,
        update: &OperationUpdate,
        now: i64,
    ) -> Result<Operation, TestError> {
        let mut operation = Operation::new(&update.operation_id, update.operation_type);
        operation.parent_id = update.parent_id.clone();
        operation.name = update.name.clone();
        operation.sub_type = update.sub_type.clone();
        operation.start_timestamp = Some(now);

        match update.operation_type {
            OperationType::Wait => {
                let seconds = update.wait_options.as_ref().map_or(0.0, |w| w.wait_seconds);
                operation.wait_details = Some(WaitDetails {
                    scheduled_end_timestamp: Some(now.saturating_add((seconds * 1000.0).round() as i64)),
                });
            }
            OperationType::Callback => {
                let options = update.callback_options.clone().unwrap_or_default();
                let callback_id = self.callbacks.create_callback(
                    &update.operation_id,
                    options.timeout_seconds,
                    options.heartbeat_timeout_seconds,
                )?;
                operation.callback_details = Some(CallbackDetails {
                    callback_id: Some(callback_id),
                    ..Default::default()
                });
            }
            OperationType::Context => {
                let replay_children = update
                    .context_options
                    .as_ref()
                    .and_then(|o| o.replay_children)
                    .unwrap_or(false);
                operation.context_details = Some(ContextDetails {
                    replay_children: Some(replay_children),
                    ..Default::default()
                });
            }
            OperationType::Step => operation.step_details = Some(StepDetails::default()),
            OperationType::Execution => operation.execution_details = Some(ExecutionDetails::default()),
            OperationType::Invoke => {
                operation.chained_invoke_details = Some(ChainedInvokeDetails::default())
            }
        }

        self.apply_action(&mut operation, update, now);
        Ok(operation)
    }

    /// Merges `update` into `operation`.
    fn apply_action(&mut self, operation: &mut Operation, update: &OperationUpdate, now: i64) {
        operation.status = update.action.resulting_status();
        if matches!(
            update.action,
            OperationAction::Succeed | OperationAction::Fail | OperationAction::Cancel
        ) {
            operation.end_timestamp = Some(now);
        }

        match operation.operation_type {
            OperationType::Step => {
                let details = operation.step_details.get_or_insert_with(StepDetails::default);
                match update.action {
                    OperationAction::Retry => {
                        let delay = update
                            .step_options
                            .as_ref()
                            .and_then(|o| o.next_attempt_delay_seconds)
                            .unwrap_or(0);
                        details.attempt = Some(details.attempt.unwrap_or(0) + 1);
                        let delay_millis = i64::try_from(delay).unwrap_or(i64::MAX).saturating_mul(1000);
                        details.next_attempt_timestamp = Some(now.saturating_add(delay_millis));
                        details.error = update.error.clone();
                    }
                    OperationAction::Succeed | OperationAction::Fail => {
                        details.result = update.payload.clone();
                        details.error = update.error.clone();
                    }
                    OperationAction::Start | OperationAction::Cancel => {}
                }
            }
            OperationType::Context if update.action.is_completion() => {
                let details = operation
                    .context_details
                    .get_or_insert_with(ContextDetails::default);
                details.result = update.payload.clone();
                details.error = update.error.clone();
                if let Some(replay) = update.context_options.as_ref().and_then(|o| o.replay_children) {
                    details.replay_children = Some(replay);
                }
            }
            OperationType::Invoke if update.action.is_completion() => {
                let details = operation
                    .chained_invoke_details
                    .get_or_insert_with(ChainedInvokeDetails::default);
                details.result = update.payload.clone();
                details.error = update.error.clone();
            }
            OperationType::Callback if update.action == OperationAction::Cancel => {
                if let Some(callback_id) = operation
                    .callback_details
                    .as_ref()
                    .and_then(|d| d.callback_id.as_deref())
                {
                    self.callbacks.cancel_callback(callback_id);
                }
            }
            _ => {}
        }
    }

    fn note_execution_completion(&mut self, operation: &Operation) {
        if operation.operation_type == OperationType::Execution && operation.is_completed() {
            self.execution_completed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_server::abort::AbortController;
    use std::time::Duration;

    const INV: &str = "inv-1";

    fn manager() -> (Arc<CheckpointManager>, Operation) {
        let manager = CheckpointManager::new("exec-1");
        let execution = manager.initialize(Some("{\"n\":1}".into()), INV).unwrap();
        (manager, execution)
    }

    async fn poll(manager: &CheckpointManager) -> PollCheckpointDataResponse {
        let controller = AbortController::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            manager.get_pending_checkpoint_updates(&controller.signal()),
        )
        .await
        .expect("poll should resolve")
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_creates_started_execution() {
        let (manager, execution) = manager();
        assert_eq!(execution.operation_type, OperationType::Execution);
        assert_eq!(execution.status, OperationStatus::Started);
        assert_eq!(
            execution.execution_details.unwrap().input_payload.as_deref(),
            Some("{\"n\":1}")
        );
        assert_eq!(manager.get_state().unwrap().len(), 1);
        assert!(manager.initialize(None, INV).is_err());

        // Not queued: an aborted poll finds nothing.
        let controller = AbortController::new();
        controller.abort();
        let err = manager
            .get_pending_checkpoint_updates(&controller.signal())
            .await
            .unwrap_err();
        assert!(err.is_abort());
    }

    #[tokio::test]
    async fn test_wait_schedules_end_timestamp() {
        let (manager, _) = manager();
        let before = Utc::now().timestamp_millis();
        let applied = manager
            .process_checkpoint(
                vec![OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(0.25)],
                INV,
            )
            .unwrap();
        let scheduled = applied[0]
            .operation
            .wait_details
            .as_ref()
            .and_then(|d| d.scheduled_end_timestamp)
            .unwrap();
        assert!(scheduled >= before + 250);
        assert!(scheduled <= Utc::now().timestamp_millis() + 250);
    }

    #[tokio::test]
    async fn test_retry_increments_attempt() {
        let (manager, _) = manager();
        let error = ErrorObject::new("Error", "transient");
        let applied = manager
            .process_checkpoint(vec![OperationUpdate::retry("s1", error.clone(), 2)], INV)
            .unwrap();
        let details = applied[0].operation.step_details.clone().unwrap();
        assert_eq!(applied[0].operation.status, OperationStatus::Pending);
        assert_eq!(details.attempt, Some(1));
        assert!(details.next_attempt_timestamp.is_some());
        assert_eq!(details.error, Some(error.clone()));

        manager
            .update_checkpoint_data("s1", CheckpointDataUpdate::Status(OperationStatus::Ready))
            .unwrap();
        let applied = manager
            .process_checkpoint(
                vec![
                    OperationUpdate::start("s1", OperationType::Step),
                    OperationUpdate::retry("s1", error, 2),
                ],
                "inv-2",
            )
            .unwrap();
        assert_eq!(applied[1].operation.step_details.clone().unwrap().attempt, Some(2));
    }

    #[tokio::test]
    async fn test_rejected_batch_changes_nothing() {
        let (manager, _) = manager();
        let before = manager.get_state().unwrap();
        let err = manager
            .process_checkpoint(
                vec![
                    OperationUpdate::start("s1", OperationType::Step),
                    OperationUpdate::succeed("op1", OperationType::Step, Some("1".into())),
                    OperationUpdate::succeed("op1", OperationType::Step, Some("2".into())),
                ],
                INV,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot update the same operation with the same action twice in a single request."
        );
        assert_eq!(manager.get_state().unwrap(), before);
        assert!(!manager.has_operation("s1"));
    }

    #[tokio::test]
    async fn test_queued_batches_delivered_together_in_order() {
        let (manager, _) = manager();
        manager
            .process_checkpoint(
                vec![
                    OperationUpdate::start("a", OperationType::Step),
                    OperationUpdate::succeed("a", OperationType::Step, Some("1".into())),
                ],
                INV,
            )
            .unwrap();
        manager
            .process_checkpoint(vec![OperationUpdate::succeed("b", OperationType::Step, None)], INV)
            .unwrap();

        let response = poll(&manager).await;
        let ids: Vec<&str> = response.operations.iter().map(|o| o.operation_id()).collect();
        assert_eq!(ids, vec!["a", "a", "b"]);
        assert_eq!(response.operation_invocation_id_map["a"], vec![INV.to_string()]);
    }

    #[tokio::test]
    async fn test_poll_waits_for_next_batch() {
        let (manager, _) = manager();
        let poller = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { poll(&manager).await })
        };
        tokio::task::yield_now().await;
        manager
            .process_checkpoint(vec![OperationUpdate::succeed("s1", OperationType::Step, None)], INV)
            .unwrap();

        let response = poller.await.unwrap();
        assert_eq!(response.operations.len(), 1);
        assert_eq!(response.operations[0].operation_id(), "s1");
    }

    #[tokio::test]
    async fn test_only_one_poller() {
        let (manager, _) = manager();
        let controller = AbortController::new();
        let first = {
            let manager = Arc::clone(&manager);
            let signal = controller.signal();
            tokio::spawn(async move { manager.get_pending_checkpoint_updates(&signal).await })
        };
        tokio::task::yield_now().await;

        let second = manager
            .get_pending_checkpoint_updates(&AbortController::new().signal())
            .await;
        assert!(second.is_err());

        controller.abort();
        assert!(first.await.unwrap().unwrap_err().is_abort());
    }

    #[tokio::test]
    async fn test_started_wait_is_requeued_unchanged() {
        let (manager, _) = manager();
        let update = OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(60.0);
        let first = manager.process_checkpoint(vec![update.clone()], INV).unwrap();
        let second = manager.process_checkpoint(vec![update], "inv-2").unwrap();
        assert_eq!(first[0].operation, second[0].operation);

        let response = poll(&manager).await;
        assert_eq!(response.operations.len(), 2);
        assert_eq!(
            response.operation_invocation_id_map["w1"],
            vec![INV.to_string(), "inv-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_get_state_prunes_children_of_completed_contexts() {
        let (manager, _) = manager();
        manager
            .process_checkpoint(
                vec![
                    OperationUpdate::start("ctx", OperationType::Context),
                    OperationUpdate::start("inner", OperationType::Context).with_parent_id("ctx"),
                    OperationUpdate::succeed("leaf", OperationType::Step, None).with_parent_id("inner"),
                    OperationUpdate::start("keep", OperationType::Context).with_replay_children(true),
                    OperationUpdate::succeed("kept", OperationType::Step, None).with_parent_id("keep"),
                ],
                INV,
            )
            .unwrap();

        // Nothing completed yet: everything visible.
        assert_eq!(manager.get_state().unwrap().len(), 6);

        manager
            .process_checkpoint(
                vec![
                    OperationUpdate::succeed("ctx", OperationType::Context, Some("1".into())),
                    OperationUpdate::succeed("keep", OperationType::Context, Some("2".into())),
                ],
                INV,
            )
            .unwrap();

        let ids: Vec<String> = manager
            .get_state()
            .unwrap()
            .into_iter()
            .map(|op| op.operation_id)
            .collect();
        assert!(ids.contains(&"ctx".to_string()));
        assert!(!ids.contains(&"inner".to_string()));
        assert!(!ids.contains(&"leaf".to_string()));
        assert!(ids.contains(&"keep".to_string()));
        assert!(ids.contains(&"kept".to_string()));
    }

    #[tokio::test]
    async fn test_update_checkpoint_data() {
        let (manager, _) = manager();
        manager
            .process_checkpoint(
                vec![OperationUpdate::start("w1", OperationType::Wait).with_wait_seconds(1.0)],
                INV,
            )
            .unwrap();
        let _ = poll(&manager).await;

        let record = manager
            .update_checkpoint_data("w1", CheckpointDataUpdate::Action(OperationAction::Succeed))
            .unwrap();
        assert_eq!(record.operation.status, OperationStatus::Succeeded);
        assert!(record.operation.end_timestamp.is_some());
        assert_eq!(record.update.as_ref().map(|u| u.action), Some(OperationAction::Succeed));

        let response = poll(&manager).await;
        assert_eq!(response.operations, vec![record]);

        assert!(manager
            .update_checkpoint_data("missing", CheckpointDataUpdate::Status(OperationStatus::Ready))
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_times_out() {
        let (manager, _) = manager();
        manager
            .process_checkpoint(
                vec![OperationUpdate::start("cb", OperationType::Callback)
                    .with_callback_options(Some(1), None)],
                INV,
            )
            .unwrap();
        let created = poll(&manager).await;
        assert!(created.operations[0]
            .operation
            .callback_details
            .as_ref()
            .and_then(|d| d.callback_id.clone())
            .is_some());

        let response = poll(&manager).await;
        let record = &response.operations[0];
        assert_eq!(record.operation.status, OperationStatus::TimedOut);
        assert!(record.operation.error().is_some());
        assert_eq!(response.operation_invocation_id_map["cb"], vec![INV.to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_callback_cannot_complete() {
        let (manager, _) = manager();
        let applied = manager
            .process_checkpoint(
                vec![OperationUpdate::start("cb", OperationType::Callback)
                    .with_callback_options(Some(60), Some(10))],
                INV,
            )
            .unwrap();
        let callback_id = applied[0]
            .operation
            .callback_details
            .as_ref()
            .and_then(|d| d.callback_id.clone())
            .unwrap();

        manager
            .process_checkpoint(vec![OperationUpdate::cancel("cb", OperationType::Callback)], INV)
            .unwrap();
        let err = manager
            .complete_callback(&callback_id, CompleteCallbackStatus::Succeeded, None, None)
            .unwrap_err();
        assert!(matches!(err, TestError::OperationNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_extends_callback_deadline() {
        let (manager, _) = manager();
        let applied = manager
            .process_checkpoint(
                vec![OperationUpdate::start("cb", OperationType::Callback)
                    .with_callback_options(None, Some(2))],
                INV,
            )
            .unwrap();
        let callback_id = applied[0]
            .operation
            .callback_details
            .as_ref()
            .and_then(|d| d.callback_id.clone())
            .unwrap();
        let _ = poll(&manager).await;
        let status = || manager.get_operation("cb").unwrap().operation.status;

        tokio::time::advance(Duration::from_millis(1500)).await;
        manager.heartbeat_callback(&callback_id).unwrap();

        // t=2s: the original heartbeat deadline has passed.
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(status(), OperationStatus::Started);

        // t=3.5s: two seconds after the heartbeat.
        tokio::time::advance(Duration::from_millis(1500)).await;
        let response = poll(&manager).await;
        assert_eq!(response.operations.len(), 1);
        assert_eq!(response.operations[0].operation.status, OperationStatus::TimedOut);
        assert_eq!(status(), OperationStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_execution_update_with_unknown_id_rejected() {
        let (manager, execution) = manager();
        let err = manager
            .process_checkpoint(
                vec![OperationUpdate::succeed("bogus", OperationType::Execution, Some("1".into()))],
                INV,
            )
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidParameterValue(_)));
        assert!(!manager.has_operation("bogus"));
        assert!(!manager.is_execution_completed());

        let executions = manager
            .get_state()
            .unwrap()
            .into_iter()
            .filter(|op| op.operation_type == OperationType::Execution)
            .count();
        assert_eq!(executions, 1);
        assert!(manager
            .process_checkpoint(
                vec![OperationUpdate::succeed(
                    execution.operation_id,
                    OperationType::Execution,
                    None
                )],
                INV,
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_retry_delay_keeps_manager_usable() {
        let (manager, _) = manager();
        let err = manager
            .process_checkpoint(
                vec![OperationUpdate::retry(
                    "s1",
                    ErrorObject::new("Error", "transient"),
                    10_000_000_000_000_000,
                )],
                INV,
            )
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidParameterValue(_)));
        assert!(!manager.has_operation("s1"));

        assert_eq!(manager.get_state().unwrap().len(), 1);
        let applied = manager
            .process_checkpoint(
                vec![OperationUpdate::retry(
                    "s1",
                    ErrorObject::new("Error", "transient"),
                    validator::MAX_SCHEDULE_SECONDS,
                )],
                INV,
            )
            .unwrap();
        assert!(applied[0]
            .operation
            .step_details
            .as_ref()
            .and_then(|d| d.next_attempt_timestamp)
            .is_some());
    }

    #[tokio::test]
    async fn test_parent_change_rejected() {
        let (manager, _) = manager();
        manager
            .process_checkpoint(
                vec![
                    OperationUpdate::start("a", OperationType::Context),
                    OperationUpdate::start("b", OperationType::Context),
                    OperationUpdate::start("s1", OperationType::Step).with_parent_id("a"),
                ],
                INV,
            )
            .unwrap();
        let err = manager
            .process_checkpoint(
                vec![OperationUpdate::succeed("s1", OperationType::Step, None).with_parent_id("b")],
                INV,
            )
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidParameterValue(_)));
        let s1 = manager.get_operation("s1").unwrap().operation;
        assert_eq!(s1.parent_id.as_deref(), Some("a"));
        assert_eq!(s1.status, OperationStatus::Started);
    }

    #[tokio::test]
    async fn test_invocations_lifecycle() {
        let (manager, execution) = manager();
        assert_eq!(manager.start_invocation("inv-2").unwrap().len(), 1);
        assert!(manager.complete_invocation("inv-2").is_ok());
        assert!(matches!(
            manager.complete_invocation("inv-2"),
            Err(TestError::InvocationNotFound(_))
        ));

        manager
            .process_checkpoint(
                vec![OperationUpdate::succeed(
                    execution.operation_id,
                    OperationType::Execution,
                    Some("\"done\"".into()),
                )],
                INV,
            )
            .unwrap();
        assert!(manager.is_execution_completed());
        assert!(manager.start_invocation("inv-3").is_err());
    }
}
