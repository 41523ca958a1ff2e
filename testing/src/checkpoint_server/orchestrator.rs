//! Drives one durable execution end-to-end against a [`CheckpointApi`].
//!
//! The orchestrator starts an execution, invokes the handler, and long-polls
//! the checkpoint server for everything the handler records. Polled batches
//! are mirrored into [`OperationStorage`] and drive re-invocation:
//!
//! - a STEP `RETRY` is marked READY after its retry delay, then re-invoked;
//! - a WAIT `START` is succeeded once its scheduled end passes;
//! - a CALLBACK completed from outside re-invokes immediately.
//!
//! At most one handler invocation is active at a time. A re-invoke request
//! that arrives while one is running is remembered and served when it ends.
//! The first terminal outcome wins, whether it comes from a handler output,
//! a polled EXECUTION update, or a fatal error.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use durable_execution_sdk::{
    DurableExecutionInvocationInput, DurableExecutionInvocationOutput, EnvironmentConfig,
    ErrorObject, InitialExecutionState, InvocationStatus, Operation, OperationAction,
    OperationStatus, OperationType,
};

use super::abort::{AbortController, AbortOnDrop, AbortSignal};
use super::scheduler::{Scheduler, TimerScheduler};
use super::server::CheckpointApi;
use super::types::{
    CheckpointDataUpdate, CheckpointOperation, ExecutionId, InvocationResult,
    PollCheckpointDataResponse, StartDurableExecutionRequest, UpdateCheckpointDataRequest,
};
use crate::error::TestError;
use crate::operation_storage::OperationStorage;
use crate::types::{ExecutionStatus, Invocation, TestResultError};

/// Delay used for retries and waits when time skipping is on.
const SKIPPED_DELAY: Duration = Duration::from_millis(1);

pub type HandlerFuture = Pin<Box<dyn Future<Output = DurableExecutionInvocationOutput> + Send>>;

/// Type-erased handler: one call per invocation.
pub type BoxedHandler = Arc<dyn Fn(DurableExecutionInvocationInput) -> HandlerFuture + Send + Sync>;

/// Collapses retry delays and wait durations to a millisecond.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipTimeConfig {
    pub enabled: bool,
}

/// Outcome of [`TestExecutionOrchestrator::execute_handler`].
#[derive(Debug, Clone)]
pub struct TestExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub error: Option<TestResultError>,
    /// Every operation observed, in arrival order
    pub operations: Vec<Operation>,
    pub invocations: Vec<Invocation>,
}

pub struct TestExecutionOrchestrator {
    api: Arc<dyn CheckpointApi>,
    handler: BoxedHandler,
    scheduler: Arc<dyn Scheduler>,
    storage: Arc<OperationStorage>,
    skip_time: SkipTimeConfig,
    environment: EnvironmentConfig,
}

impl std::fmt::Debug for TestExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestExecutionOrchestrator")
            .field("skip_time", &self.skip_time)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl TestExecutionOrchestrator {
    pub fn new(api: Arc<dyn CheckpointApi>, handler: BoxedHandler) -> Self {
        Self {
            api,
            handler,
            scheduler: Arc::new(TimerScheduler::new()),
            storage: Arc::new(OperationStorage::new()),
            skip_time: SkipTimeConfig::default(),
            environment: EnvironmentConfig {
                endpoint: None,
                local_mode: true,
            },
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_skip_time(mut self, skip_time: SkipTimeConfig) -> Self {
        self.skip_time = skip_time;
        self
    }

    /// Shares an existing storage, so handles created before the run see it.
    pub fn with_storage(mut self, storage: Arc<OperationStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    pub fn storage(&self) -> &Arc<OperationStorage> {
        &self.storage
    }

    /// Runs a fresh execution to completion.
    pub async fn execute_handler(
        &self,
        payload: Option<String>,
    ) -> Result<TestExecutionResult, TestError> {
        let started = self
            .api
            .start_durable_execution(StartDurableExecutionRequest { payload })
            .await?;
        self.environment.publish();
        self.storage.reset();
        self.storage.populate(started.operations.clone())?;

        let execution_id = started.execution_id.clone();
        tracing::info!(execution_id = %execution_id, "Executing handler");

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let run = Arc::new(ExecutionRun {
            api: Arc::clone(&self.api),
            handler: Arc::clone(&self.handler),
            scheduler: Arc::clone(&self.scheduler),
            storage: Arc::clone(&self.storage),
            skip_time: self.skip_time,
            execution_id: execution_id.clone(),
            invocations: Mutex::new(Vec::new()),
            slot: Mutex::new(InvocationSlot {
                active: true,
                reinvoke_pending: false,
            }),
            scheduled: Mutex::new(HashSet::new()),
            finished: AtomicBool::new(false),
            outcome_tx,
        });

        // Aborts the poll on every exit path, including early returns.
        let poll_guard = AbortOnDrop(AbortController::new());
        let poller = tokio::spawn(Arc::clone(&run).poll_loop(poll_guard.0.signal()));
        run.spawn_invocation(started);

        let outcome = outcome_rx.recv().await.unwrap_or_else(|| {
            Outcome::Fatal(TestError::checkpoint_server_error("execution ended without an outcome"))
        });
        run.finished.store(true, Ordering::SeqCst);

        drop(poll_guard);
        self.scheduler.flush_timers();
        if let Err(e) = poller.await {
            tracing::warn!(error = %e, "Checkpoint poll task did not shut down cleanly");
        }
        run.final_drain().await;
        self.storage.mark_finished();

        let invocations = std::mem::take(&mut *lock(&run.invocations));
        let (status, result, error) = match outcome {
            Outcome::Fatal(error) => {
                tracing::warn!(execution_id = %execution_id, error = %error, "Execution aborted");
                return Err(error);
            }
            Outcome::Succeeded(result) => (ExecutionStatus::Succeeded, result, None),
            Outcome::Failed(error) => (
                ExecutionStatus::Failed,
                None,
                Some(error.map(TestResultError::from).unwrap_or_else(|| {
                    TestResultError::from_message("execution failed without an error")
                })),
            ),
        };
        tracing::info!(execution_id = %execution_id, status = ?status, "Execution finished");

        Ok(TestExecutionResult {
            execution_id,
            status,
            result,
            error,
            operations: self.storage.operations(),
            invocations,
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Succeeded(Option<String>),
    Failed(Option<ErrorObject>),
    Fatal(TestError),
}

#[derive(Debug, Default)]
struct InvocationSlot {
    active: bool,
    reinvoke_pending: bool,
}

/// Shared state of one execution while it runs.
struct ExecutionRun {
    api: Arc<dyn CheckpointApi>,
    handler: BoxedHandler,
    scheduler: Arc<dyn Scheduler>,
    storage: Arc<OperationStorage>,
    skip_time: SkipTimeConfig,
    execution_id: ExecutionId,
    invocations: Mutex<Vec<Invocation>>,
    slot: Mutex<InvocationSlot>,
    /// Operations with a re-invoke already armed
    scheduled: Mutex<HashSet<String>>,
    finished: AtomicBool,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionRun {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Reports an outcome; only the first one counts.
    fn resolve(&self, outcome: Outcome) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            let _ = self.outcome_tx.send(outcome);
        } else {
            tracing::trace!(outcome = ?outcome, "Ignoring outcome after completion");
        }
    }

    async fn poll_loop(self: Arc<Self>, signal: AbortSignal) {
        while !signal.is_aborted() {
            match self.api.poll_checkpoint_data(&self.execution_id, signal.clone()).await {
                Ok(response) => {
                    if let Err(e) = self.process_operations(response) {
                        self.resolve(Outcome::Fatal(e));
                        break;
                    }
                }
                Err(e) if e.is_abort() => break,
                Err(e) => {
                    self.resolve(Outcome::Fatal(e));
                    break;
                }
            }
        }
        tracing::trace!(execution_id = %self.execution_id, "Checkpoint poll stopped");
    }

    /// Picks up anything checkpointed after the last poll so the result
    /// reflects the server's final state.
    async fn final_drain(&self) {
        let controller = AbortController::new();
        controller.abort();
        if let Ok(response) = self
            .api
            .poll_checkpoint_data(&self.execution_id, controller.signal())
            .await
        {
            if let Err(e) = self.storage.apply(&response.operations) {
                tracing::warn!(error = %e, "Could not apply final checkpoint batch");
            }
            self.record_on_invocations(&response);
        }
    }

    fn process_operations(
        self: &Arc<Self>,
        response: PollCheckpointDataResponse,
    ) -> Result<(), TestError> {
        if let Some(missing) = response
            .operations
            .iter()
            .map(CheckpointOperation::operation_id)
            .find(|id| !response.operation_invocation_id_map.contains_key(*id))
        {
            return Err(TestError::protocol_violation(format!(
                "could not find invocations for operation {}",
                missing
            )));
        }

        self.storage.apply(&response.operations)?;
        self.record_on_invocations(&response);

        if self.is_finished() {
            return Ok(());
        }
        for record in &response.operations {
            self.dispatch(record);
        }
        Ok(())
    }

    /// Credits each completed operation to the invocation that last touched it.
    fn record_on_invocations(&self, response: &PollCheckpointDataResponse) {
        let mut invocations = lock(&self.invocations);
        for record in response.operations.iter().filter(|r| r.operation.is_completed()) {
            let Some(owner) = response
                .operation_invocation_id_map
                .get(record.operation_id())
                .and_then(|ids| ids.last())
            else {
                continue;
            };
            if let Some(invocation) = invocations.iter_mut().find(|i| &i.invocation_id == owner) {
                invocation.record_operation(record.operation.clone());
            }
        }
    }

    fn dispatch(self: &Arc<Self>, record: &CheckpointOperation) {
        let Some(update) = &record.update else {
            return;
        };
        let operation = &record.operation;
        match (operation.operation_type, update.action) {
            (OperationType::Execution, OperationAction::Succeed) => {
                self.resolve(Outcome::Succeeded(update.payload.clone()));
            }
            (OperationType::Execution, OperationAction::Fail) => {
                self.resolve(Outcome::Failed(update.error.clone()));
            }
            (OperationType::Step, OperationAction::Retry) => {
                let delay = update
                    .step_options
                    .as_ref()
                    .and_then(|o| o.next_attempt_delay_seconds)
                    .map(Duration::from_secs)
                    .unwrap_or_default();
                self.schedule_reinvoke(
                    &operation.operation_id,
                    self.effective_delay(delay),
                    CheckpointDataUpdate::Status(OperationStatus::Ready),
                );
            }
            (OperationType::Wait, OperationAction::Start) => {
                let remaining_ms = operation
                    .wait_details
                    .as_ref()
                    .and_then(|d| d.scheduled_end_timestamp)
                    .map(|end| (end - Utc::now().timestamp_millis()).max(0))
                    .unwrap_or(0);
                self.schedule_reinvoke(
                    &operation.operation_id,
                    self.effective_delay(Duration::from_millis(remaining_ms as u64)),
                    CheckpointDataUpdate::Action(OperationAction::Succeed),
                );
            }
            (OperationType::Callback, OperationAction::Succeed | OperationAction::Fail) => {
                tracing::debug!(operation_id = %operation.operation_id, "Callback completed, re-invoking");
                let run = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = run.request_invocation().await {
                        run.resolve(Outcome::Fatal(e));
                    }
                });
            }
            _ => {}
        }
    }

    fn effective_delay(&self, delay: Duration) -> Duration {
        if self.skip_time.enabled {
            SKIPPED_DELAY
        } else {
            delay
        }
    }

    /// Arms a trusted server update followed by a re-invoke.
    fn schedule_reinvoke(
        self: &Arc<Self>,
        operation_id: &str,
        delay: Duration,
        update: CheckpointDataUpdate,
    ) {
        if !lock(&self.scheduled).insert(operation_id.to_string()) {
            return;
        }
        tracing::debug!(
            operation_id = %operation_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling re-invocation"
        );

        let run = Arc::clone(self);
        let on_error_run = Arc::clone(self);
        let operation_id = operation_id.to_string();
        self.scheduler.schedule_function(
            Box::new(move || {
                Box::pin(async move {
                    lock(&run.scheduled).remove(&operation_id);
                    if run.is_finished() {
                        return Ok(());
                    }
                    run.api
                        .update_checkpoint_data(UpdateCheckpointDataRequest {
                            execution_id: run.execution_id.clone(),
                            operation_id,
                            update,
                        })
                        .await?;
                    run.request_invocation().await
                })
            }),
            delay,
            Box::new(move |e| on_error_run.resolve(Outcome::Fatal(e))),
        );
    }

    /// Starts an invocation now, or once the active one ends.
    async fn request_invocation(self: &Arc<Self>) -> Result<(), TestError> {
        {
            let mut slot = lock(&self.slot);
            if slot.active {
                slot.reinvoke_pending = true;
                return Ok(());
            }
            slot.active = true;
        }
        self.start_next_invocation().await
    }

    async fn start_next_invocation(self: &Arc<Self>) -> Result<(), TestError> {
        if self.is_finished() {
            lock(&self.slot).active = false;
            return Ok(());
        }
        match self.api.start_invocation(&self.execution_id).await {
            Ok(started) => {
                self.spawn_invocation(started);
                Ok(())
            }
            Err(e) => {
                lock(&self.slot).active = false;
                Err(e)
            }
        }
    }

    fn spawn_invocation(self: &Arc<Self>, started: InvocationResult) {
        lock(&self.invocations).push(Invocation::new(&started.invocation_id));
        let input = DurableExecutionInvocationInput {
            durable_execution_arn: started.execution_id,
            checkpoint_token: started.checkpoint_token,
            initial_execution_state: InitialExecutionState::with_operations(started.operations),
        };
        let run = Arc::clone(self);
        tokio::spawn(async move { run.run_invocation(started.invocation_id, input).await });
    }

    async fn run_invocation(self: Arc<Self>, invocation_id: String, input: DurableExecutionInvocationInput) {
        tracing::debug!(invocation_id = %invocation_id, "Invoking handler");
        let output = tokio::spawn((self.handler)(input)).await;

        if let Err(e) = self
            .api
            .complete_invocation(&self.execution_id, &invocation_id)
            .await
        {
            tracing::warn!(invocation_id = %invocation_id, error = %e, "Could not complete invocation");
        }

        let output = match output {
            Ok(output) => output,
            Err(join_error) => {
                let message = join_error.to_string();
                self.finish_invocation(&invocation_id, Some(TestResultError::from_message(&message)));
                self.resolve(Outcome::Fatal(TestError::HandlerInvocation(message)));
                return;
            }
        };
        self.finish_invocation(&invocation_id, output.error.clone().map(TestResultError::from));

        match output.status {
            InvocationStatus::Succeeded => match output.result {
                Some(result) => self.resolve(Outcome::Succeeded(Some(result))),
                // The result was checkpointed; the polled EXECUTION update resolves.
                None => self.release_slot(),
            },
            InvocationStatus::Failed => self.resolve(Outcome::Failed(output.error)),
            InvocationStatus::Pending => {
                let reinvoke = {
                    let mut slot = lock(&self.slot);
                    if slot.reinvoke_pending && !self.is_finished() {
                        slot.reinvoke_pending = false;
                        true
                    } else {
                        *slot = InvocationSlot::default();
                        false
                    }
                };
                if reinvoke {
                    if let Err(e) = self.start_next_invocation().await {
                        self.resolve(Outcome::Fatal(e));
                    }
                }
            }
        }
    }

    fn release_slot(&self) {
        *lock(&self.slot) = InvocationSlot::default();
    }

    fn finish_invocation(&self, invocation_id: &str, error: Option<TestResultError>) {
        if let Some(invocation) = lock(&self.invocations)
            .iter_mut()
            .find(|i| i.invocation_id == invocation_id)
        {
            invocation.finish(error);
        }
    }
}
