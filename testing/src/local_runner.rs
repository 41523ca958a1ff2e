//! Runs a typed durable handler end-to-end in-process.
//!
//! ```ignore
//! use durable_execution_sdk::{DurableContext, DurableError};
//! use durable_execution_sdk_testing::{ExecutionStatus, LocalDurableTestRunner};
//!
//! async fn greet(name: String, ctx: DurableContext) -> Result<String, DurableError> {
//!     let greeting: String = ctx.step(|_| Ok(format!("hello {}", name)), None).await?;
//!     Ok(greeting)
//! }
//!
//! #[tokio::test]
//! async fn test_greet() {
//!     let runner = LocalDurableTestRunner::new(greet);
//!     let result = runner.run("ada".to_string()).await.unwrap();
//!     assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
//!     assert_eq!(result.get_result().unwrap(), "hello ada");
//! }
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use durable_execution_sdk::{
    run_durable_handler, DurableContext, DurableResult, EnvironmentConfig,
    SharedDurableServiceClient,
};

use crate::checkpoint_server::{
    BoxedHandler, CheckpointServer, Scheduler, SkipTimeConfig, TestExecutionOrchestrator,
};
use crate::error::TestError;
use crate::operation::OperationHandle;
use crate::operation_storage::{OperationKey, OperationStorage};
use crate::test_result::TestResult;

/// Endpoint published to handler code while running locally.
pub const DEFAULT_LOCAL_ENDPOINT: &str = "local://checkpoint-server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRunnerConfig {
    /// Collapse retry delays and waits to a millisecond
    pub skip_time: bool,
    pub endpoint: Option<String>,
    /// Simulated latency of every checkpoint call
    pub checkpoint_delay: Option<Duration>,
}

impl Default for LocalRunnerConfig {
    fn default() -> Self {
        Self {
            skip_time: true,
            endpoint: Some(DEFAULT_LOCAL_ENDPOINT.to_string()),
            checkpoint_delay: None,
        }
    }
}

/// Owns a [`CheckpointServer`] and an orchestrator for one handler.
///
/// Operation handles can be taken before or during a run; they resolve
/// against the most recent run.
pub struct LocalDurableTestRunner<I, O> {
    server: Arc<CheckpointServer>,
    orchestrator: TestExecutionOrchestrator,
    storage: Arc<OperationStorage>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> std::fmt::Debug for LocalDurableTestRunner<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDurableTestRunner")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl<I, O> LocalDurableTestRunner<I, O>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(I, DurableContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DurableResult<O>> + Send + 'static,
    {
        Self::with_config(handler, LocalRunnerConfig::default())
    }

    pub fn with_config<F, Fut>(handler: F, config: LocalRunnerConfig) -> Self
    where
        F: Fn(I, DurableContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DurableResult<O>> + Send + 'static,
    {
        let server = Arc::new(match config.checkpoint_delay {
            Some(delay) => CheckpointServer::new().with_checkpoint_delay(delay),
            None => CheckpointServer::new(),
        });

        let handler = Arc::new(handler);
        let client_server = Arc::clone(&server);
        let boxed: BoxedHandler = Arc::new(move |input| {
            let client: SharedDurableServiceClient = client_server.clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                run_durable_handler(input, client, move |payload: I, ctx| handler(payload, ctx)).await
            })
        });

        let storage = Arc::new(OperationStorage::new());
        let orchestrator = TestExecutionOrchestrator::new(server.clone(), boxed)
            .with_storage(Arc::clone(&storage))
            .with_skip_time(SkipTimeConfig {
                enabled: config.skip_time,
            })
            .with_environment(EnvironmentConfig {
                endpoint: config.endpoint,
                local_mode: true,
            });

        Self {
            server,
            orchestrator,
            storage,
            _types: PhantomData,
        }
    }

    /// Replaces the default timer scheduler, e.g. with a `QueueScheduler`.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.orchestrator = self.orchestrator.with_scheduler(scheduler);
        self
    }

    /// Runs a fresh execution with `input` until it succeeds or fails.
    pub async fn run(&self, input: I) -> Result<TestResult<O>, TestError> {
        let payload = serde_json::to_string(&input)?;
        let execution = self.orchestrator.execute_handler(Some(payload)).await?;
        tracing::debug!(
            execution_id = %execution.execution_id,
            status = %execution.status,
            operations = execution.operations.len(),
            "Local run finished"
        );
        TestResult::from_execution(execution)
    }

    pub fn server(&self) -> &Arc<CheckpointServer> {
        &self.server
    }

    /// First operation named `name`.
    pub fn get_operation(&self, name: &str) -> OperationHandle {
        self.get_operation_by_name_and_index(name, 0)
    }

    pub fn get_operation_by_name_and_index(&self, name: &str, index: usize) -> OperationHandle {
        self.handle(OperationKey::ByName {
            name: name.to_string(),
            index,
        })
    }

    /// Operation at `index` in arrival order; 0 is the EXECUTION operation.
    pub fn get_operation_by_index(&self, index: usize) -> OperationHandle {
        self.handle(OperationKey::ByIndex(index))
    }

    pub fn get_operation_by_id(&self, id: &str) -> OperationHandle {
        self.handle(OperationKey::ById(id.to_string()))
    }

    fn handle(&self, key: OperationKey) -> OperationHandle {
        OperationHandle::new(key, Arc::clone(&self.storage))
            .with_callback_sender(self.server.clone())
    }
}
