//! Local testing for durable handlers.
//!
//! This crate hosts an in-process checkpoint server and an orchestrator
//! that invokes a handler, watches its checkpoints, and re-invokes it for
//! retries, elapsed waits and completed callbacks, the way the hosted
//! service would.
//!
//! - [`LocalDurableTestRunner`]: run a typed handler end-to-end
//! - [`OperationHandle`]: inspect an operation, wait for it, and complete
//!   callbacks from a test
//! - [`checkpoint_server`]: the server, its state machine and the
//!   orchestrator, usable on their own
//!
//! ```ignore
//! use durable_execution_sdk_testing::{ExecutionStatus, LocalDurableTestRunner};
//!
//! #[tokio::test]
//! async fn test_workflow() {
//!     let runner = LocalDurableTestRunner::new(my_workflow);
//!     let result = runner.run("input".to_string()).await.unwrap();
//!     assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
//! }
//! ```

pub mod checkpoint_server;
pub mod error;
pub mod indexed_operations;
pub mod local_runner;
pub mod operation;
pub mod operation_storage;
pub mod test_result;
pub mod types;

pub use checkpoint_server::{
    CallbackSender, CheckpointApi, CheckpointServer, QueueScheduler, Scheduler, SkipTimeConfig,
    TestExecutionOrchestrator, TestExecutionResult, TimerScheduler,
};
pub use error::{ErrorBody, ErrorResponse, TestError};
pub use indexed_operations::IndexedOperations;
pub use local_runner::{LocalDurableTestRunner, LocalRunnerConfig, DEFAULT_LOCAL_ENDPOINT};
pub use operation::{
    CallbackDetails, ContextDetails, InvokeDetails, OperationHandle, StepDetails, WaitDetails,
};
pub use operation_storage::{OperationKey, OperationStorage};
pub use test_result::TestResult;
pub use types::{ExecutionStatus, Invocation, TestResultError, WaitingOperationStatus};

pub use durable_execution_sdk::{
    DurableContext, DurableError, DurableResult, ErrorObject, Operation, OperationStatus,
    OperationType,
};
