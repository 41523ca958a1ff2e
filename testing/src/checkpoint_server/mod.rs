//! In-process checkpoint server and the orchestrator that drives it.
//!
//! # Architecture
//!
//! - **CheckpointServer**: the transport boundary ([`CheckpointApi`],
//!   [`CallbackSender`] and the SDK's `DurableServiceClient`)
//! - **ExecutionManager**: every execution hosted by the server
//! - **CheckpointManager**: the state machine of one execution
//! - **CallbackManager**: callback ids, timeouts and heartbeats
//! - **validator**: checkpoint batch validation
//! - **TestExecutionOrchestrator**: invokes a handler and re-invokes it on
//!   retries, elapsed waits and completed callbacks
//! - **Scheduler**: delayed work for the orchestrator

pub mod abort;
pub mod callback_manager;
pub mod checkpoint_manager;
pub mod checkpoint_token;
pub mod execution_manager;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod types;
pub mod validator;

pub use abort::{AbortController, AbortOnDrop, AbortSignal};
pub use callback_manager::{
    decode_callback_id, encode_callback_id, CallbackIdData, CallbackManager, CallbackTimeout,
    CompleteCallbackStatus, TimerKind,
};
pub use checkpoint_manager::CheckpointManager;
pub use checkpoint_token::{decode_checkpoint_token, encode_checkpoint_token, CheckpointTokenData};
pub use execution_manager::ExecutionManager;
pub use orchestrator::{
    BoxedHandler, HandlerFuture, SkipTimeConfig, TestExecutionOrchestrator, TestExecutionResult,
};
pub use scheduler::{BoxFuture, ErrorHandler, QueueScheduler, ScheduledFn, Scheduler, TimerScheduler};
pub use server::{CallbackSender, CheckpointApi, CheckpointServer};
pub use types::{
    CheckpointDataUpdate, CheckpointOperation, CheckpointToken, ExecutionId, InvocationId,
    InvocationResult, InvocationTimestamps, PollCheckpointDataResponse,
    SendCallbackFailureRequest, SendCallbackSuccessRequest, StartDurableExecutionRequest,
    UpdateCheckpointDataRequest,
};
