//! # Durable Execution SDK
//!
//! Build handlers whose progress survives restarts. Every state transition
//! of a step, wait, callback or child context is checkpointed as an
//! [`OperationUpdate`]; when the handler is invoked again, completed work is
//! replayed from the checkpointed [`Operation`]s instead of re-running.
//!
//! ## Handler primitives
//!
//! - [`DurableContext::step`]: run a closure once, with retry via a
//!   [`RetryStrategy`].
//! - [`DurableContext::wait`]: suspend for a duration without holding a
//!   process.
//! - [`DurableContext::create_callback`]: wait for an external system to
//!   complete a callback ID.
//! - [`DurableContext::run_in_child_context`]: group operations under a
//!   CONTEXT operation.
//!
//! A primitive that cannot finish in the current invocation returns
//! [`DurableError::Suspend`]; propagate it with `?` and
//! [`run_durable_handler`] reports the invocation as pending.
//!
//! ```rust,ignore
//! use durable_execution_sdk::{DurableContext, DurableError};
//! use std::time::Duration;
//!
//! async fn process_order(order_id: String, ctx: DurableContext) -> Result<String, DurableError> {
//!     let reserved: bool = ctx.step(|_| Ok(true), None).await?;
//!     ctx.wait(Duration::from_secs(30), Some("cool-down")).await?;
//!     Ok(format!("{} reserved={}", order_id, reserved))
//! }
//! ```
//!
//! The companion testing crate runs handlers end-to-end against an
//! in-process checkpoint server.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod invocation;
pub mod operation;
pub mod state;

pub use client::{
    CheckpointResponse, DurableServiceClient, GetOperationsResponse, NewExecutionState,
    SharedDurableServiceClient,
};
pub use config::{
    CallbackConfig, ChildContextConfig, EnvironmentConfig, ExponentialBackoff, NoRetry,
    RetryDecision, RetryFn, RetryStrategy, StepConfig, StepSemantics,
};
pub use context::{derive_operation_id, DurableContext, OperationIdentifier};
pub use error::{DurableError, DurableResult, ErrorObject};
pub use handlers::{Callback, StepContext, StepOutcome, SuspendReason};
pub use invocation::{
    run_durable_handler, DurableExecutionInvocationInput, DurableExecutionInvocationOutput,
    InitialExecutionState, InvocationStatus,
};
pub use operation::{
    CallbackDetails, CallbackOptions, ChainedInvokeDetails, ChainedInvokeOptions, ContextDetails,
    ContextOptions, ExecutionDetails, Operation, OperationAction, OperationStatus, OperationType,
    OperationUpdate, StepDetails, StepOptions, WaitDetails, WaitOptions,
};
pub use state::ExecutionState;
