//! Operation handlers for the durable execution SDK.
//!
//! Each handler inspects the replayed operation (if any), decides whether
//! the work is already done, still pending, or must run now, and reports
//! that decision as an explicit [`StepOutcome`].

pub mod callback;
pub mod child;
pub mod step;
pub mod wait;

pub use callback::{create_callback_handler, Callback};
pub use child::child_context_handler;
pub use step::{step_handler, StepContext};
pub use wait::wait_handler;

use crate::error::{DurableError, DurableResult};

/// Why a handler stopped the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// A step failed and its next attempt is scheduled.
    RetryScheduled {
        operation_id: String,
        next_attempt_timestamp: Option<i64>,
    },
    /// A wait has not elapsed yet.
    WaitScheduled {
        operation_id: String,
        scheduled_end_timestamp: Option<i64>,
    },
    /// A callback has not been completed yet.
    CallbackPending { operation_id: String },
}

impl SuspendReason {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::RetryScheduled { operation_id, .. }
            | Self::WaitScheduled { operation_id, .. }
            | Self::CallbackPending { operation_id } => operation_id,
        }
    }

    fn resume_timestamp(&self) -> Option<i64> {
        match self {
            Self::RetryScheduled {
                next_attempt_timestamp,
                ..
            } => *next_attempt_timestamp,
            Self::WaitScheduled {
                scheduled_end_timestamp,
                ..
            } => *scheduled_end_timestamp,
            Self::CallbackPending { .. } => None,
        }
    }
}

/// Control-flow result of a handler primitive.
///
/// `Suspend` tells the hosting loop to end the invocation and wait for the
/// orchestrator to re-invoke; nothing is left parked on an unresolved future.
#[derive(Debug)]
pub enum StepOutcome<T> {
    Continue(T),
    Suspend(SuspendReason),
    Fail(DurableError),
}

impl<T> StepOutcome<T> {
    /// Maps the outcome onto the `?`-friendly public API.
    pub fn into_result(self) -> DurableResult<T> {
        match self {
            Self::Continue(value) => Ok(value),
            Self::Suspend(reason) => {
                tracing::debug!(operation_id = %reason.operation_id(), ?reason, "suspending invocation");
                Err(DurableError::Suspend {
                    scheduled_timestamp: reason.resume_timestamp(),
                })
            }
            Self::Fail(error) => Err(error),
        }
    }

    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(StepOutcome::Continue(7).into_result().unwrap(), 7);

        let suspended: StepOutcome<()> = StepOutcome::Suspend(SuspendReason::WaitScheduled {
            operation_id: "w1".to_string(),
            scheduled_end_timestamp: Some(1_000),
        });
        match suspended.into_result() {
            Err(DurableError::Suspend {
                scheduled_timestamp,
            }) => assert_eq!(scheduled_timestamp, Some(1_000)),
            other => panic!("expected suspend, got {:?}", other),
        }

        let failed: StepOutcome<()> = StepOutcome::Fail(DurableError::execution("boom"));
        assert!(matches!(failed.into_result(), Err(DurableError::Execution { .. })));
    }
}
