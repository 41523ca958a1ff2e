//! Lazy handles onto operations of a running or finished execution.
//!
//! An [`OperationHandle`] is created before the operation exists: it holds
//! an [`OperationKey`] and resolves it against the orchestrator's
//! [`OperationStorage`] every time it is read. That lets a test grab a
//! handle, start the run, and then wait for the operation to appear.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use durable_execution_sdk::{ErrorObject, Operation, OperationStatus, OperationType};

use crate::checkpoint_server::CallbackSender;
use crate::error::TestError;
use crate::operation_storage::{OperationKey, OperationStorage};
use crate::types::{TestResultError, WaitingOperationStatus};

/// Step details with a typed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetails<T = serde_json::Value> {
    /// Attempt number, starting at 1 once a retry was recorded
    pub attempt: Option<u32>,
    pub next_attempt_timestamp: Option<DateTime<Utc>>,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitDetails {
    /// Whole seconds between start and scheduled end
    pub wait_seconds: Option<u64>,
    pub scheduled_end_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackDetails<T = serde_json::Value> {
    pub callback_id: Option<String>,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeDetails<T = serde_json::Value> {
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDetails<T = serde_json::Value> {
    pub replay_children: bool,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

fn parse_payload<T: DeserializeOwned>(payload: Option<&String>) -> Result<Option<T>, TestError> {
    payload
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(TestError::from)
}

fn to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn test_error(error: Option<&ErrorObject>) -> Option<TestResultError> {
    error.cloned().map(TestResultError::from)
}

/// A handle onto one operation, looked up by key on every read.
#[derive(Clone)]
pub struct OperationHandle {
    key: OperationKey,
    storage: Arc<OperationStorage>,
    callback_sender: Option<Arc<dyn CallbackSender>>,
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("key", &self.key)
            .field("callback_sender", &self.callback_sender.is_some())
            .finish()
    }
}

impl OperationHandle {
    pub fn new(key: OperationKey, storage: Arc<OperationStorage>) -> Self {
        Self {
            key,
            storage,
            callback_sender: None,
        }
    }

    pub fn with_callback_sender(mut self, sender: Arc<dyn CallbackSender>) -> Self {
        self.callback_sender = Some(sender);
        self
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Current snapshot of the operation, if it exists yet.
    pub fn try_get_operation(&self) -> Option<Operation> {
        self.storage.get(&self.key)
    }

    /// Current snapshot of the operation.
    pub fn get_operation_data(&self) -> Result<Operation, TestError> {
        self.try_get_operation()
            .ok_or_else(|| TestError::operation_not_found(self.key.to_string()))
    }

    pub fn get_id(&self) -> Result<String, TestError> {
        Ok(self.get_operation_data()?.operation_id)
    }

    pub fn get_type(&self) -> Result<OperationType, TestError> {
        Ok(self.get_operation_data()?.operation_type)
    }

    pub fn get_status(&self) -> Result<OperationStatus, TestError> {
        Ok(self.get_operation_data()?.status)
    }

    pub fn get_name(&self) -> Result<Option<String>, TestError> {
        Ok(self.get_operation_data()?.name)
    }

    pub fn get_parent_id(&self) -> Result<Option<String>, TestError> {
        Ok(self.get_operation_data()?.parent_id)
    }

    pub fn get_start_timestamp(&self) -> Result<Option<DateTime<Utc>>, TestError> {
        Ok(to_datetime(self.get_operation_data()?.start_timestamp))
    }

    pub fn get_end_timestamp(&self) -> Result<Option<DateTime<Utc>>, TestError> {
        Ok(to_datetime(self.get_operation_data()?.end_timestamp))
    }

    pub fn is_completed(&self) -> bool {
        self.try_get_operation().is_some_and(|op| op.is_completed())
    }

    /// Operations whose parent is this one.
    pub fn get_child_operations(&self) -> Result<Vec<OperationHandle>, TestError> {
        let id = self.get_id()?;
        Ok(self
            .storage
            .children(&id)
            .into_iter()
            .map(|child| OperationHandle {
                key: OperationKey::ById(child.operation_id),
                storage: Arc::clone(&self.storage),
                callback_sender: self.callback_sender.clone(),
            })
            .collect())
    }

    /// Waits until the operation reaches `status`.
    ///
    /// Fails if the execution finishes first.
    pub async fn wait_for_data(
        &self,
        status: WaitingOperationStatus,
    ) -> Result<Operation, TestError> {
        self.storage.wait_for(&self.key, status).await
    }

    fn expect_type(&self, expected: OperationType) -> Result<Operation, TestError> {
        let operation = self.get_operation_data()?;
        if operation.operation_type != expected {
            return Err(TestError::type_mismatch(expected, operation.operation_type));
        }
        Ok(operation)
    }

    pub fn get_step_details<T: DeserializeOwned>(&self) -> Result<StepDetails<T>, TestError> {
        let operation = self.expect_type(OperationType::Step)?;
        let details = operation.step_details.unwrap_or_default();
        Ok(StepDetails {
            attempt: details.attempt,
            next_attempt_timestamp: to_datetime(details.next_attempt_timestamp),
            result: parse_payload(details.result.as_ref())?,
            error: test_error(details.error.as_ref()),
        })
    }

    pub fn get_wait_details(&self) -> Result<WaitDetails, TestError> {
        let operation = self.expect_type(OperationType::Wait)?;
        let scheduled_end = operation
            .wait_details
            .as_ref()
            .and_then(|d| d.scheduled_end_timestamp);
        let wait_seconds = match (operation.start_timestamp, scheduled_end) {
            (Some(start), Some(end)) => Some((end.saturating_sub(start).max(0) / 1000) as u64),
            _ => None,
        };
        Ok(WaitDetails {
            wait_seconds,
            scheduled_end_timestamp: to_datetime(scheduled_end),
        })
    }

    pub fn get_callback_details<T: DeserializeOwned>(
        &self,
    ) -> Result<CallbackDetails<T>, TestError> {
        let operation = self.expect_type(OperationType::Callback)?;
        let details = operation.callback_details.unwrap_or_default();
        Ok(CallbackDetails {
            callback_id: details.callback_id,
            result: parse_payload(details.result.as_ref())?,
            error: test_error(details.error.as_ref()),
        })
    }

    pub fn get_invoke_details<T: DeserializeOwned>(&self) -> Result<InvokeDetails<T>, TestError> {
        let operation = self.expect_type(OperationType::Invoke)?;
        let details = operation.chained_invoke_details.unwrap_or_default();
        Ok(InvokeDetails {
            result: parse_payload(details.result.as_ref())?,
            error: test_error(details.error.as_ref()),
        })
    }

    pub fn get_context_details<T: DeserializeOwned>(&self) -> Result<ContextDetails<T>, TestError> {
        let operation = self.expect_type(OperationType::Context)?;
        let details = operation.context_details.unwrap_or_default();
        Ok(ContextDetails {
            replay_children: details.replay_children.unwrap_or(false),
            result: parse_payload(details.result.as_ref())?,
            error: test_error(details.error.as_ref()),
        })
    }

    /// Waits for the callback ID, then completes the callback successfully.
    pub async fn send_callback_success(&self, result: Option<&str>) -> Result<(), TestError> {
        let (sender, callback_id) = self.submitted_callback().await?;
        sender
            .send_success(&callback_id, result.map(str::to_string))
            .await
    }

    /// Waits for the callback ID, then fails the callback.
    pub async fn send_callback_failure(&self, error: Option<ErrorObject>) -> Result<(), TestError> {
        let (sender, callback_id) = self.submitted_callback().await?;
        sender.send_failure(&callback_id, error).await
    }

    /// Waits for the callback ID, then records a heartbeat.
    pub async fn send_callback_heartbeat(&self) -> Result<(), TestError> {
        let (sender, callback_id) = self.submitted_callback().await?;
        sender.send_heartbeat(&callback_id).await
    }

    async fn submitted_callback(&self) -> Result<(Arc<dyn CallbackSender>, String), TestError> {
        let operation = self.wait_for_data(WaitingOperationStatus::Submitted).await?;
        if operation.operation_type != OperationType::Callback {
            return Err(TestError::NotCallbackOperation);
        }
        let sender = self.callback_sender.clone().ok_or_else(|| {
            TestError::checkpoint_server_error("no callback sender attached to this operation")
        })?;
        let callback_id = operation
            .callback_details
            .and_then(|d| d.callback_id)
            .ok_or_else(|| TestError::result_not_available("callback ID not assigned"))?;
        Ok((sender, callback_id))
    }
}
