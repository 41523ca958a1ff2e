//! Callback ids and callback timers.
//!
//! Each pending callback owns up to two tokio timers: an overall timeout
//! and a heartbeat timeout. Either one firing reports a [`CallbackTimeout`]
//! to the sink the owning checkpoint manager installed, which completes the
//! callback as TIMED_OUT. Timers carry a generation so a timer that fired
//! just before being replaced or cleared is recognised as stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use durable_execution_sdk::{
    CallbackDetails, ErrorObject, OperationAction, OperationStatus, OperationType, OperationUpdate,
};

use crate::error::TestError;
use crate::indexed_operations::IndexedOperations;

use super::types::{CheckpointOperation, ExecutionId};

/// Fields encoded into an opaque callback id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackIdData {
    pub execution_id: ExecutionId,
    pub operation_id: String,
}

pub fn encode_callback_id(data: &CallbackIdData) -> Result<String, TestError> {
    let json = serde_json::to_string(data)?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

pub fn decode_callback_id(callback_id: &str) -> Result<CallbackIdData, TestError> {
    URL_SAFE_NO_PAD
        .decode(callback_id)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| TestError::InvalidCallbackId(callback_id.to_string()))
}

/// How a callback completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteCallbackStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl CompleteCallbackStatus {
    fn operation_status(self) -> OperationStatus {
        match self {
            Self::Succeeded => OperationStatus::Succeeded,
            Self::Failed => OperationStatus::Failed,
            Self::TimedOut => OperationStatus::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Heartbeat,
}

/// Reported by a timer that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTimeout {
    pub callback_id: String,
    pub kind: TimerKind,
    generation: u64,
}

impl CallbackTimeout {
    pub fn error(&self) -> ErrorObject {
        match self.kind {
            TimerKind::Timeout => ErrorObject::new("CallbackTimeout", "Callback timed out"),
            TimerKind::Heartbeat => {
                ErrorObject::new("CallbackTimeout", "Callback heartbeat timed out")
            }
        }
    }
}

/// Receives fired timers.
pub type TimeoutSink = Arc<dyn Fn(CallbackTimeout) + Send + Sync>;

#[derive(Debug)]
struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct CallbackEntry {
    operation_id: String,
    heartbeat_timeout: Option<Duration>,
    timeout_timer: Option<Timer>,
    heartbeat_timer: Option<Timer>,
}

impl CallbackEntry {
    fn clear_timers(&mut self) {
        if let Some(timer) = self.timeout_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.heartbeat_timer.take() {
            timer.cancel();
        }
    }
}

pub struct CallbackManager {
    execution_id: ExecutionId,
    callbacks: HashMap<String, CallbackEntry>,
    next_generation: u64,
    sink: TimeoutSink,
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("execution_id", &self.execution_id)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl CallbackManager {
    pub fn new(execution_id: impl Into<String>, sink: TimeoutSink) -> Self {
        Self {
            execution_id: execution_id.into(),
            callbacks: HashMap::new(),
            next_generation: 0,
            sink,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Registers a callback for `operation_id` and arms the timers whose
    /// durations are given.
    pub fn create_callback(
        &mut self,
        operation_id: &str,
        timeout_seconds: Option<u64>,
        heartbeat_timeout_seconds: Option<u64>,
    ) -> Result<String, TestError> {
        let callback_id = encode_callback_id(&CallbackIdData {
            execution_id: self.execution_id.clone(),
            operation_id: operation_id.to_string(),
        })?;

        let timeout_timer = match timeout_seconds {
            Some(secs) => Some(self.arm(&callback_id, TimerKind::Timeout, Duration::from_secs(secs))?),
            None => None,
        };
        let heartbeat_timeout = heartbeat_timeout_seconds.map(Duration::from_secs);
        let heartbeat_timer = match heartbeat_timeout {
            Some(duration) => Some(self.arm(&callback_id, TimerKind::Heartbeat, duration)?),
            None => None,
        };

        tracing::debug!(
            callback_id = %callback_id,
            operation_id = %operation_id,
            ?timeout_seconds,
            ?heartbeat_timeout_seconds,
            "Created callback"
        );

        if let Some(mut previous) = self.callbacks.insert(
            callback_id.clone(),
            CallbackEntry {
                operation_id: operation_id.to_string(),
                heartbeat_timeout,
                timeout_timer,
                heartbeat_timer,
            },
        ) {
            previous.clear_timers();
        }
        Ok(callback_id)
    }

    /// Completes the callback's operation in `registry` and clears its timers.
    ///
    /// The mapping is removed, so completing the same callback again fails
    /// with [`TestError::OperationNotFound`].
    pub fn complete_callback(
        &mut self,
        callback_id: &str,
        status: CompleteCallbackStatus,
        result: Option<String>,
        error: Option<ErrorObject>,
        registry: &mut IndexedOperations,
    ) -> Result<CheckpointOperation, TestError> {
        let data = self.resolve(callback_id)?;
        let mut entry = self
            .callbacks
            .remove(callback_id)
            .ok_or_else(|| TestError::operation_not_found(&data.operation_id))?;
        entry.clear_timers();

        let stored = registry
            .get(&entry.operation_id)
            .ok_or_else(|| TestError::operation_not_found(&entry.operation_id))?;

        let mut operation = stored.operation.clone();
        operation.status = status.operation_status();
        operation.end_timestamp = Some(chrono::Utc::now().timestamp_millis());
        let details = operation.callback_details.get_or_insert_with(CallbackDetails::default);
        match status {
            CompleteCallbackStatus::Succeeded => details.result = result.clone(),
            CompleteCallbackStatus::Failed | CompleteCallbackStatus::TimedOut => {
                details.error = error.clone()
            }
        }

        let action = match status {
            CompleteCallbackStatus::Succeeded => OperationAction::Succeed,
            CompleteCallbackStatus::Failed | CompleteCallbackStatus::TimedOut => OperationAction::Fail,
        };
        let mut update = OperationUpdate::new(&operation.operation_id, OperationType::Callback, action)
            .with_optional_parent_id(operation.parent_id.clone())
            .with_optional_name(operation.name.clone());
        update.payload = result;
        update.error = error;

        let record = CheckpointOperation::new(operation, Some(update));
        registry.upsert(record.clone())?;

        tracing::debug!(callback_id = %callback_id, ?status, "Completed callback");
        Ok(record)
    }

    /// Re-arms the heartbeat timer with its original duration.
    pub fn heartbeat_callback(&mut self, callback_id: &str) -> Result<(), TestError> {
        let data = self.resolve(callback_id)?;
        let duration = {
            let entry = self
                .callbacks
                .get_mut(callback_id)
                .ok_or_else(|| TestError::operation_not_found(&data.operation_id))?;
            let Some(duration) = entry.heartbeat_timeout else {
                return Err(TestError::invalid_parameter(format!(
                    "Callback {} was created without a heartbeat timeout.",
                    callback_id
                )));
            };
            if let Some(timer) = entry.heartbeat_timer.take() {
                timer.cancel();
            }
            duration
        };

        let timer = self.arm(callback_id, TimerKind::Heartbeat, duration)?;
        if let Some(entry) = self.callbacks.get_mut(callback_id) {
            entry.heartbeat_timer = Some(timer);
        }
        tracing::trace!(callback_id = %callback_id, "Heartbeat received");
        Ok(())
    }

    /// Drops the callback and its timers without completing the operation.
    pub fn cancel_callback(&mut self, callback_id: &str) {
        if let Some(mut entry) = self.callbacks.remove(callback_id) {
            entry.clear_timers();
        }
    }

    /// Returns true if `fired` belongs to a timer that is still armed.
    pub fn is_current(&self, fired: &CallbackTimeout) -> bool {
        let Some(entry) = self.callbacks.get(&fired.callback_id) else {
            return false;
        };
        let timer = match fired.kind {
            TimerKind::Timeout => entry.timeout_timer.as_ref(),
            TimerKind::Heartbeat => entry.heartbeat_timer.as_ref(),
        };
        timer.map_or(false, |t| t.generation == fired.generation)
    }

    pub fn has_callback(&self, callback_id: &str) -> bool {
        self.callbacks.contains_key(callback_id)
    }

    pub fn pending_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Clears every outstanding timer.
    pub fn cleanup(&mut self) {
        for (_, mut entry) in self.callbacks.drain() {
            entry.clear_timers();
        }
    }

    fn resolve(&self, callback_id: &str) -> Result<CallbackIdData, TestError> {
        let data = decode_callback_id(callback_id)?;
        if data.execution_id != self.execution_id {
            return Err(TestError::CallbackNotFound(callback_id.to_string()));
        }
        Ok(data)
    }

    fn arm(&mut self, callback_id: &str, kind: TimerKind, duration: Duration) -> Result<Timer, TestError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            TestError::checkpoint_server_error(format!("callback timers need a tokio runtime: {}", e))
        })?;
        self.next_generation += 1;
        let fired = CallbackTimeout {
            callback_id: callback_id.to_string(),
            kind,
            generation: self.next_generation,
        };
        let sink = Arc::clone(&self.sink);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            sink(fired);
        });
        Ok(Timer {
            generation: self.next_generation,
            handle,
        })
    }
}

impl Drop for CallbackManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
