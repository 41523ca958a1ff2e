//! The durable context handed to handler code.
//!
//! Operation IDs are derived deterministically from the parent context ID
//! and a per-context sequence number, so a replayed invocation that issues
//! the same primitives in the same order addresses the same operations.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blake2::{Blake2b512, Digest};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::{CallbackConfig, ChildContextConfig, StepConfig};
use crate::error::{DurableError, DurableResult};
use crate::handlers::callback::{create_callback_handler, Callback};
use crate::handlers::child::child_context_handler;
use crate::handlers::step::{step_handler, StepContext};
use crate::handlers::wait::wait_handler;
use crate::state::ExecutionState;

/// Identifies one operation issued from a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIdentifier {
    pub operation_id: String,
    pub parent_id: Option<String>,
    pub name: Option<String>,
}

impl std::fmt::Display for OperationIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.operation_id, name),
            None => write!(f, "{}", self.operation_id),
        }
    }
}

/// Derives the operation ID for the `sequence`-th operation under `parent_id`.
pub fn derive_operation_id(parent_id: Option<&str>, sequence: u64) -> String {
    let mut hasher = Blake2b512::new();
    hasher.update(parent_id.unwrap_or("").as_bytes());
    hasher.update(sequence.to_le_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Context passed to durable handlers.
#[derive(Clone)]
pub struct DurableContext {
    state: Arc<ExecutionState>,
    parent_id: Option<String>,
    sequence: Arc<AtomicU64>,
}

impl DurableContext {
    /// Creates the root context for an invocation.
    pub fn new(state: Arc<ExecutionState>) -> Self {
        Self {
            state,
            parent_id: None,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn child(&self, parent_id: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            parent_id: Some(parent_id.into()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> &Arc<ExecutionState> {
        &self.state
    }

    /// The CONTEXT operation this context runs under, if any.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn durable_execution_arn(&self) -> &str {
        self.state.durable_execution_arn()
    }

    fn next_operation(&self, name: Option<&str>) -> OperationIdentifier {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        OperationIdentifier {
            operation_id: derive_operation_id(self.parent_id.as_deref(), sequence),
            parent_id: self.parent_id.clone(),
            name: name.map(str::to_string),
        }
    }

    /// Runs `func` as a checkpointed step.
    ///
    /// A step that already succeeded in a previous invocation returns its
    /// recorded result without running `func` again.
    pub async fn step<T, F>(&self, func: F, config: Option<StepConfig>) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(StepContext) -> Result<T, DurableError> + Send,
    {
        let op_id = self.next_operation(None);
        step_handler(func, &self.state, &op_id, &config.unwrap_or_default())
            .await
            .into_result()
    }

    /// Like [`DurableContext::step`] but records a name on the operation.
    pub async fn step_named<T, F>(
        &self,
        name: &str,
        func: F,
        config: Option<StepConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(StepContext) -> Result<T, DurableError> + Send,
    {
        let op_id = self.next_operation(Some(name));
        step_handler(func, &self.state, &op_id, &config.unwrap_or_default())
            .await
            .into_result()
    }

    /// Suspends the execution for `duration`.
    pub async fn wait(&self, duration: Duration, name: Option<&str>) -> DurableResult<()> {
        let op_id = self.next_operation(name);
        wait_handler(duration, &self.state, &op_id).await.into_result()
    }

    /// Creates a callback an external system can complete by its ID.
    pub async fn create_callback<T>(
        &self,
        name: Option<&str>,
        config: Option<CallbackConfig>,
    ) -> DurableResult<Callback<T>>
    where
        T: DeserializeOwned,
    {
        let op_id = self.next_operation(name);
        create_callback_handler(&self.state, &op_id, &config.unwrap_or_default()).await
    }

    /// Runs `func` inside a child CONTEXT operation.
    pub async fn run_in_child_context<T, F, Fut>(
        &self,
        name: Option<&str>,
        func: F,
        config: Option<ChildContextConfig>,
    ) -> DurableResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(DurableContext) -> Fut + Send,
        Fut: Future<Output = DurableResult<T>> + Send,
    {
        let op_id = self.next_operation(name);
        child_context_handler(self, func, &op_id, &config.unwrap_or_default()).await
    }
}

impl std::fmt::Debug for DurableContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableContext")
            .field("durable_execution_arn", &self.state.durable_execution_arn())
            .field("parent_id", &self.parent_id)
            .finish()
    }
}
