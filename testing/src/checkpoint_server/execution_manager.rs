//! Registry of every execution hosted by a checkpoint server.
//!
//! Each execution owns one [`CheckpointManager`]. Managers are handed out
//! as `Arc`s so a long poll never holds the registry while it waits.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use super::checkpoint_manager::CheckpointManager;
use super::checkpoint_token::{
    decode_checkpoint_token, encode_checkpoint_token, CheckpointTokenData,
};
use super::types::{ExecutionId, InvocationResult, StartDurableExecutionRequest};
use crate::error::TestError;

#[derive(Debug, Default)]
pub struct ExecutionManager {
    executions: HashMap<ExecutionId, Arc<CheckpointManager>>,
}

impl ExecutionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new execution with its EXECUTION operation and first invocation.
    pub fn start_execution(
        &mut self,
        request: StartDurableExecutionRequest,
    ) -> Result<InvocationResult, TestError> {
        let execution_id = Uuid::new_v4().to_string();
        let invocation_id = Uuid::new_v4().to_string();

        let manager = CheckpointManager::new(execution_id.clone());
        let execution = manager.initialize(request.payload, &invocation_id)?;
        let checkpoint_token =
            encode_checkpoint_token(&CheckpointTokenData::issue(&execution_id, &invocation_id))?;

        self.executions.insert(execution_id.clone(), manager);
        tracing::info!(execution_id = %execution_id, "Started durable execution");

        Ok(InvocationResult {
            execution_id,
            checkpoint_token,
            invocation_id,
            operations: vec![execution],
        })
    }

    /// Starts a further invocation of an existing execution.
    pub fn start_invocation(&self, execution_id: &str) -> Result<InvocationResult, TestError> {
        let manager = self.get(execution_id)?;
        let invocation_id = Uuid::new_v4().to_string();
        let operations = manager.start_invocation(&invocation_id)?;
        let checkpoint_token =
            encode_checkpoint_token(&CheckpointTokenData::issue(execution_id, &invocation_id))?;

        tracing::debug!(execution_id = %execution_id, invocation_id = %invocation_id, "Started invocation");
        Ok(InvocationResult {
            execution_id: execution_id.to_string(),
            checkpoint_token,
            invocation_id,
            operations,
        })
    }

    pub fn get(&self, execution_id: &str) -> Result<Arc<CheckpointManager>, TestError> {
        self.executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| TestError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Resolves the manager a checkpoint token was issued for.
    pub fn get_by_token(
        &self,
        checkpoint_token: &str,
    ) -> Result<(Arc<CheckpointManager>, CheckpointTokenData), TestError> {
        let data = decode_checkpoint_token(checkpoint_token)?;
        let manager = self.get(&data.execution_id)?;
        Ok((manager, data))
    }

    pub fn has_execution(&self, execution_id: &str) -> bool {
        self.executions.contains_key(execution_id)
    }

    pub fn execution_ids(&self) -> Vec<&ExecutionId> {
        self.executions.keys().collect()
    }

    /// Removes an execution and stops its callback timers.
    pub fn remove_execution(&mut self, execution_id: &str) -> Option<Arc<CheckpointManager>> {
        let manager = self.executions.remove(execution_id)?;
        manager.cleanup();
        Some(manager)
    }

    pub fn clear(&mut self) {
        for (_, manager) in self.executions.drain() {
            manager.cleanup();
        }
    }
}
