//! Client-side mirror of an execution's operations.
//!
//! The orchestrator feeds every polled batch into [`OperationStorage`];
//! operation handles read from it and wait on it. A revision counter in a
//! `tokio::sync::watch` channel wakes waiters whenever a batch lands or the
//! execution finishes.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use durable_execution_sdk::{Operation, OperationType};

use crate::checkpoint_server::CheckpointOperation;
use crate::error::TestError;
use crate::indexed_operations::IndexedOperations;
use crate::types::WaitingOperationStatus;

/// How an operation handle finds its operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKey {
    ById(String),
    /// The `index`-th operation carrying `name`
    ByName { name: String, index: usize },
    /// Position in arrival order; index 0 is the EXECUTION operation
    ByIndex(usize),
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ById(id) => write!(f, "id={}", id),
            Self::ByName { name, index } => write!(f, "name={}[{}]", name, index),
            Self::ByIndex(index) => write!(f, "index={}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Revision {
    seq: u64,
    finished: bool,
}

#[derive(Debug)]
pub struct OperationStorage {
    operations: Mutex<IndexedOperations>,
    revision: watch::Sender<Revision>,
}

impl Default for OperationStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStorage {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(Revision::default());
        Self {
            operations: Mutex::new(IndexedOperations::new()),
            revision,
        }
    }

    /// Forgets everything for a new execution.
    pub fn reset(&self) {
        *self.lock() = IndexedOperations::new();
        self.revision.send_modify(|r| {
            r.seq += 1;
            r.finished = false;
        });
    }

    /// Seeds storage with the operations an execution started with.
    pub fn populate(&self, operations: Vec<Operation>) -> Result<(), TestError> {
        let records: Vec<CheckpointOperation> = operations
            .into_iter()
            .map(|op| CheckpointOperation::new(op, None))
            .collect();
        self.apply(&records)
    }

    /// Applies a delivered batch and wakes waiters.
    pub fn apply(&self, records: &[CheckpointOperation]) -> Result<(), TestError> {
        let result = {
            let mut operations = self.lock();
            records
                .iter()
                .try_for_each(|record| operations.upsert(record.clone()))
        };
        self.revision.send_modify(|r| r.seq += 1);
        result
    }

    /// Marks the execution finished; pending waiters give up.
    pub fn mark_finished(&self) {
        self.revision.send_modify(|r| {
            r.seq += 1;
            r.finished = true;
        });
    }

    pub fn is_finished(&self) -> bool {
        self.revision.borrow().finished
    }

    pub fn get(&self, key: &OperationKey) -> Option<Operation> {
        let operations = self.lock();
        let record = match key {
            OperationKey::ById(id) => operations.get(id),
            OperationKey::ByName { name, index } => operations.get_by_name(name, *index),
            OperationKey::ByIndex(index) => operations.get_by_index(*index),
        };
        record.map(|r| r.operation.clone())
    }

    /// Every operation in arrival order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations()
    }

    /// Direct children of `parent_id`.
    pub fn children(&self, parent_id: &str) -> Vec<Operation> {
        self.lock()
            .children(parent_id)
            .into_iter()
            .map(|r| r.operation.clone())
            .collect()
    }

    /// Waits until the operation behind `key` reaches `status`.
    ///
    /// Fails with [`TestError::ExecutionCompletedEarly`] if the execution
    /// finishes first.
    pub async fn wait_for(
        &self,
        key: &OperationKey,
        status: WaitingOperationStatus,
    ) -> Result<Operation, TestError> {
        let mut rx = self.revision.subscribe();
        loop {
            let revision = *rx.borrow_and_update();
            if let Some(operation) = self.get(key) {
                if reached(&operation, status) {
                    return Ok(operation);
                }
            }
            if revision.finished || rx.changed().await.is_err() {
                return Err(TestError::ExecutionCompletedEarly(key.to_string(), status));
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexedOperations> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn reached(operation: &Operation, status: WaitingOperationStatus) -> bool {
    match status {
        WaitingOperationStatus::Started => true,
        WaitingOperationStatus::Submitted => {
            operation.operation_type != OperationType::Callback
                || operation
                    .callback_details
                    .as_ref()
                    .is_some_and(|d| d.callback_id.is_some())
        }
        WaitingOperationStatus::Completed => operation.is_completed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use durable_execution_sdk::OperationStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(op: Operation) -> CheckpointOperation {
        CheckpointOperation::new(op, None)
    }

    #[test]
    fn test_lookup_keys() {
        let storage = OperationStorage::new();
        storage
            .populate(vec![
                Operation::new("exec", OperationType::Execution),
                Operation::new("s1", OperationType::Step).with_name("charge"),
            ])
            .unwrap();

        let by_name = OperationKey::ByName {
            name: "charge".into(),
            index: 0,
        };
        assert_eq!(storage.get(&by_name).unwrap().operation_id, "s1");
        assert_eq!(
            storage.get(&OperationKey::ByIndex(0)).unwrap().operation_type,
            OperationType::Execution
        );
        assert!(storage.get(&OperationKey::ById("nope".into())).is_none());
        assert_eq!(by_name.to_string(), "name=charge[0]");
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let storage = Arc::new(OperationStorage::new());
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .wait_for(&OperationKey::ById("s1".into()), WaitingOperationStatus::Completed)
                    .await
            })
        };

        storage
            .apply(&[record(Operation::new("s1", OperationType::Step))])
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        storage
            .apply(&[record(
                Operation::new("s1", OperationType::Step).with_status(OperationStatus::Succeeded),
            )])
            .unwrap();
        let op = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_fails_when_execution_finishes() {
        let storage = Arc::new(OperationStorage::new());
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .wait_for(&OperationKey::ById("never".into()), WaitingOperationStatus::Started)
                    .await
            })
        };
        tokio::task::yield_now().await;
        storage.mark_finished();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TestError::ExecutionCompletedEarly(_, WaitingOperationStatus::Started)));
    }

    #[test]
    fn test_submitted_requires_callback_id() {
        let mut callback = Operation::new("cb", OperationType::Callback);
        assert!(!reached(&callback, WaitingOperationStatus::Submitted));
        callback.callback_details = Some(durable_execution_sdk::CallbackDetails {
            callback_id: Some("id".into()),
            ..Default::default()
        });
        assert!(reached(&callback, WaitingOperationStatus::Submitted));
        assert!(reached(
            &Operation::new("s1", OperationType::Step),
            WaitingOperationStatus::Submitted
        ));
    }

    #[test]
    fn test_reset_clears() {
        let storage = OperationStorage::new();
        storage
            .populate(vec![Operation::new("exec", OperationType::Execution)])
            .unwrap();
        storage.mark_finished();
        storage.reset();
        assert!(storage.operations().is_empty());
        assert!(!storage.is_finished());
    }
}
