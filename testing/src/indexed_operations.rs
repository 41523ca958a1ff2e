//! Operation registry with lookups by id, name, parent and arrival order.
//!
//! Shared by the checkpoint server (its source of truth) and the
//! orchestrator (its mirror of delivered updates).

use std::collections::HashMap;

use durable_execution_sdk::Operation;

use crate::checkpoint_server::CheckpointOperation;
use crate::error::TestError;

#[derive(Debug, Clone, Default)]
pub struct IndexedOperations {
    entries: Vec<CheckpointOperation>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, Vec<usize>>,
    by_parent: HashMap<String, Vec<usize>>,
}

impl IndexedOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from records in arrival order.
    pub fn from_entries(
        entries: impl IntoIterator<Item = CheckpointOperation>,
    ) -> Result<Self, TestError> {
        let mut indexed = Self::new();
        for entry in entries {
            indexed.upsert(entry)?;
        }
        Ok(indexed)
    }

    /// Inserts a new record or replaces the existing one in place.
    ///
    /// A record keeps its position in arrival order across updates. An
    /// update that changes the parent of a known operation is rejected.
    pub fn upsert(&mut self, entry: CheckpointOperation) -> Result<(), TestError> {
        let id = entry.operation.operation_id.clone();
        match self.by_id.get(&id) {
            Some(&index) => {
                let existing = &mut self.entries[index];
                if existing.operation.parent_id != entry.operation.parent_id {
                    return Err(TestError::protocol_violation(format!(
                        "parent of operation {} changed from {:?} to {:?}",
                        id, existing.operation.parent_id, entry.operation.parent_id
                    )));
                }
                let old_name = existing.operation.name.clone();
                let new_name = entry.operation.name.clone();
                *existing = entry;
                if old_name != new_name {
                    if let Some(old) = old_name {
                        if let Some(positions) = self.by_name.get_mut(&old) {
                            positions.retain(|&p| p != index);
                        }
                    }
                    if let Some(new) = new_name {
                        let positions = self.by_name.entry(new).or_default();
                        let at = positions.partition_point(|&p| p < index);
                        positions.insert(at, index);
                    }
                }
            }
            None => {
                let index = self.entries.len();
                if let Some(name) = &entry.operation.name {
                    self.by_name.entry(name.clone()).or_default().push(index);
                }
                if let Some(parent) = &entry.operation.parent_id {
                    self.by_parent.entry(parent.clone()).or_default().push(index);
                }
                self.by_id.insert(id, index);
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.by_id.contains_key(operation_id)
    }

    pub fn get(&self, operation_id: &str) -> Option<&CheckpointOperation> {
        self.by_id.get(operation_id).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, operation_id: &str) -> Option<&mut CheckpointOperation> {
        match self.by_id.get(operation_id) {
            Some(&i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<&Operation> {
        self.get(operation_id).map(|entry| &entry.operation)
    }

    /// Returns the `index`-th operation carrying `name`, in arrival order.
    pub fn get_by_name(&self, name: &str, index: usize) -> Option<&CheckpointOperation> {
        self.by_name
            .get(name)
            .and_then(|positions| positions.get(index))
            .map(|&i| &self.entries[i])
    }

    /// Returns the operation at `index` in arrival order.
    pub fn get_by_index(&self, index: usize) -> Option<&CheckpointOperation> {
        self.entries.get(index)
    }

    /// Direct children of `parent_id`, in arrival order.
    pub fn children(&self, parent_id: &str) -> Vec<&CheckpointOperation> {
        self.by_parent
            .get(parent_id)
            .map(|positions| positions.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckpointOperation> {
        self.entries.iter()
    }

    /// Snapshot of every operation, in arrival order.
    pub fn operations(&self) -> Vec<Operation> {
        self.entries.iter().map(|e| e.operation.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
