//! Typed view over a finished execution.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use durable_execution_sdk::{Operation, OperationStatus, OperationType};

use crate::checkpoint_server::TestExecutionResult;
use crate::error::TestError;
use crate::types::{ExecutionStatus, Invocation, TestResultError};

/// Outcome of a local test run.
///
/// ```ignore
/// let result: TestResult<String> = runner.run("order-1".to_string()).await?;
/// assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
/// assert_eq!(result.get_result()?, "shipped");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult<T> {
    execution_id: String,
    status: ExecutionStatus,
    result: Option<T>,
    error: Option<TestResultError>,
    operations: Vec<Operation>,
    invocations: Vec<Invocation>,
}

impl<T: DeserializeOwned> TestResult<T> {
    /// Builds a typed result, decoding the serialized handler output.
    pub fn from_execution(execution: TestExecutionResult) -> Result<Self, TestError> {
        let result = match (&execution.status, execution.result.as_deref()) {
            (ExecutionStatus::Succeeded, Some(raw)) => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        Ok(Self {
            execution_id: execution.execution_id,
            status: execution.status,
            result,
            error: execution.error,
            operations: execution.operations,
            invocations: execution.invocations,
        })
    }
}

impl<T> TestResult<T> {
    pub fn get_execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn get_status(&self) -> ExecutionStatus {
        self.status
    }

    /// The handler's return value. Fails unless the execution succeeded.
    pub fn get_result(&self) -> Result<&T, TestError> {
        match (&self.status, &self.result) {
            (ExecutionStatus::Succeeded, Some(result)) => Ok(result),
            (ExecutionStatus::Succeeded, None) => {
                Err(TestError::result_not_available("execution succeeded without a result"))
            }
            (status, _) => Err(TestError::result_not_available(format!(
                "execution status is {}",
                status
            ))),
        }
    }

    /// The execution error. Fails unless the execution failed.
    pub fn get_error(&self) -> Result<&TestResultError, TestError> {
        self.error.as_ref().ok_or_else(|| {
            TestError::result_not_available(format!("execution status is {}", self.status))
        })
    }

    /// Every operation, in the order it was first observed.
    pub fn get_operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get_operations_by_status(&self, status: OperationStatus) -> Vec<&Operation> {
        self.operations.iter().filter(|op| op.status == status).collect()
    }

    pub fn get_operations_by_type(&self, operation_type: OperationType) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.operation_type == operation_type)
            .collect()
    }

    pub fn get_invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}
