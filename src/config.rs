//! Configuration types for durable execution operations.
//!
//! This module provides configuration structs for steps, callbacks and
//! child contexts, the retry strategies used by steps, and the process
//! environment configuration that points handler code at a checkpoint
//! endpoint.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DurableError;

/// Environment variable carrying the checkpoint endpoint.
pub const ENDPOINT_ENV_VAR: &str = "DURABLE_EXECUTION_ENDPOINT";

/// Environment variable flagging that the handler runs against a local checkpoint server.
pub const LOCAL_MODE_ENV_VAR: &str = "DURABLE_EXECUTION_LOCAL_MODE";

/// Outcome of consulting a retry strategy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made
    pub should_retry: bool,
    /// Delay before the next attempt
    pub delay_seconds: u64,
}

impl RetryDecision {
    /// Retry after the given delay.
    pub fn retry_after(delay_seconds: u64) -> Self {
        Self {
            should_retry: true,
            delay_seconds,
        }
    }

    /// Stop retrying.
    pub fn stop() -> Self {
        Self {
            should_retry: false,
            delay_seconds: 0,
        }
    }
}

/// Retry strategy trait for configuring step retry behavior.
pub trait RetryStrategy: Send + Sync {
    /// Decides whether to retry after `attempt` (1-based) failed with `error`.
    fn should_retry(&self, error: &DurableError, attempt: u32) -> RetryDecision;

    /// Clone the retry strategy into a boxed trait object.
    fn clone_box(&self) -> Box<dyn RetryStrategy>;
}

impl Clone for Box<dyn RetryStrategy> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Exponential backoff with a cap on the number of attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub backoff_rate: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_seconds: 5,
            max_delay_seconds: 300,
            backoff_rate: 2.0,
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, _error: &DurableError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::stop();
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = (self.initial_delay_seconds as f64) * self.backoff_rate.powi(exponent);
        RetryDecision::retry_after((delay.ceil() as u64).min(self.max_delay_seconds))
    }

    fn clone_box(&self) -> Box<dyn RetryStrategy> {
        Box::new(self.clone())
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn should_retry(&self, _error: &DurableError, _attempt: u32) -> RetryDecision {
        RetryDecision::stop()
    }

    fn clone_box(&self) -> Box<dyn RetryStrategy> {
        Box::new(*self)
    }
}

/// Retry strategy backed by a closure.
#[derive(Clone)]
pub struct RetryFn(Arc<dyn Fn(&DurableError, u32) -> RetryDecision + Send + Sync>);

impl RetryFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DurableError, u32) -> RetryDecision + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for RetryFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryFn")
    }
}

impl RetryStrategy for RetryFn {
    fn should_retry(&self, error: &DurableError, attempt: u32) -> RetryDecision {
        (self.0)(error, attempt)
    }

    fn clone_box(&self) -> Box<dyn RetryStrategy> {
        Box::new(self.clone())
    }
}

/// Execution semantics for step operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepSemantics {
    /// Checkpoint START before execution: at most once execution per retry.
    AtMostOncePerRetry,
    /// Checkpoint after execution: at least once execution per retry.
    #[default]
    AtLeastOncePerRetry,
}

/// Configuration for step operations.
#[derive(Clone, Default)]
pub struct StepConfig {
    /// Optional retry strategy for failed steps. No strategy means no retry.
    pub retry_strategy: Option<Box<dyn RetryStrategy>>,
    /// Execution semantics (at-most-once or at-least-once).
    pub step_semantics: StepSemantics,
}

impl StepConfig {
    pub fn with_retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.retry_strategy = Some(Box::new(strategy));
        self
    }

    pub fn with_semantics(mut self, semantics: StepSemantics) -> Self {
        self.step_semantics = semantics;
        self
    }
}

impl std::fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConfig")
            .field("retry_strategy", &self.retry_strategy.is_some())
            .field("step_semantics", &self.step_semantics)
            .finish()
    }
}

/// Configuration for callback operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackConfig {
    /// Overall timeout; no timer is armed when absent.
    pub timeout_seconds: Option<u64>,
    /// Heartbeat timeout; heartbeats are rejected when absent.
    pub heartbeat_timeout_seconds: Option<u64>,
}

/// Configuration for child contexts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildContextConfig {
    /// Whether the children of a completed context are returned on replay.
    pub replay_children: bool,
}

impl ChildContextConfig {
    pub fn with_replay_children() -> Self {
        Self {
            replay_children: true,
        }
    }
}

/// Process-level configuration telling handler code where to checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Endpoint of the checkpoint surface
    pub endpoint: Option<String>,
    /// True when running against a local checkpoint server
    pub local_mode: bool,
}

impl EnvironmentConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        let endpoint = std::env::var(ENDPOINT_ENV_VAR)
            .ok()
            .filter(|value| !value.is_empty());
        let local_mode = std::env::var(LOCAL_MODE_ENV_VAR)
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        Self {
            endpoint,
            local_mode,
        }
    }

    /// Publishes the configuration into the process environment.
    pub fn publish(&self) {
        match &self.endpoint {
            Some(endpoint) => std::env::set_var(ENDPOINT_ENV_VAR, endpoint),
            None => std::env::remove_var(ENDPOINT_ENV_VAR),
        }
        std::env::set_var(LOCAL_MODE_ENV_VAR, self.local_mode.to_string());
        tracing::debug!(endpoint = ?self.endpoint, local_mode = self.local_mode, "published environment config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let strategy = ExponentialBackoff {
            max_attempts: 4,
            initial_delay_seconds: 2,
            max_delay_seconds: 5,
            backoff_rate: 2.0,
        };
        let err = DurableError::user_code("x");
        assert_eq!(strategy.should_retry(&err, 1), RetryDecision::retry_after(2));
        assert_eq!(strategy.should_retry(&err, 2), RetryDecision::retry_after(4));
        assert_eq!(strategy.should_retry(&err, 3), RetryDecision::retry_after(5));
        assert_eq!(strategy.should_retry(&err, 4), RetryDecision::stop());
    }

    #[test]
    fn test_retry_fn() {
        let strategy = RetryFn::new(|_, attempt| {
            if attempt < 2 {
                RetryDecision::retry_after(5)
            } else {
                RetryDecision::stop()
            }
        });
        let boxed: Box<dyn RetryStrategy> = Box::new(strategy);
        let cloned = boxed.clone();
        let err = DurableError::user_code("x");
        assert!(cloned.should_retry(&err, 1).should_retry);
        assert!(!cloned.should_retry(&err, 2).should_retry);
    }

    #[test]
    fn test_no_retry() {
        assert!(!NoRetry.should_retry(&DurableError::user_code("x"), 1).should_retry);
    }

    #[test]
    fn test_environment_config_roundtrip() {
        let config = EnvironmentConfig {
            endpoint: Some("local://checkpoint-server".to_string()),
            local_mode: true,
        };
        config.publish();
        assert_eq!(EnvironmentConfig::from_env(), config);
    }
}
