//! Checkpoint tokens handed to invocations.
//!
//! A token is URL-safe base64 over a small JSON document naming the
//! execution and invocation it was issued to, plus a fresh nonce so every
//! checkpoint response carries a distinct token.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::TestError;

use super::types::{CheckpointToken, ExecutionId, InvocationId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointTokenData {
    pub execution_id: ExecutionId,
    pub token: String,
    pub invocation_id: InvocationId,
}

impl CheckpointTokenData {
    /// Issues token data with a fresh nonce.
    pub fn issue(execution_id: impl Into<String>, invocation_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            token: uuid::Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
        }
    }
}

pub fn encode_checkpoint_token(data: &CheckpointTokenData) -> Result<CheckpointToken, TestError> {
    let json = serde_json::to_string(data)?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

pub fn decode_checkpoint_token(token: &str) -> Result<CheckpointTokenData, TestError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| TestError::invalid_checkpoint_token(format!("base64 decode error: {}", e)))?;

    let json = String::from_utf8(bytes)
        .map_err(|e| TestError::invalid_checkpoint_token(format!("utf8 decode error: {}", e)))?;

    serde_json::from_str(&json)
        .map_err(|e| TestError::invalid_checkpoint_token(format!("json parse error: {}", e)))
}
