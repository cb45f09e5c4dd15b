// Relay - at-least-once delivery of cross-service calls
//
// Each call runs under a timeout. Transient failures (storage faults and
// timeouts) are retried up to `max_retries` times with a fixed delay; every
// other error is returned on the first attempt. Callees must be idempotent.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// RELAY CONFIG
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum number of retry attempts after the first
    pub max_retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Timeout for a single attempt in milliseconds
    pub timeout_ms: u64,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
            timeout_ms: 5_000,
        }
    }
}

// ============================================================================
// RELAY ERROR
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{operation} timed out after {attempts} attempt(s)")]
    Timeout { operation: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// RELAY
// ============================================================================

/// Run `call` until it succeeds, fails permanently, or retries run out
pub async fn relay<T, E, F, Fut>(config: &RelayConfig, operation: &str, mut call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ServiceError + From<RelayError>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match tokio::time::timeout(config.timeout(), call()).await {
            Ok(Ok(value)) => {
                if attempts > 1 {
                    tracing::info!(operation, attempts, "relayed call succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) => {
                if !err.kind().is_transient() || attempts > config.max_retries {
                    return Err(err);
                }
                tracing::warn!(operation, attempts, error = %err, "transient failure, retrying");
            }
            Err(_) => {
                if attempts > config.max_retries {
                    return Err(E::from(RelayError::Timeout {
                        operation: operation.to_string(),
                        attempts,
                    }));
                }
                tracing::warn!(operation, attempts, "call timed out, retrying");
            }
        }

        if config.retry_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
        }
    }
}
