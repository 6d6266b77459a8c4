//! Retry middleware
//!
//! Re-runs the inner chain up to `attempts` extra times with a fixed or
//! exponentially backed-off delay. The last error is preserved when every
//! attempt fails.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::json;

use crate::def::TaskMiddleware;
use crate::errors::KernelError;

pub const RETRY_ID: &str = "skein.retry";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RetryConfig {
    /// Extra attempts after the first failure
    attempts: u32,
    delay_ms: u64,
    backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            delay_ms: 0,
            backoff_factor: 1.0,
        }
    }
}

static RETRY_MW: Lazy<TaskMiddleware> = Lazy::new(|| {
    TaskMiddleware::new(RETRY_ID)
        .config_schema(json!({
            "type": "object",
            "properties": {
                "attempts": {"type": "integer", "minimum": 0},
                "delay_ms": {"type": "integer", "minimum": 0},
                "backoff_factor": {"type": "number", "minimum": 1.0}
            },
            "additionalProperties": false
        }))
        .run(|exec, _api, cfg| async move {
            let config: RetryConfig = super::parse_config(&cfg)?;
            let mut delay = config.delay_ms as f64;
            let mut last: Option<KernelError> = None;

            for attempt in 0..=config.attempts {
                match exec.next().await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        tracing::debug!(
                            task = %exec.task_id(),
                            attempt,
                            error = %err,
                            "retry attempt failed"
                        );
                        last = Some(err);
                        if attempt < config.attempts && delay > 0.0 {
                            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                            delay *= config.backoff_factor;
                        }
                    }
                }
            }

            let err = last.unwrap_or_else(|| KernelError::runtime("retry exhausted"));
            Err(anyhow::Error::new(err))
        })
});

/// Bounded re-attempt middleware:
/// `.with(json!({"attempts": 2, "delay_ms": 100, "backoff_factor": 2.0}))`
pub fn retry() -> &'static TaskMiddleware {
    &RETRY_MW
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: RetryConfig = super::super::parse_config(&serde_json::Value::Null).unwrap();
        assert_eq!(config.attempts, 3);
        assert_eq!(config.delay_ms, 0);
        assert_eq!(config.backoff_factor, 1.0);
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let result: anyhow::Result<RetryConfig> =
            super::super::parse_config(&json!({"atempts": 2}));
        assert!(result.is_err());
    }

    #[test]
    fn retry_definition_shape() {
        let mw = retry();
        assert_eq!(mw.id().as_str(), RETRY_ID);
        assert!(mw.config_schema.is_some());
    }
}
