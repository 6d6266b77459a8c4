//! Timeout middleware
//!
//! Races the inner chain against a timer. On expiry the inner future is
//! dropped (the cooperative abort: pending semaphore waits and queue slots
//! unwind) and a `TimeoutError` carrying the ttl is returned. A ttl of zero
//! fails immediately without scheduling anything.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::def::TaskMiddleware;
use crate::errors::KernelError;

pub const TIMEOUT_ID: &str = "skein.timeout";

/// Parse a duration config value: integer milliseconds or a string like
/// "500ms", "30s", "5m", "1h" (bare numbers in strings mean seconds)
fn parse_ttl(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_millis),
        Value::String(s) => parse_duration(s),
        _ => None,
    }
}

/// Unit suffixes and their millisecond scale; "ms" listed first so it wins
/// over the bare "m" and "s" suffixes.
const DURATION_UNITS: [(&str, u64); 4] =
    [("ms", 1), ("s", 1_000), ("m", 60_000), ("h", 3_600_000)];

fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    let (digits, scale) = DURATION_UNITS
        .iter()
        .find_map(|(suffix, scale)| trimmed.strip_suffix(suffix).map(|rest| (rest, *scale)))
        // Unsuffixed strings count in seconds.
        .unwrap_or((trimmed, 1_000));

    let amount: u64 = digits.parse().ok()?;
    amount.checked_mul(scale).map(Duration::from_millis)
}

static TIMEOUT_MW: Lazy<TaskMiddleware> = Lazy::new(|| {
    TaskMiddleware::new(TIMEOUT_ID)
        .config_schema(json!({
            "type": "object",
            "properties": {
                "ttl": {"anyOf": [{"type": "integer", "minimum": 0}, {"type": "string"}]}
            },
            "required": ["ttl"],
            "additionalProperties": false
        }))
        .run(|exec, _api, cfg| async move {
            let ttl = cfg
                .get("ttl")
                .and_then(parse_ttl)
                .ok_or_else(|| anyhow::anyhow!("timeout middleware requires a ttl"))?;

            if ttl.is_zero() {
                return Err(anyhow::Error::new(KernelError::Timeout {
                    id: exec.task_id().clone(),
                    ttl,
                }));
            }

            match tokio::time::timeout(ttl, exec.next()).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(anyhow::Error::new(KernelError::Timeout {
                    id: exec.task_id().clone(),
                    ttl,
                })),
            }
        })
});

/// Deadline middleware: `.with(json!({"ttl": 5000}))` or `"ttl": "5s"`
pub fn timeout() -> &'static TaskMiddleware {
    &TIMEOUT_MW
}
