use serde::{Deserialize, Deserializer};
use std::time::Duration;

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// Milliseconds as advertised by the broker in the handshake reply.
pub(crate) fn millis_from_value(value: Option<&serde_json::Value>) -> Option<Duration> {
    value
        .and_then(serde_json::Value::as_u64)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
