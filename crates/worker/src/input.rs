//! Reading a job request from its JSON form.

use avagen_core::request::JobRequest;
use serde_json::Value;

/// Parse a job, accepting both `{"input": {...}}` envelopes and bare
/// request objects.
pub fn parse_job(text: &str) -> Result<JobRequest, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let body = match value {
        Value::Object(mut map) if map.get("input").is_some_and(Value::is_object) => {
            map.remove("input").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(body)
}
