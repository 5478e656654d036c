use serde_json::Value;

use crate::modules::duration::parse_duration_ms;

// Pull the retry hint out of a structured 429 body. Recognized shapes, both
// under error.details[]:
//   { "@type": ".../RetryInfo", "retryDelay": "2.5s" }
//   { "metadata": { "quotaResetDelay": "1h16m0.667923083s" } }
// Anything unparseable means "no hint".
pub fn parse_retry_delay_ms(body: &str) -> Option<i64> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let json: Value = serde_json::from_str(trimmed).ok()?;
    let details = json.get("error")?.get("details")?.as_array()?;

    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.contains("RetryInfo"));
        if is_retry_info {
            if let Some(ms) = detail
                .get("retryDelay")
                .and_then(|d| d.as_str())
                .and_then(parse_duration_ms)
            {
                return Some(ms);
            }
        }
        if let Some(ms) = detail
            .get("metadata")
            .and_then(|m| m.get("quotaResetDelay"))
            .and_then(|d| d.as_str())
            .and_then(parse_duration_ms)
        {
            return Some(ms);
        }
    }
    None
}
