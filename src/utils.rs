use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn format_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Seconds remaining until `reset_ms`, rounded up. Never less than 1.
pub fn seconds_until(reset_ms: u64, now_ms: u64) -> u64 {
    let delta = reset_ms.saturating_sub(now_ms);
    ((delta + 999) / 1000).max(1)
}
