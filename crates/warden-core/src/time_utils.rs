/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `stamped_unix_ms` is at least `ttl_ms` behind `now_unix_ms`.
///
/// A zero TTL never goes stale.
pub fn is_stale_unix_ms(stamped_unix_ms: u64, ttl_ms: u64, now_unix_ms: u64) -> bool {
    ttl_ms > 0 && now_unix_ms.saturating_sub(stamped_unix_ms) >= ttl_ms
}
