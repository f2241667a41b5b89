use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Signed variant used by the wire envelope.
pub fn now_ms_i64() -> i64 {
    Utc::now().timestamp_millis()
}
