use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

/// Milliseconds since UNIX epoch.
pub type EpochMs = i64;

pub fn now_ms() -> EpochMs {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as i64
}

/// Generates a new ULID.
pub fn new_ulid() -> Ulid {
    Ulid::new()
}

/// Lowercase ULID, usable as a DNS-1123 label suffix for cluster object names.
pub fn new_run_id() -> String {
    new_ulid().to_string().to_lowercase()
}
