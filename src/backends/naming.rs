use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// Maps a logical container, topic, subscription or entity id onto a name
/// that is safe as a single path segment on every filesystem.
///
/// Bytes in `[A-Za-z0-9_-]` pass through; every other byte is written as
/// `%XX`. The mapping is injective, so distinct names never collide.
pub fn physical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Timestamp for a write, never earlier than the entity's previous one.
pub fn persisted_now(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if previous > now => previous,
        _ => now,
    }
}

pub fn ensure_active(cancel: &CancellationToken) -> StoreResult<()> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}
