use crate::types::Node;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub fn time_now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Expiration timestamp for an outbound discovery message.
pub fn get_expiration(seconds: u64) -> u64 {
    time_now_unix() + seconds
}

pub fn is_expired(expiration: u64) -> bool {
    expiration < time_now_unix()
}

/// Constant-time comparison for MAC tags.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

pub(crate) fn log_peer_debug(node: &Node, text: &str) {
    debug!("[{0}]: {1}", node, text)
}

pub(crate) fn log_peer_warn(node: &Node, text: &str) {
    warn!("[{0}]: {1}", node, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expirations_use_the_wall_clock() {
        assert!(!is_expired(get_expiration(60)));
        assert!(is_expired(1));
    }

    #[test]
    fn constant_time_eq_matches_slices() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
