//! Utility functions for zooweeper

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header carrying the address of the node that sent a message
pub const SENDER_HEADER: &str = "X-Sender-Address";

/// Header set on a write that a follower already forwarded once
pub const FORWARDED_HEADER: &str = "X-Forwarded-By";

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// True for a bare port number such as `8080`
pub fn is_port(address: &str) -> bool {
    !address.is_empty() && address.bytes().all(|b| b.is_ascii_digit())
}

/// Bully ranking between two node addresses.
///
/// Two numeric addresses compare as numbers, anything else falls back to
/// lexicographic order.
pub fn compare_addresses(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Strict majority of an ensemble of `ensemble_size` members
pub fn quorum(ensemble_size: usize) -> usize {
    ensemble_size / 2 + 1
}

/// Extract the sender address from request headers
pub fn sender_of(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(SENDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
