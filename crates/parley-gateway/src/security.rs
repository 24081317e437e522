use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use axum::http::HeaderValue;
use sha2::{Digest, Sha256};

#[derive(Clone, Copy)]
struct RateEntry {
    count: u32,
    window_start: Instant,
}

/// Counts events per key inside fixed windows; used to throttle relay
/// authentication attempts per source address.
pub struct FixedWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    max_keys: usize,
    entries: Mutex<HashMap<String, RateEntry>>,
}

impl FixedWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            max_requests,
            window,
            max_keys,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = match self.entries.lock() {
            Ok(v) => v,
            Err(_) => return false,
        };

        if guard.len() > self.max_keys {
            guard.retain(|_, entry| now.duration_since(entry.window_start) < self.window);
            if guard.len() > self.max_keys {
                return false;
            }
        }

        let entry = guard.entry(key.to_string()).or_insert(RateEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.count <= self.max_requests
    }
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Access tokens are opaque base64url strings; anything else is rejected
/// before it reaches the database.
pub fn is_valid_access_token(token: &str) -> bool {
    let len = token.len();
    (16..=512).contains(&len)
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '='))
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub fn cors_origin_values(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .map(|origin| normalize_origin(origin))
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(&origin).ok())
        .collect()
}
