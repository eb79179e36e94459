//! Cache entry types

use crate::ttl::{expiry_deadline, is_expired};
use serde::{Deserialize, Serialize};

/// One stored cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fully-namespaced key
    pub key: String,
    /// Opaque payload, `None` when an absent value was cached
    pub data: Option<String>,
    /// Write time (epoch ms)
    pub created_at: i64,
    /// Absolute deadline (epoch ms), `None` if it never expires
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    /// Build an entry written at `now` with an optional TTL in seconds
    pub fn new(
        key: impl Into<String>,
        data: Option<String>,
        ttl_seconds: Option<f64>,
        now: i64,
    ) -> Self {
        Self {
            key: key.into(),
            data,
            created_at: now,
            expires_at: expiry_deadline(now, ttl_seconds),
        }
    }

    /// Whether the entry is logically deleted at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        is_expired(self.expires_at, now)
    }
}

/// Key prefix for a namespace (`"<ns>:"`), empty for the global keyspace
pub fn namespace_prefix(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}:", ns),
        None => String::new(),
    }
}
