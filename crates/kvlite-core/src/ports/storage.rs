//! Storage trait for cache backends

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of `(key, raw payload)` pairs produced by [`CacheStore::iter`]
pub type EntryStream<'a> = BoxStream<'a, Result<(String, Option<String>)>>;

/// Expiring key-value store.
///
/// Keys are fully namespaced (`"<ns>:<key>"`); payloads are opaque text that
/// the store never inspects. A `None` payload is stored as an explicit null.
///
/// TTLs are in seconds. Anything other than a finite positive number means
/// the entry never expires.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Payload for `key`, or `None` if it is missing or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Payloads for `keys`, in the same order
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Insert or replace `key`, returning the stored payload
    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl_seconds: Option<f64>,
    ) -> Result<Option<String>>;

    /// Remove `key`; true if a row was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove all `keys`; true only if every key existed
    async fn delete_many(&self, keys: &[String]) -> Result<bool>;

    /// Remove every key under `namespace`, or everything when `None`
    async fn clear(&self, namespace: Option<&str>) -> Result<()>;

    /// Whether a live entry exists for `key`
    async fn has(&self, key: &str) -> Result<bool>;

    /// Live entries under `namespace`, in insertion order
    fn iter<'a>(&'a self, namespace: Option<&'a str>) -> EntryStream<'a>;

    /// Release the backend; later calls fail with `CacheError::Closed`
    async fn disconnect(&self) -> Result<()>;
}
