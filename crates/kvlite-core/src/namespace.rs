//! Namespaced cache layer
//!
//! [`Namespaced`] is the structured side of the payload boundary: it
//! serializes values with serde_json before handing text to a
//! [`CacheStore`], and prefixes every key with `"<namespace>:"`. Stores below
//! it never encode anything themselves.

use crate::error::Result;
use crate::ports::CacheStore;
use futures::stream::{BoxStream, StreamExt};
use kvlite_types::{namespace_prefix, ttl_seconds};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A view of a store restricted to one namespace
pub struct Namespaced<S: CacheStore + ?Sized> {
    store: Arc<S>,
    namespace: Option<String>,
    prefix: String,
}

impl<S: CacheStore + ?Sized> Clone for Namespaced<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: CacheStore + ?Sized> Namespaced<S> {
    /// View over the global keyspace (no prefix)
    pub fn global(store: Arc<S>) -> Self {
        Self {
            store,
            namespace: None,
            prefix: String::new(),
        }
    }

    /// View over keys prefixed with `"<namespace>:"`
    pub fn new(store: Arc<S>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let prefix = namespace_prefix(Some(&namespace));
        Self {
            store,
            namespace: Some(namespace),
            prefix,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.full_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<Vec<Option<T>>> {
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.store
            .get_many(&full_keys)
            .await?
            .into_iter()
            .map(|raw| match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            })
            .collect()
    }

    /// Store `value` as JSON; `ttl` of `None` or zero never expires
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store
            .set(&self.full_key(key), Some(&raw), ttl.map(ttl_seconds))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(&self.full_key(key)).await
    }

    pub async fn delete_many(&self, keys: &[&str]) -> Result<bool> {
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.store.delete_many(&full_keys).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.store.has(&self.full_key(key)).await
    }

    /// Remove every entry in this namespace (the whole store for a global view)
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(self.namespace.as_deref()).await
    }

    /// Live entries in this namespace with the prefix stripped from keys.
    /// Entries stored without a value come back as `None`, as from [`get`].
    ///
    /// [`get`]: Namespaced::get
    pub fn entries<T: DeserializeOwned + Send + 'static>(
        &self,
    ) -> BoxStream<'_, Result<(String, Option<T>)>> {
        let prefix_len = self.prefix.len();
        self.store
            .iter(self.namespace.as_deref())
            .map(move |item| {
                let (key, raw) = item?;
                let key = key[prefix_len..].to_string();
                let value = match raw {
                    Some(raw) => Some(serde_json::from_str(&raw)?),
                    None => None,
                };
                Ok((key, value))
            })
            .boxed()
    }
}
