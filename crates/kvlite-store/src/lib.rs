//! Storage backends
//!
//! Uses SQLite (embedded) for durable or `:memory:` stores.
//! Uses DashMap (in-memory) when no SQL engine is wanted.

pub mod db;
pub mod memory;

pub use db::SqliteStore;
pub use memory::MemoryStore;

pub use kvlite_core::{CacheError, CacheStore, Namespaced, Result, StoreConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    async fn exercise_namespaced<S: CacheStore>(store: Arc<S>) {
        let users = Namespaced::new(store.clone(), "users");
        let profile = Profile {
            name: "ada".to_string(),
            visits: 3,
        };

        users.set("1", &profile, None).await.unwrap();
        assert_eq!(users.get::<Profile>("1").await.unwrap(), Some(profile.clone()));

        // Stored once as JSON under the prefixed key
        assert_eq!(
            store.get("users:1").await.unwrap(),
            Some(r#"{"name":"ada","visits":3}"#.to_string())
        );

        users.set("2", &"plain", None).await.unwrap();
        let values: Vec<Option<serde_json::Value>> =
            users.get_many(&["2", "missing", "1"]).await.unwrap();
        assert_eq!(values[0], Some(serde_json::json!("plain")));
        assert_eq!(values[1], None);
        assert_eq!(values[2], Some(serde_json::json!({"name": "ada", "visits": 3})));

        assert!(users.has("2").await.unwrap());
        assert!(users.delete("2").await.unwrap());
        assert!(!users.has("2").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaced_over_memory_store() {
        exercise_namespaced(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_namespaced_over_sqlite_store() {
        let store = SqliteStore::open(&StoreConfig::memory()).await.unwrap();
        exercise_namespaced(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_namespaced_ttl() {
        let store = Arc::new(SqliteStore::open(&StoreConfig::memory()).await.unwrap());
        let sessions = Namespaced::new(store, "sessions");

        sessions
            .set("token", &42u64, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        sessions.set("forever", &1u64, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(sessions.get::<u64>("token").await.unwrap(), Some(42));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sessions.get::<u64>("token").await.unwrap(), None);
        assert_eq!(sessions.get::<u64>("forever").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_namespaced_entries_strip_prefix() {
        let store = Arc::new(MemoryStore::new());
        let ns = Namespaced::new(store.clone(), "ns");
        ns.set("a", &1, None).await.unwrap();
        ns.set("b", &2, None).await.unwrap();
        store.set("other:c", Some("3"), None).await.unwrap();

        let entries: Vec<(String, Option<i32>)> = ns.entries().try_collect().await.unwrap();
        assert_eq!(
            entries,
            vec![("a".to_string(), Some(1)), ("b".to_string(), Some(2))]
        );
    }

    #[tokio::test]
    async fn test_namespaced_entries_with_absent_value() {
        let store = Arc::new(SqliteStore::open(&StoreConfig::memory()).await.unwrap());
        store.set("ns:a", None, None).await.unwrap();
        store.set("ns:b", Some("7"), None).await.unwrap();

        let ns = Namespaced::new(store, "ns");
        assert_eq!(ns.get::<u32>("a").await.unwrap(), None);

        let entries: Vec<(String, Option<u32>)> = ns.entries().try_collect().await.unwrap();
        assert_eq!(
            entries,
            vec![("a".to_string(), None), ("b".to_string(), Some(7))]
        );
    }

    #[tokio::test]
    async fn test_namespace_isolation_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::file(dir.path().join("shared.sqlite"));

        let ns1 = Namespaced::new(Arc::new(SqliteStore::open(&config).await.unwrap()), "ns1");
        let ns2 = Namespaced::new(Arc::new(SqliteStore::open(&config).await.unwrap()), "ns2");

        for (key, value) in [("a", "x"), ("b", "y"), ("c", "z")] {
            ns1.set(key, &value, None).await.unwrap();
            ns2.set(key, &value, None).await.unwrap();
        }

        ns1.clear().await.unwrap();

        let gone: Vec<Option<String>> = ns1.get_many(&["a", "b", "c"]).await.unwrap();
        assert_eq!(gone, vec![None, None, None]);

        let kept: Vec<Option<String>> = ns2.get_many(&["a", "b", "c"]).await.unwrap();
        assert_eq!(
            kept,
            vec![
                Some("x".to_string()),
                Some("y".to_string()),
                Some("z".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_global_view_clears_everything() {
        let store = Arc::new(MemoryStore::new());
        let global = Namespaced::global(store.clone());
        let scoped = Namespaced::new(store.clone(), "ns");

        global.set("top", &true, None).await.unwrap();
        scoped.set("inner", &true, None).await.unwrap();
        assert_eq!(global.namespace(), None);

        global.clear().await.unwrap();
        assert!(!scoped.has("inner").await.unwrap());
        assert!(!global.has("top").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaced_works_through_trait_object() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let ns = Namespaced::new(store, "dyn");
        ns.set("k", &vec![1, 2, 3], None).await.unwrap();
        assert_eq!(ns.get::<Vec<i32>>("k").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
