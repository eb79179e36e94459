//! Store configuration
//!
//! Settings can be built in code or loaded from an optional config file
//! layered under `KVLITE_*` environment variables.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Sentinel uri for a non-durable, in-memory database
pub const MEMORY_URI: &str = ":memory:";

/// Default table name
pub const DEFAULT_TABLE: &str = "caches";

/// Default busy timeout for writers blocked by another connection
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Default number of rows fetched per iteration page
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Environment variable prefix for [`StoreConfig::load`]
pub const ENV_PREFIX: &str = "KVLITE";

/// Configuration for one store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file path, or `:memory:`
    pub uri: String,
    /// Table holding the cache rows
    pub table: String,
    /// Use write-ahead logging (file databases only)
    pub wal_mode: bool,
    /// How long a blocked writer waits for a lock
    pub busy_timeout_ms: u64,
    /// Rows fetched per page while iterating
    pub iteration_page_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: MEMORY_URI.to_string(),
            table: DEFAULT_TABLE.to_string(),
            wal_mode: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            iteration_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl StoreConfig {
    /// In-memory store with default settings
    pub fn memory() -> Self {
        Self::default()
    }

    /// File-backed store with default settings
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            uri: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    pub fn with_iteration_page_size(mut self, page_size: u32) -> Self {
        self.iteration_page_size = page_size;
        self
    }

    /// Whether this config points at an in-memory database
    pub fn is_memory(&self) -> bool {
        self.uri == MEMORY_URI
    }

    /// Load settings from an optional file, overridden by `KVLITE_*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`StoreConfig::load`], reading variables from `env` instead of the
    /// process environment when given
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            tracing::debug!("Loading store config from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        let settings: StoreConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check settings that would otherwise fail deep inside the engine
    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(CacheError::InvalidConfig("uri must not be empty".to_string()));
        }

        // The table name is interpolated into DDL, so it must be a bare identifier
        let ident = regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        if !ident.is_match(&self.table) {
            return Err(CacheError::InvalidConfig(format!(
                "table name must be a SQL identifier: {:?}",
                self.table
            )));
        }

        if self.iteration_page_size == 0 {
            return Err(CacheError::InvalidConfig(
                "iteration_page_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.uri, ":memory:");
        assert_eq!(config.table, "caches");
        assert!(config.wal_mode);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.iteration_page_size, 10);
        assert!(config.is_memory());
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_builder_setters() {
        let config = StoreConfig::file("/tmp/cache.sqlite")
            .with_table("sessions")
            .with_wal_mode(false)
            .with_busy_timeout_ms(250)
            .with_iteration_page_size(3);

        assert_eq!(config.uri, "/tmp/cache.sqlite");
        assert_eq!(config.table, "sessions");
        assert!(!config.wal_mode);
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.iteration_page_size, 3);
        assert!(!config.is_memory());
    }

    #[test]
    fn test_validate_rejects_bad_table_names() {
        for table in ["", "1caches", "caches; DROP TABLE x", "my-table", "a b"] {
            let config = StoreConfig::memory().with_table(table);
            assert!(
                matches!(config.validate(), Err(CacheError::InvalidConfig(_))),
                "table {:?} should be rejected",
                table
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let config = StoreConfig::memory().with_iteration_page_size(0);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvlite.toml");
        std::fs::write(
            &path,
            r#"
uri = "/var/lib/app/cache.db"
table = "file_table"
wal_mode = false
"#,
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("KVLITE_TABLE".to_string(), "env_table".to_string());
        env.insert("KVLITE_BUSY_TIMEOUT_MS".to_string(), "1200".to_string());

        let config = tokio_test::assert_ok!(StoreConfig::load_with_env(Some(&path), Some(env)));
        assert_eq!(config.uri, "/var/lib/app/cache.db");
        assert_eq!(config.table, "env_table");
        assert!(!config.wal_mode);
        assert_eq!(config.busy_timeout_ms, 1200);
        assert_eq!(config.iteration_page_size, 10);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut env = HashMap::new();
        env.insert("KVLITE_TABLE".to_string(), "bad name".to_string());

        let result = StoreConfig::load_with_env(None, Some(env));
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = StoreConfig::load_with_env(
            Some(Path::new("/definitely/not/here/kvlite.toml")),
            Some(HashMap::new()),
        );
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
