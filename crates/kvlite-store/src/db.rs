//! SQLite-backed expiring key-value store
//!
//! One table, one connection. Expired rows are filtered out on every read
//! and physically removed by a purge sweep that reads schedule in the
//! background.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kvlite_core::{
    namespace_prefix, now_millis, to_column, CacheEntry, CacheError, CacheStore, EntryStream,
    Result, StoreConfig,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Below this many keys `get_many` issues one point lookup per key
pub const BATCH_SELECT_THRESHOLD: usize = 2;

/// From this many keys on `delete_many` uses a single membership delete
pub const BATCH_DELETE_THRESHOLD: usize = 3;

/// SQL text for every statement the store runs, built once per table
struct Statements {
    select_one: String,
    select_many: String,
    upsert: String,
    delete_one: String,
    delete_many: String,
    clear_prefix: String,
    select_page: String,
    purge: String,
    count_live: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        // Prefix match via substr rather than LIKE: LIKE folds ASCII case and
        // treats `_` and `%` in namespaces as wildcards.
        Self {
            select_one: format!(
                "SELECT cacheKey, cacheData, createdAt, expiredAt FROM {table} WHERE cacheKey = ?1"
            ),
            select_many: format!(
                "SELECT cacheKey, cacheData, createdAt, expiredAt FROM {table} \
                 WHERE cacheKey IN (SELECT value FROM json_each(?1))"
            ),
            upsert: format!(
                "INSERT INTO {table} (cacheKey, cacheData, createdAt, expiredAt) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(cacheKey) DO UPDATE SET \
                 cacheData = excluded.cacheData, \
                 createdAt = excluded.createdAt, \
                 expiredAt = excluded.expiredAt"
            ),
            delete_one: format!("DELETE FROM {table} WHERE cacheKey = ?1"),
            delete_many: format!(
                "DELETE FROM {table} WHERE cacheKey IN (SELECT value FROM json_each(?1))"
            ),
            clear_prefix: format!(
                "DELETE FROM {table} WHERE substr(cacheKey, 1, length(?1)) = ?1"
            ),
            select_page: format!(
                "SELECT cacheKey, cacheData FROM {table} \
                 WHERE substr(cacheKey, 1, length(?1)) = ?1 \
                 AND (expiredAt = -1 OR expiredAt >= ?2) \
                 ORDER BY rowid LIMIT ?3 OFFSET ?4"
            ),
            purge: format!("DELETE FROM {table} WHERE expiredAt != -1 AND expiredAt < ?1"),
            count_live: format!(
                "SELECT COUNT(*) FROM {table} WHERE expiredAt = -1 OR expiredAt >= ?1"
            ),
        }
    }

    fn all(&self) -> [&str; 9] {
        [
            self.select_one.as_str(),
            self.select_many.as_str(),
            self.upsert.as_str(),
            self.delete_one.as_str(),
            self.delete_many.as_str(),
            self.clear_prefix.as_str(),
            self.select_page.as_str(),
            self.purge.as_str(),
            self.count_live.as_str(),
        ]
    }
}

/// Expiring key-value store over a single SQLite table
pub struct SqliteStore {
    pool: SqlitePool,
    sql: Arc<Statements>,
    table: String,
    page_size: u32,
    closed: AtomicBool,
    purge_pending: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Open the database, create the table and index, and prepare statements.
    ///
    /// Any failure here is fatal: no store is returned.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        info!("Opening cache store at {} (table {})", config.uri, config.table);

        let options = Self::connect_options(config)?;

        // A single connection serializes statements and keeps an in-memory
        // database alive for as long as the store is open.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::Initialization(format!("Failed to open {}: {}", config.uri, e))
            })?;

        Self::run_migrations(&pool, &config.table)
            .await
            .map_err(|e| CacheError::Initialization(format!("Failed to create schema: {}", e)))?;

        let sql = Statements::new(&config.table);
        Self::prepare_statements(&pool, &sql).await?;

        info!("Cache store ready");

        Ok(Self {
            pool,
            sql: Arc::new(sql),
            table: config.table.clone(),
            page_size: config.iteration_page_size,
            closed: AtomicBool::new(false),
            purge_pending: Arc::new(AtomicBool::new(false)),
        })
    }

    fn connect_options(config: &StoreConfig) -> Result<SqliteConnectOptions> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        if config.is_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| CacheError::Initialization(e.to_string()))?;
            return Ok(options
                .journal_mode(SqliteJournalMode::Memory)
                .busy_timeout(busy_timeout));
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.uri)
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        Ok(if config.wal_mode {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        } else {
            options.journal_mode(SqliteJournalMode::Delete)
        })
    }

    async fn run_migrations(pool: &SqlitePool, table: &str) -> sqlx::Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                cacheKey TEXT PRIMARY KEY,
                cacheData TEXT,
                createdAt INTEGER,
                expiredAt INTEGER
            )
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_expired_{table} ON {table}(expiredAt)"
        ))
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Prepare every statement once so they sit in the connection's
    /// statement cache, and so a broken statement fails the open.
    async fn prepare_statements(pool: &SqlitePool, sql: &Statements) -> Result<()> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| CacheError::Initialization(e.to_string()))?;

        for statement in sql.all() {
            (&mut *conn).prepare(statement).await.map_err(|e| {
                CacheError::Initialization(format!("Failed to prepare {:?}: {}", statement, e))
            })?;
        }

        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Payload for `key`, or `None` if it is missing or expired
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_entry(key).await?.and_then(|entry| entry.data))
    }

    /// Row for `key` unless it is missing or expired. Running into an
    /// expired row schedules a purge.
    async fn live_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.ensure_open()?;
        let now = now_millis();

        let row: Option<CacheRow> = sqlx::query_as(&self.sql.select_one)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(match row.map(CacheEntry::from) {
            Some(entry) if entry.is_expired_at(now) => {
                self.schedule_purge(now);
                None
            }
            entry => entry,
        })
    }

    /// Payloads for `keys`, in input order
    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.ensure_open()?;

        if keys.len() < BATCH_SELECT_THRESHOLD {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(self.get(key).await?);
            }
            return Ok(values);
        }

        let now = now_millis();
        let rows: Vec<CacheRow> = sqlx::query_as(&self.sql.select_many)
            .bind(serde_json::to_string(keys)?)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        debug!("Batch lookup of {} keys matched {} rows", keys.len(), rows.len());

        let mut found: HashMap<String, CacheEntry> = rows
            .into_iter()
            .map(|row| {
                let entry = CacheEntry::from(row);
                (entry.key.clone(), entry)
            })
            .collect();

        let mut saw_expired = false;
        found.retain(|_, entry| {
            let expired = entry.is_expired_at(now);
            saw_expired |= expired;
            !expired
        });
        if saw_expired {
            self.schedule_purge(now);
        }

        Ok(keys
            .iter()
            .map(|key| found.get(key).and_then(|entry| entry.data.clone()))
            .collect())
    }

    /// Insert or replace `key`. A finite positive `ttl_seconds` sets a
    /// deadline; anything else stores the entry without one.
    pub async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl_seconds: Option<f64>,
    ) -> Result<Option<String>> {
        self.ensure_open()?;
        let entry = CacheEntry::new(key, value.map(str::to_string), ttl_seconds, now_millis());

        sqlx::query(&self.sql.upsert)
            .bind(&entry.key)
            .bind(entry.data.as_deref())
            .bind(entry.created_at)
            .bind(to_column(entry.expires_at))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(entry.data)
    }

    /// Remove `key` whether or not it has expired
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.delete_one(key).await? == 1)
    }

    async fn delete_one(&self, key: &str) -> Result<u64> {
        let result = sqlx::query(&self.sql.delete_one)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    /// Remove every key in `keys`. True only if each one existed; keys that
    /// do exist are removed either way.
    pub async fn delete_many(&self, keys: &[String]) -> Result<bool> {
        self.ensure_open()?;

        let removed = if keys.len() >= BATCH_DELETE_THRESHOLD {
            sqlx::query(&self.sql.delete_many)
                .bind(serde_json::to_string(keys)?)
                .execute(&self.pool)
                .await
                .map_err(db_error)?
                .rows_affected()
        } else {
            let mut removed = 0;
            for key in keys {
                removed += self.delete_one(key).await?;
            }
            removed
        };

        Ok(removed == keys.len() as u64)
    }

    /// Remove every key under `namespace`, or the whole table
    pub async fn clear(&self, namespace: Option<&str>) -> Result<()> {
        self.ensure_open()?;

        let result = sqlx::query(&self.sql.clear_prefix)
            .bind(namespace_prefix(namespace))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        debug!(
            "Cleared {} rows from namespace {:?}",
            result.rows_affected(),
            namespace
        );

        Ok(())
    }

    /// Whether a live entry exists for `key`
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.live_entry(key).await?.is_some())
    }

    /// Live entries under `namespace` in insertion order, one page at a time.
    ///
    /// The expiration cutoff is taken once, when this is called; rows that
    /// expire during a long iteration are still yielded.
    pub fn iter<'a>(&'a self, namespace: Option<&'a str>) -> EntryStream<'a> {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let cursor = PageCursor {
            prefix: namespace_prefix(namespace),
            cutoff: now_millis(),
            offset: 0,
            buffer: VecDeque::new(),
        };

        stream::try_unfold(cursor, move |mut cursor| async move {
            if cursor.buffer.is_empty() {
                self.ensure_open()?;
                let page = self.fetch_page(&cursor).await?;
                cursor.offset += page.len() as i64;
                cursor.buffer.extend(page);
            }

            Ok::<_, CacheError>(cursor.buffer.pop_front().map(|item| (item, cursor)))
        })
        .boxed()
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Vec<(String, Option<String>)>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&self.sql.select_page)
            .bind(&cursor.prefix)
            .bind(cursor.cutoff)
            .bind(i64::from(self.page_size))
            .bind(cursor.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        debug!("Fetched page of {} rows at offset {}", rows.len(), cursor.offset);
        Ok(rows)
    }

    /// Number of live rows in the table
    pub async fn count(&self) -> Result<u64> {
        self.ensure_open()?;

        let count: i64 = sqlx::query_scalar(&self.sql.count_live)
            .bind(now_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(count.max(0) as u64)
    }

    /// Run the purge sweep now, returning how many rows were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        self.ensure_open()?;
        purge(&self.pool, &self.sql, now_millis())
            .await
            .map_err(db_error)
    }

    /// Queue a purge sweep behind the current operation. At most one sweep
    /// is in flight per store; failures are only logged.
    fn schedule_purge(&self, now: i64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping purge");
            return;
        };
        if self.purge_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let pool = self.pool.clone();
        let sql = self.sql.clone();
        let pending = self.purge_pending.clone();

        runtime.spawn(async move {
            if !pool.is_closed() {
                match purge(&pool, &sql, now).await {
                    Ok(removed) => debug!("Purged {} expired rows", removed),
                    Err(e) => warn!("Failed to purge expired rows: {}", e),
                }
            }
            pending.store(false, Ordering::Release);
        });
    }

    /// Close the connection. Later operations fail with [`CacheError::Closed`].
    pub async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.close().await;
        info!("Cache store closed (table {})", self.table);
        Ok(())
    }
}

async fn purge(pool: &SqlitePool, sql: &Statements, now: i64) -> sqlx::Result<u64> {
    let result = sqlx::query(&sql.purge).bind(now).execute(pool).await?;
    Ok(result.rows_affected())
}

/// Map engine errors, singling out lock contention that outlived the busy timeout
fn db_error(e: sqlx::Error) -> CacheError {
    match &e {
        sqlx::Error::PoolClosed => CacheError::Closed,
        sqlx::Error::Database(db) if is_lock_code(db.code().as_deref()) => {
            CacheError::LockTimeout(e.to_string())
        }
        _ => CacheError::Database(e.to_string()),
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
fn is_lock_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

struct PageCursor {
    prefix: String,
    cutoff: i64,
    offset: i64,
    buffer: VecDeque<(String, Option<String>)>,
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        SqliteStore::get(self, key).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        SqliteStore::get_many(self, keys).await
    }

    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl_seconds: Option<f64>,
    ) -> Result<Option<String>> {
        SqliteStore::set(self, key, value, ttl_seconds).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        SqliteStore::delete(self, key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool> {
        SqliteStore::delete_many(self, keys).await
    }

    async fn clear(&self, namespace: Option<&str>) -> Result<()> {
        SqliteStore::clear(self, namespace).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        SqliteStore::has(self, key).await
    }

    fn iter<'a>(&'a self, namespace: Option<&'a str>) -> EntryStream<'a> {
        SqliteStore::iter(self, namespace)
    }

    async fn disconnect(&self) -> Result<()> {
        SqliteStore::disconnect(self).await
    }
}

// Helper struct for sqlx query_as
#[derive(sqlx::FromRow)]
struct CacheRow {
    #[sqlx(rename = "cacheKey")]
    cache_key: String,
    #[sqlx(rename = "cacheData")]
    cache_data: Option<String>,
    #[sqlx(rename = "createdAt")]
    created_at: i64,
    #[sqlx(rename = "expiredAt")]
    expired_at: i64,
}

impl From<CacheRow> for CacheEntry {
    fn from(r: CacheRow) -> Self {
        CacheEntry {
            key: r.cache_key,
            data: r.cache_data,
            created_at: r.created_at,
            expires_at: kvlite_core::from_column(r.expired_at),
        }
    }
}
