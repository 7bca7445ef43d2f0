//! Shared store backed by a SQLite database file
//!
//! Every replica opens the same database file. The schema models a tiny
//! key/value, hash and list store so the state keeps the realm-namespaced key
//! layout (`{realm}__seats_{spec}`, `{realm}__ports`, `{realm}__version`, ...).
//!
//! Each key carries a version that is bumped on every write. A [`Watch`]
//! snapshots versions; [`SharedStore::commit_if_unchanged`] only applies its
//! writes if none of the watched keys moved in between. [`SharedStore::transact`]
//! wraps that into the read / decide / conditional-write / retry cycle used by
//! the stores that need optimistic concurrency.

use super::{optimistic, Attempt, RetryPolicy};
use crate::error::StoreError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Milliseconds a writer waits for a competing replica's lock
const BUSY_TIMEOUT_MS: i64 = 5_000;

/// Handle to the shared database. Cheap to clone.
#[derive(Clone)]
pub struct SharedStore {
    conn: Arc<Mutex<Connection>>,
    realm: Arc<str>,
    retry: RetryPolicy,
}

impl SharedStore {
    /// Open or create the shared database at `path`
    pub fn open(path: impl AsRef<Path>, realm: &str, retry: RetryPolicy) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            realm: Arc::from(realm),
            retry,
        };
        store.run_migrations()?;

        info!(path = %path.display(), realm, "Shared store opened");
        Ok(store)
    }

    /// Open a private in-memory database (for testing)
    pub fn open_in_memory(realm: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            realm: Arc::from(realm),
            retry: RetryPolicy::default(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        debug!("Applying migration v1: key/hash/list schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hashes (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE TABLE IF NOT EXISTS lists (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_lists_key ON lists(key, seq);

            CREATE TABLE IF NOT EXISTS key_versions (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Realm-namespaced key for `name`
    pub fn key(&self, name: &str) -> String {
        format!("{}__{}", self.realm, name)
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `f` inside a write transaction that excludes every other writer
    pub fn atomically<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    /// Run `f` inside a read transaction (consistent snapshot, no write lock)
    pub fn read<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    fn run<T, E>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Tx<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(StoreError::from)?;
        let value = f(&Tx { conn: &*tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Snapshot the versions of `keys`
    pub fn watch(&self, keys: &[&str]) -> Result<Watch, StoreError> {
        self.read(|tx| {
            let versions = keys
                .iter()
                .map(|key| Ok(((*key).to_string(), tx.version(key)?)))
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(Watch { versions })
        })
    }

    /// Apply `f` only if no watched key changed since `watch` was taken.
    /// Returns `None` on conflict.
    pub fn commit_if_unchanged<T, E>(
        &self,
        watch: &Watch,
        f: impl FnOnce(&Tx<'_>) -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<StoreError>,
    {
        self.atomically(|tx| {
            for (key, version) in &watch.versions {
                if tx.version(key)? != *version {
                    return Ok(None);
                }
            }
            f(tx).map(Some)
        })
    }

    /// Watch `keys`, let `plan` read state and decide, then commit the planned
    /// writes if the keys are unchanged. Conflicts restart the whole cycle.
    pub fn transact<T, E>(
        &self,
        keys: &[&str],
        mut plan: impl FnMut(&Tx<'_>) -> Result<Plan<T>, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        optimistic(&self.retry, &keys.join(","), || {
            let watch = self.watch(keys)?;
            let Plan { value, writes } = self.read(|tx| plan(tx))?;
            if writes.is_empty() {
                return Ok(Attempt::Done(value));
            }

            let committed = self.commit_if_unchanged(&watch, |tx| {
                for op in &writes {
                    tx.apply(op)?;
                }
                Ok::<_, StoreError>(())
            })?;

            Ok(match committed {
                Some(()) => Attempt::Done(value),
                None => Attempt::Conflict,
            })
        })
    }
}

/// Key versions captured by [`SharedStore::watch`]
#[derive(Debug, Clone)]
pub struct Watch {
    versions: Vec<(String, u64)>,
}

/// Outcome of one read/decide pass of [`SharedStore::transact`]
pub struct Plan<T> {
    pub value: T,
    pub writes: Vec<WriteOp>,
}

impl<T> Plan<T> {
    /// Nothing to write
    pub fn done(value: T) -> Self {
        Self {
            value,
            writes: Vec::new(),
        }
    }

    pub fn write(value: T, writes: Vec<WriteOp>) -> Self {
        Self { value, writes }
    }
}

/// A queued write, applied atomically at commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    PushBack { key: String, value: String },
    ListRemove { key: String, value: String },
}

impl WriteOp {
    pub fn set<T: Serialize>(key: &str, value: &T) -> Result<Self, StoreError> {
        Ok(WriteOp::Set {
            key: key.to_string(),
            value: serde_json::to_string(value)?,
        })
    }

    pub fn hset<T: Serialize>(key: &str, field: &str, value: &T) -> Result<Self, StoreError> {
        Ok(WriteOp::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: serde_json::to_string(value)?,
        })
    }

    pub fn hdel(key: &str, field: &str) -> Self {
        WriteOp::HDel {
            key: key.to_string(),
            field: field.to_string(),
        }
    }

    pub fn list_remove(key: &str, value: &str) -> Self {
        WriteOp::ListRemove {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Operations available inside a transaction. Values are JSON encoded,
/// list items are raw strings.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl Tx<'_> {
    /// Current version of `key` (0 if never written)
    pub fn version(&self, key: &str) -> Result<u64, StoreError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM key_versions WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0) as u64)
    }

    fn bump(&self, key: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO key_versions (key, version) VALUES (?1, 1)
             ON CONFLICT(key) DO UPDATE SET version = version + 1",
            params![key],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set_raw(key, &serde_json::to_string(value)?)
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        self.bump(key)
    }

    pub fn del(&self, key: &str) -> Result<bool, StoreError> {
        let rows = self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        if rows > 0 {
            self.bump(key)?;
        }
        Ok(rows > 0)
    }

    pub fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    /// All (field, value) pairs of a hash, ordered by field
    pub fn hgetall<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<(String, T)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT field, value FROM hashes WHERE key = ?1 ORDER BY field")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(field, raw)| Ok((field, serde_json::from_str(&raw)?)))
            .collect()
    }

    pub fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM hashes WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn hset<T: Serialize>(&self, key: &str, field: &str, value: &T) -> Result<(), StoreError> {
        self.hset_raw(key, field, &serde_json::to_string(value)?)
    }

    fn hset_raw(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
            params![key, field, value],
        )?;
        self.bump(key)
    }

    pub fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let rows = self.conn.execute(
            "DELETE FROM hashes WHERE key = ?1 AND field = ?2",
            params![key, field],
        )?;
        if rows > 0 {
            self.bump(key)?;
        }
        Ok(rows > 0)
    }

    pub fn push_back(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO lists (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        self.bump(key)
    }

    /// Remove and return the oldest item of a list
    pub fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let head: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT seq, value FROM lists WHERE key = ?1 ORDER BY seq LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((seq, value)) = head else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM lists WHERE seq = ?1", params![seq])?;
        self.bump(key)?;
        Ok(Some(value))
    }

    /// Remove every occurrence of `value`, returning how many were removed
    pub fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let rows = self.conn.execute(
            "DELETE FROM lists WHERE key = ?1 AND value = ?2",
            params![key, value],
        )?;
        if rows > 0 {
            self.bump(key)?;
        }
        Ok(rows)
    }

    pub fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM lists WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn list_contains(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM lists WHERE key = ?1 AND value = ?2 LIMIT 1",
                params![key, value],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn apply(&self, op: &WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Set { key, value } => self.set_raw(key, value),
            WriteOp::Del { key } => self.del(key).map(|_| ()),
            WriteOp::HSet { key, field, value } => self.hset_raw(key, field, value),
            WriteOp::HDel { key, field } => self.hdel(key, field).map(|_| ()),
            WriteOp::PushBack { key, value } => self.push_back(key, value),
            WriteOp::ListRemove { key, value } => self.list_remove(key, value).map(|_| ()),
        }
    }
}
