//! Vellum persistence: the SQLite backend behind the object store and the
//! text index. One connection per process, WAL journal, immediate
//! transactions retried on busy.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use vellum_core::consts::MAX_RESERVED_OBJID;
use vellum_core::{AppId, Result, StoreError};

mod config;

pub use config::StoreConfig;

/// Table names for one application.
#[derive(Debug, Clone)]
pub struct Tables {
    pub objects: String,
    pub history: String,
    pub index_int: String,
    pub index_link: String,
    pub index_datetime: String,
    pub index_identifier: String,
    pub state: String,
    pub ids: String,
}

impl Tables {
    pub fn for_app(app: AppId) -> Self {
        let p = format!("a{}_os", app);
        Self {
            objects: format!("{}_objects", p),
            history: format!("{}_objects_old", p),
            index_int: format!("{}_index_int", p),
            index_link: format!("{}_index_link", p),
            index_datetime: format!("{}_index_datetime", p),
            index_identifier: format!("{}_index_identifier", p),
            state: format!("{}_state", p),
            ids: format!("{}_ids", p),
        }
    }

    pub fn index_tables(&self) -> [&str; 4] {
        [&self.index_int, &self.index_link, &self.index_datetime, &self.index_identifier]
    }
}

pub const DIRTY_TEXT_TABLE: &str = "os_dirty_text";
pub const REINDEX_TABLE: &str = "os_store_reindex";

/// Shared handle to the database.
pub struct Db {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

impl Db {
    pub fn open(config: StoreConfig) -> AnyResult<Self> {
        let started = std::time::Instant::now();
        let conn = Connection::open(&config.db_path)
            .with_context(|| format!("opening sqlite db at {}", config.db_path))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_millis(250)).context("setting busy timeout")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {dirty} (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL,
                obj_id INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS {reindex} (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id         INTEGER NOT NULL,
                filter_by_attr TEXT,
                cursor         INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_os_dirty_text_app ON {dirty}(app_id, id);",
            dirty = DIRTY_TEXT_TABLE,
            reindex = REINDEX_TABLE,
        ))
        .context("creating queue tables")?;
        let me = Self { conn: Mutex::new(conn), config };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create the per-application object and index tables.
    pub fn ensure_app(&self, app: AppId) -> AnyResult<Tables> {
        let t = Tables::for_app(app);
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {objects} (
                id             INTEGER PRIMARY KEY,
                version        INTEGER NOT NULL,
                labels         TEXT NOT NULL,
                creation_time  INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                created_by     INTEGER NOT NULL,
                updated_by     INTEGER NOT NULL,
                type_object_id INTEGER,
                sortas_title   TEXT,
                object         BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_{objects}_type ON {objects}(type_object_id);
             CREATE INDEX IF NOT EXISTS idx_{objects}_sortas ON {objects}(sortas_title);
             CREATE INDEX IF NOT EXISTS idx_{objects}_ctime ON {objects}(creation_time);
             CREATE TABLE IF NOT EXISTS {history} (
                id             INTEGER NOT NULL,
                version        INTEGER NOT NULL,
                labels         TEXT NOT NULL,
                creation_time  INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL,
                created_by     INTEGER NOT NULL,
                updated_by     INTEGER NOT NULL,
                type_object_id INTEGER,
                sortas_title   TEXT,
                object         BLOB NOT NULL,
                retired_by     INTEGER NOT NULL,
                PRIMARY KEY (id, version)
             );
             CREATE TABLE IF NOT EXISTS {int} (
                id INTEGER NOT NULL, attr_desc INTEGER NOT NULL, qualifier INTEGER NOT NULL,
                value INTEGER NOT NULL, restrictions TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_{int}_id ON {int}(id);
             CREATE INDEX IF NOT EXISTS idx_{int}_v ON {int}(attr_desc, value);
             CREATE TABLE IF NOT EXISTS {link} (
                id INTEGER NOT NULL, attr_desc INTEGER NOT NULL, qualifier INTEGER NOT NULL,
                value TEXT NOT NULL, object_id INTEGER NOT NULL, restrictions TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_{link}_id ON {link}(id);
             CREATE INDEX IF NOT EXISTS idx_{link}_obj ON {link}(object_id);
             CREATE TABLE IF NOT EXISTS {dt} (
                id INTEGER NOT NULL, attr_desc INTEGER NOT NULL, qualifier INTEGER NOT NULL,
                value INTEGER NOT NULL, value2 INTEGER NOT NULL, restrictions TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_{dt}_id ON {dt}(id);
             CREATE TABLE IF NOT EXISTS {ident} (
                id INTEGER NOT NULL, attr_desc INTEGER NOT NULL, qualifier INTEGER NOT NULL,
                value TEXT NOT NULL, identifier_type INTEGER NOT NULL, restrictions TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_{ident}_id ON {ident}(id);
             CREATE INDEX IF NOT EXISTS idx_{ident}_v ON {ident}(identifier_type, value);
             CREATE TABLE IF NOT EXISTS {state} (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS {ids} (id INTEGER PRIMARY KEY AUTOINCREMENT);
             INSERT INTO {ids}(id) SELECT {first} WHERE NOT EXISTS (SELECT 1 FROM {ids});",
            objects = t.objects,
            history = t.history,
            int = t.index_int,
            link = t.index_link,
            dt = t.index_datetime,
            ident = t.index_identifier,
            state = t.state,
            ids = t.ids,
            first = MAX_RESERVED_OBJID,
        ))
        .with_context(|| format!("creating tables for app {}", app))?;
        debug!(app, "application tables ready");
        Ok(t)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    /// Run `f` in an immediate transaction, committing on success.
    ///
    /// Transient conflicts (busy or locked database) are retried up to
    /// `txn_retries` times after a randomised pause. Other errors roll back
    /// and propagate at once.
    pub fn serializable<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = {
                let mut conn = self.lock()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                f(&tx).and_then(|v| tx.commit().map(|_| v).map_err(StoreError::from))
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < self.config.txn_retries => {
                    attempt += 1;
                    counter!("store_txn_retries_total", 1u64);
                    let (lo, hi) = self.config.retry_backoff_ms;
                    let pause = rand::thread_rng().gen_range(lo..=hi.max(lo));
                    debug!(attempt, pause_ms = pause, error = %e, "retrying transaction");
                    std::thread::sleep(Duration::from_millis(pause));
                }
                other => return other,
            }
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn maybe_compress(data: &[u8], enabled: bool) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if enabled {
            let lvl: i32 = std::env::var("VELLUM_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
            if let Ok(z) = zstd::encode_all(data, lvl) {
                return z;
            }
        }
    }
    let _ = enabled;
    data.to_vec()
}

/// Compressed blobs are recognised by the zstd frame magic.
pub fn maybe_decompress(blob: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    #[cfg(feature = "zstd")]
    {
        if blob.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
                return std::borrow::Cow::Owned(de);
            }
        }
    }
    std::borrow::Cow::Borrowed(blob)
}
