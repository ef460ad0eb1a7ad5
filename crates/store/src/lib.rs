//! Vellum store: versioned, label-addressed objects over SQLite, with
//! secondary indices and a compositional query engine.
//!
//! One [`ObjectStore`] serves one application. Every operation runs as an
//! [`Actor`] whose label statements are checked before anything is
//! written. Writes queue the object for the text index synchroniser and
//! wake it through the shared index trigger.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use rusqlite::OptionalExtension;
use tokio::sync::Notify;
use tracing::{debug, info};

use vellum_core::consts::{O_LABEL_DELETED, O_STORE_OPTIONS};
use vellum_core::{AppId, Result, StoredObject};
use vellum_persist::{Db, Tables};
use vellum_schema::{flatten_weightings, Schema, SchemaHandle, SCHEMA_OBJECT_TYPES};
use vellum_search::TextIndex;

mod actor;
mod cache;
mod codec;
mod delegate;
mod indexing;
mod lifecycle;
pub mod query;
mod read;

pub use actor::{Actor, SYSTEM_USER};
pub use delegate::{DefaultDelegate, ObjectChange, StoreDelegate};
pub use lifecycle::CreateOptions;
pub use query::{
    Clause, Clauses, Container, DateSort, DeletedObjects, Projection, Query, QueryResults, SortBy, TimeField,
};
pub use read::{ObjectHistory, StoreStatistics};

use cache::ObjectCache;
use codec::{Row, ROW_COLUMNS};

const STATE_ATTR_WEIGHTINGS: &str = "attr_weightings";

pub struct ObjectStore {
    app: AppId,
    db: Arc<Db>,
    tables: Tables,
    schema: SchemaHandle,
    cache: ObjectCache,
    delegate: Arc<dyn StoreDelegate>,
    trigger: Arc<Notify>,
    text: TextIndex,
}

impl ObjectStore {
    pub fn open(db: Arc<Db>, app: AppId) -> anyhow::Result<Self> {
        let tables = db.ensure_app(app)?;
        let text = TextIndex::open(db.clone(), app).with_context(|| format!("opening text index for app {}", app))?;
        let cache = ObjectCache::new(db.config().cache_max_entries);
        info!(app, "object store opened");
        Ok(Self {
            app,
            db,
            tables,
            schema: SchemaHandle::new(),
            cache,
            delegate: Arc::new(DefaultDelegate),
            trigger: Arc::new(Notify::new()),
            text,
        })
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn StoreDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Share one wake signal between several stores and a synchroniser.
    pub fn with_index_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn app(&self) -> AppId {
        self.app
    }
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }
    pub fn tables(&self) -> &Tables {
        &self.tables
    }
    pub fn delegate(&self) -> &Arc<dyn StoreDelegate> {
        &self.delegate
    }
    pub fn text_index(&self) -> &TextIndex {
        &self.text
    }

    /// The current schema, loading it if a write invalidated it.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.schema.get_or_load(|generation| {
            let conn = self.db.lock()?;
            let ids: Vec<String> = SCHEMA_OBJECT_TYPES.iter().map(|t| t.id().to_string()).collect();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} WHERE (type_object_id IN ({}) OR id = ?1)
                 AND NOT EXISTS (SELECT 1 FROM json_each(labels) WHERE json_each.value = ?2)",
                ROW_COLUMNS,
                self.tables.objects,
                ids.join(",")
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![O_STORE_OPTIONS.id(), O_LABEL_DELETED], Row::from_sql)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let objects = rows.iter().map(Row::decode).collect::<Result<Vec<StoredObject>>>()?;
            Ok(Schema::from_objects(generation, &objects))
        })
    }

    pub fn schema_generation(&self) -> u64 {
        self.schema.generation()
    }

    /// Drop the schema after a schema object changed. If the new schema
    /// weights attributes differently, a text reindex of the affected
    /// attributes is queued.
    pub(crate) fn schema_changed(&self) -> Result<()> {
        self.schema.invalidate();
        self.delegate.notify_schema_changed(self.app);
        let schema = self.schema()?;
        let now = flatten_weightings(schema.attr_weightings_for_indexing());
        let now_json = serde_json::to_string(&now)?;
        let previous: Option<String> = {
            let conn = self.db.lock()?;
            conn.query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.tables.state),
                [STATE_ATTR_WEIGHTINGS],
                |r| r.get(0),
            )
            .optional()?
        };
        if previous.as_deref() == Some(now_json.as_str()) {
            return Ok(());
        }
        let before: Vec<(i64, i64, i64)> = match &previous {
            Some(p) => serde_json::from_str(p)?,
            None => Vec::new(),
        };
        let mut changed: Vec<i64> = before
            .iter()
            .filter(|b| !now.contains(b))
            .chain(now.iter().filter(|n| !before.contains(n)))
            .map(|(d, _, _)| *d)
            .collect();
        changed.sort_unstable();
        changed.dedup();
        {
            let conn = self.db.lock()?;
            conn.execute(
                &format!("INSERT OR REPLACE INTO {}(key, value) VALUES (?1, ?2)", self.tables.state),
                [STATE_ATTR_WEIGHTINGS, now_json.as_str()],
            )?;
        }
        // the first snapshot only records the baseline
        if previous.is_some() && !changed.is_empty() {
            debug!(app = self.app, descs = ?changed, "attribute weightings changed");
            self.reindex_all_objects(Some(changed.as_slice()))?;
        }
        Ok(())
    }
}
