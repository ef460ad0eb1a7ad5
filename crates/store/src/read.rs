use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use vellum_core::{ExtractedGroups, LabelList, ObjRef, Operation, Result, StoreError, StoredObject};
use vellum_persist::DIRTY_TEXT_TABLE;
use vellum_schema::RestrictedAttributes;

use crate::codec::{Row, ROW_COLUMNS};
use crate::{Actor, ObjectStore};

/// Lookups at or before a revision's first write still find version 1
/// when this close to it.
const FIRST_VERSION_SLACK_MS: i64 = 2_000;

/// Current revision plus the earlier ones the actor may read, oldest first.
#[derive(Debug, Clone)]
pub struct ObjectHistory {
    pub object: Arc<StoredObject>,
    pub history: Vec<StoredObject>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStatistics {
    pub objects: u64,
    pub revisions: u64,
    pub dirty: u64,
    pub cache_entries: usize,
    pub schema_generation: u64,
}

impl ObjectStore {
    fn load(&self, objref: ObjRef) -> Result<Arc<StoredObject>> {
        if let Some(obj) = self.cache.get(objref) {
            return Ok(obj);
        }
        let epoch = self.cache.epoch();
        let row = {
            let conn = self.db.lock()?;
            Row::fetch(&conn, &self.tables.objects, objref.id())?
        };
        let obj = Arc::new(row.ok_or(StoreError::NotFound(objref))?.decode()?);
        self.cache.insert(obj.clone(), epoch);
        Ok(obj)
    }

    /// The current revision. Read permission is checked on every call,
    /// cached or not.
    pub fn read(&self, actor: &Actor, objref: ObjRef) -> Result<Arc<StoredObject>> {
        let obj = self.load(objref)?;
        actor.check(Operation::Read, &obj.labels, Some(objref))?;
        Ok(obj)
    }

    /// Like [`read`](Self::read), but `None` when permission is denied.
    pub fn read_if_permitted(&self, actor: &Actor, objref: ObjRef) -> Result<Option<Arc<StoredObject>>> {
        let obj = self.load(objref)?;
        Ok(actor.statements.is_allowed(Operation::Read, &obj.labels).then_some(obj))
    }

    /// Every revision, oldest first. Not permission checked.
    fn revisions(&self, objref: ObjRef) -> Result<Vec<Row>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM {history} WHERE id = ?1
             UNION ALL SELECT {cols} FROM {objects} WHERE id = ?1
             ORDER BY 2",
            cols = ROW_COLUMNS,
            history = self.tables.history,
            objects = self.tables.objects
        ))?;
        let rows = stmt.query_map([objref.id()], Row::from_sql)?.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn readable(actor: &Actor, row: &Row) -> Result<StoredObject> {
        let obj = row.decode()?;
        actor.check(Operation::Read, &obj.labels, obj.objref)?;
        Ok(obj)
    }

    pub fn read_version(&self, actor: &Actor, objref: ObjRef, version: i64) -> Result<StoredObject> {
        let rows = self.revisions(objref)?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(objref));
        }
        let row = rows
            .iter()
            .find(|r| r.version == version)
            .ok_or_else(|| StoreError::InvalidObject(format!("object {} has no version {}", objref, version)))?;
        Self::readable(actor, row)
    }

    /// The revision in force at `time`.
    pub fn read_version_at_time(&self, actor: &Actor, objref: ObjRef, time: DateTime<Utc>) -> Result<StoredObject> {
        let rows = self.revisions(objref)?;
        let at = time.timestamp_millis();
        let row = match rows.iter().rev().find(|r| r.updated_at <= at) {
            Some(r) => r,
            None => rows
                .first()
                .filter(|r| r.updated_at - FIRST_VERSION_SLACK_MS <= at)
                .ok_or(StoreError::NotFound(objref))?,
        };
        Self::readable(actor, row)
    }

    /// Older revisions the actor may read, plus the current one, which
    /// must itself be readable.
    pub fn history(&self, actor: &Actor, objref: ObjRef) -> Result<ObjectHistory> {
        let object = self.read(actor, objref)?;
        let predicate = actor.statements.sql_predicate(Operation::Read, "labels", &LabelList::empty());
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE id = ?1 AND {} ORDER BY version",
            ROW_COLUMNS, self.tables.history, predicate
        ))?;
        let history = stmt
            .query_map([objref.id()], Row::from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .map(Row::decode)
            .collect::<Result<Vec<_>>>()?;
        debug!(obj = %objref, revisions = history.len(), "history loaded");
        Ok(ObjectHistory { object, history })
    }

    /// Current labels, without any permission check.
    pub fn labels_for_ref(&self, objref: ObjRef) -> Result<Option<LabelList>> {
        if let Some(obj) = self.cache.get(objref) {
            return Ok(Some(obj.labels.clone()));
        }
        let conn = self.db.lock()?;
        let row = Row::fetch(&conn, &self.tables.objects, objref.id())?;
        row.map(|r| r.labels()).transpose()
    }

    pub fn count_objects_stored(&self) -> Result<u64> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.tables.objects), [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let objects = self.count_objects_stored()?;
        let conn = self.db.lock()?;
        let revisions: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.tables.history), [], |r| r.get(0))?;
        let dirty: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE app_id = ?1", DIRTY_TEXT_TABLE),
            [self.app],
            |r| r.get(0),
        )?;
        Ok(StoreStatistics {
            objects,
            revisions: revisions as u64,
            dirty: dirty as u64,
            cache_entries: self.cache.len(),
            schema_generation: self.schema_generation(),
        })
    }

    /// Split grouped attributes into pseudo-objects labelled by the
    /// delegate.
    pub fn extract_groups(&self, obj: &StoredObject) -> Result<ExtractedGroups> {
        let schema = self.schema()?;
        let mut extracted = obj.extract_groups(|d| schema.group_type_for(d));
        for (_, group) in extracted.groups.iter_mut() {
            self.delegate.label_extracted_object_group(group, obj);
        }
        Ok(extracted)
    }

    /// Attributes of `obj` hidden from or read only for the actor.
    pub fn restricted_attributes(&self, actor: &Actor, obj: &StoredObject) -> Result<RestrictedAttributes> {
        let schema = self.schema()?;
        let unrestrict = if actor.is_superuser() {
            schema.all_restriction_labels()
        } else {
            actor.unrestrict_labels.clone()
        };
        Ok(schema.restricted_attributes_for(obj.type_ref(), &obj.labels, &unrestrict))
    }
}
