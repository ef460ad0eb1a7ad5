//! Writes: create, update, relabel, delete/undelete, erase and the
//! reindexing entry points.

use std::time::Instant;

use metrics::{counter, histogram};
use rusqlite::params;
use tracing::{debug, info};

use vellum_core::consts::{A_TERM_INCLUSION_SPEC, O_LABEL_DELETED, O_LABEL_UNLABELLED, O_TYPE_APP_VISIBLE};
use vellum_core::{Desc, LabelChanges, LabelList, ObjRef, Operation, Result, StoreError, StoredObject, Value};
use vellum_persist::{ms_to_datetime, now_ms, DIRTY_TEXT_TABLE, REINDEX_TABLE};
use vellum_schema::{Schema, TermInclusionSpec};

use crate::codec::{Row, ROW_COLUMNS};
use crate::indexing::{
    delete_index_rows, full_obj_id_path, mark_dirty, mark_linkers_dirty, mark_type_linkers_dirty,
    rewrite_descendant_paths, write_index_rows,
};
use crate::{Actor, ObjectChange, ObjectStore};

/// How a new object gets its id and labels.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Applied to the object's own labels before the delegate sees them.
    pub label_changes: Option<LabelChanges>,
    /// Store under this id. It must not be in use.
    pub forced_id: Option<ObjRef>,
    /// Permit a forced id in the reserved range for a non-schema object.
    pub allow_any_id: bool,
}

impl CreateOptions {
    pub fn with_label_changes(changes: LabelChanges) -> Self {
        Self { label_changes: Some(changes), ..Self::default() }
    }

    pub fn with_forced_id(objref: ObjRef) -> Self {
        Self { forced_id: Some(objref), ..Self::default() }
    }
}

fn non_empty(labels: LabelList) -> LabelList {
    if labels.is_empty() {
        LabelList::from([O_LABEL_UNLABELLED])
    } else {
        labels
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl ObjectStore {
    /// Reserve an id for an object which has not been stored yet.
    pub fn preallocate_objref(&self, obj: &mut StoredObject) -> Result<ObjRef> {
        if obj.objref.is_some() {
            return Err(StoreError::InvalidObject("object already has an id".into()));
        }
        let t = &self.tables;
        let objref = self.db.serializable(|tx| {
            tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", t.ids), [])?;
            Ok(ObjRef(tx.last_insert_rowid()))
        })?;
        obj.objref = Some(objref);
        Ok(objref)
    }

    pub fn create(&self, actor: &Actor, mut obj: StoredObject, opts: CreateOptions) -> Result<StoredObject> {
        let started = Instant::now();
        if obj.is_persisted() {
            return Err(StoreError::InvalidObject("object has already been stored".into()));
        }
        let is_schema = self.delegate.is_schema_obj(&obj);
        if let Some(forced) = opts.forced_id {
            if forced.is_reserved() && !is_schema && !opts.allow_any_id {
                return Err(StoreError::InvalidObject(format!("forced id {} is in the reserved range", forced)));
            }
        }
        let mut changes = opts.label_changes.unwrap_or_default();
        self.delegate.update_label_changes_for(ObjectChange::Create, &obj, None, is_schema, &mut changes);
        let labels = non_empty(changes.apply(&obj.labels));
        let preset = opts.forced_id.or(obj.objref);
        actor.check(Operation::Create, &labels, preset)?;

        let now = ms_to_datetime(now_ms());
        obj.labels = labels;
        obj.version = 1;
        obj.creation_time = Some(
            obj.attributes()
                .iter()
                .find_map(|a| a.value.as_datetime().map(|r| r.start))
                .unwrap_or(now),
        );
        obj.update_time = Some(now);
        obj.created_by = Some(actor.user_id);
        obj.modified_by = Some(actor.user_id);

        let schema = self.schema()?;
        let compress = self.db.config().compress_blobs;
        let t = &self.tables;
        let objref = self.db.serializable(|tx| {
            let objref = match preset {
                Some(r) => {
                    let exists: bool = tx.query_row(
                        &format!("SELECT EXISTS (SELECT 1 FROM {} WHERE id = ?1)", t.objects),
                        [r.id()],
                        |row| row.get(0),
                    )?;
                    if exists {
                        return Err(StoreError::DuplicateId(r));
                    }
                    // keeps generated ids above any forced one
                    tx.execute(&format!("INSERT OR IGNORE INTO {}(id) VALUES (?1)", t.ids), [r.id()])?;
                    r
                }
                None => {
                    tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", t.ids), [])?;
                    ObjRef(tx.last_insert_rowid())
                }
            };
            let mut stored = obj.clone();
            stored.objref = Some(objref);
            Row::encode(&stored, compress)?.insert(tx, &t.objects)?;
            write_index_rows(tx, t, &schema, self.delegate.as_ref(), &stored)?;
            mark_dirty(tx, self.app, objref.id())?;
            Ok(objref)
        })?;
        obj.objref = Some(objref);

        self.cache.invalidate(objref);
        if is_schema {
            self.schema_changed()?;
        }
        self.trigger.notify_one();
        self.delegate.post_object_change(ObjectChange::Create, &obj, None);
        counter!("store_create_total", 1u64);
        histogram!("store_write_ms", elapsed_ms(started));
        debug!(app = self.app, obj = %objref, version = 1, "object created");
        Ok(obj)
    }

    /// Store a new revision. `obj.version` must be the stored version.
    pub fn update(&self, actor: &Actor, mut obj: StoredObject) -> Result<StoredObject> {
        let started = Instant::now();
        let objref = match obj.objref {
            Some(r) if obj.is_persisted() => r,
            _ => return Err(StoreError::InvalidObject("object has never been stored".into())),
        };
        let t = &self.tables;
        let previous_row = {
            let conn = self.db.lock()?;
            Row::fetch(&conn, &t.objects, objref.id())?
        }
        .ok_or(StoreError::NotFound(objref))?;
        if previous_row.version != obj.version {
            return Err(StoreError::conflict(format!(
                "object {} is at version {}, update was based on version {}",
                objref, previous_row.version, obj.version
            )));
        }
        let previous = previous_row.decode()?;
        actor.check(Operation::Update, &previous.labels, Some(objref))?;

        let is_schema = self.delegate.is_schema_obj(&obj) || self.delegate.is_schema_obj(&previous);
        let mut changes = LabelChanges::changing(&previous.labels, &obj.labels);
        self.delegate.update_label_changes_for(ObjectChange::Update, &obj, Some(&previous), is_schema, &mut changes);
        let labels = non_empty(changes.apply(&previous.labels));
        if labels != previous.labels {
            actor.check(Operation::Relabel, &previous.labels, Some(objref))?;
            actor.check(Operation::Create, &labels, Some(objref))?;
        }

        obj.labels = labels;
        obj.version = previous.version + 1;
        obj.creation_time = previous.creation_time;
        obj.created_by = previous.created_by;
        obj.update_time = Some(ms_to_datetime(now_ms()));
        obj.modified_by = Some(actor.user_id);

        let schema = self.schema()?;
        let linked_terms_changed = linked_terms_changed(&schema, &previous, &obj);
        let spec_changed = term_inclusion_changed(&schema, &previous, &obj);
        let compress = self.db.config().compress_blobs;
        let new_row = Row::encode(&obj, compress)?;
        self.db.serializable(|tx| {
            match Row::fetch(tx, &t.objects, objref.id())? {
                None => return Err(StoreError::NotFound(objref)),
                Some(current) if current != previous_row => {
                    return Err(StoreError::conflict(format!("object {} changed during update", objref)));
                }
                Some(_) => {}
            }
            let old_path = full_obj_id_path(tx, t, objref)?;
            tx.execute(
                &format!(
                    "INSERT INTO {history}({cols}, retired_by) SELECT {cols}, ?2 FROM {objects} WHERE id = ?1",
                    history = t.history,
                    cols = ROW_COLUMNS,
                    objects = t.objects
                ),
                params![objref.id(), actor.user_id],
            )?;
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", t.objects), [objref.id()])?;
            new_row.insert(tx, &t.objects)?;
            delete_index_rows(tx, t, objref.id())?;
            write_index_rows(tx, t, &schema, self.delegate.as_ref(), &obj)?;
            mark_dirty(tx, self.app, objref.id())?;
            let new_path = full_obj_id_path(tx, t, objref)?;
            if new_path != old_path {
                rewrite_descendant_paths(tx, t, &old_path, &new_path)?;
            }
            if linked_terms_changed || new_path != old_path {
                mark_linkers_dirty(tx, t, self.app, objref.id())?;
            }
            if spec_changed {
                let types = schema.types_including_children(&[objref]);
                mark_type_linkers_dirty(tx, t, self.app, &types)?;
            }
            Ok(())
        })?;

        self.cache.invalidate(objref);
        if is_schema {
            self.schema_changed()?;
        }
        self.trigger.notify_one();
        self.delegate.post_object_change(ObjectChange::Update, &obj, Some(&previous));
        counter!("store_update_total", 1u64);
        histogram!("store_write_ms", elapsed_ms(started));
        debug!(app = self.app, obj = %objref, version = obj.version, "object updated");
        Ok(obj)
    }

    /// Change labels only. Applied in place, so concurrent relabels of the
    /// same object compose. The version is left as it was.
    pub fn relabel(&self, actor: &Actor, objref: ObjRef, changes: LabelChanges) -> Result<StoredObject> {
        let started = Instant::now();
        let t = &self.tables;
        let previous = {
            let conn = self.db.lock()?;
            Row::fetch(&conn, &t.objects, objref.id())?
        }
        .ok_or(StoreError::NotFound(objref))?
        .decode()?;
        actor.check(Operation::Relabel, &previous.labels, Some(objref))?;
        let is_schema = self.delegate.is_schema_obj(&previous);
        let mut changes = changes;
        self.delegate.update_label_changes_for(ObjectChange::Relabel, &previous, Some(&previous), is_schema, &mut changes);
        let labels = non_empty(changes.apply(&previous.labels));
        actor.check(Operation::Create, &labels, Some(objref))?;
        if labels == previous.labels {
            return Ok(previous);
        }

        let schema = self.schema()?;
        let sql = format!("UPDATE {} SET labels = ?2 WHERE id = ?1 RETURNING {}", t.objects, ROW_COLUMNS);
        // labels may have moved since the checks above; authority is
        // decided on the labels the change is applied to
        let (obj, changed) = self.db.serializable(|tx| {
            let current = Row::fetch(tx, &t.objects, objref.id())?.ok_or(StoreError::NotFound(objref))?;
            let current_labels = current.labels()?;
            if current_labels != previous.labels {
                actor.check(Operation::Relabel, &current_labels, Some(objref))?;
            }
            let labels = non_empty(changes.apply(&current_labels));
            if labels == current_labels {
                return Ok((current.decode()?, false));
            }
            actor.check(Operation::Create, &labels, Some(objref))?;
            let row = tx.query_row(&sql, params![objref.id(), labels.to_json()], Row::from_sql)?;
            let obj = row.decode()?;
            delete_index_rows(tx, t, objref.id())?;
            write_index_rows(tx, t, &schema, self.delegate.as_ref(), &obj)?;
            mark_dirty(tx, self.app, objref.id())?;
            Ok((obj, true))
        })?;
        if !changed {
            return Ok(obj);
        }

        self.cache.invalidate(objref);
        if is_schema || self.delegate.is_schema_obj(&obj) {
            self.schema_changed()?;
        }
        self.trigger.notify_one();
        self.delegate.post_object_change(ObjectChange::Relabel, &obj, Some(&previous));
        counter!("store_relabel_total", 1u64);
        histogram!("store_write_ms", elapsed_ms(started));
        debug!(app = self.app, obj = %objref, labels = %obj.labels.to_json(), "object relabelled");
        Ok(obj)
    }

    /// Mark as deleted. Needs delete permission on the current labels; the
    /// relabel itself runs with superuser authority.
    pub fn delete(&self, actor: &Actor, objref: ObjRef) -> Result<StoredObject> {
        self.change_deleted(actor, objref, true)
    }

    pub fn undelete(&self, actor: &Actor, objref: ObjRef) -> Result<StoredObject> {
        self.change_deleted(actor, objref, false)
    }

    fn change_deleted(&self, actor: &Actor, objref: ObjRef, deleted: bool) -> Result<StoredObject> {
        let labels = self.labels_for_ref(objref)?.ok_or(StoreError::NotFound(objref))?;
        actor.check(Operation::Delete, &labels, Some(objref))?;
        let mut changes = LabelChanges::default();
        if deleted {
            changes.add([O_LABEL_DELETED]);
        } else {
            changes.remove([O_LABEL_DELETED]);
        }
        self.relabel(&actor.with_superuser(), objref, changes)
    }

    /// Remove the object, its history and its index rows for good.
    pub fn erase(&self, actor: &Actor, objref: ObjRef) -> Result<()> {
        if !actor.is_superuser() {
            return Err(StoreError::denied(Operation::Delete, Some(objref)));
        }
        let t = &self.tables;
        let previous = self.db.serializable(|tx| {
            let row = Row::fetch(tx, &t.objects, objref.id())?.ok_or(StoreError::NotFound(objref))?;
            delete_index_rows(tx, t, objref.id())?;
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", t.objects), [objref.id()])?;
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", t.history), [objref.id()])?;
            mark_dirty(tx, self.app, objref.id())?;
            row.decode()
        })?;
        self.cache.invalidate(objref);
        if self.delegate.is_schema_obj(&previous) {
            self.schema_changed()?;
        }
        self.trigger.notify_one();
        self.delegate.post_object_change(ObjectChange::Erase, &previous, None);
        counter!("store_erase_total", 1u64);
        info!(app = self.app, obj = %objref, user = actor.user_id, "object erased");
        Ok(())
    }

    /// Regenerate the secondary index rows of one object.
    pub fn reindex_object(&self, objref: ObjRef) -> Result<()> {
        let schema = self.schema()?;
        let t = &self.tables;
        self.db.serializable(|tx| {
            let obj = Row::fetch(tx, &t.objects, objref.id())?.ok_or(StoreError::NotFound(objref))?.decode()?;
            delete_index_rows(tx, t, objref.id())?;
            write_index_rows(tx, t, &schema, self.delegate.as_ref(), &obj)?;
            mark_dirty(tx, self.app, objref.id())
        })?;
        self.cache.invalidate(objref);
        self.trigger.notify_one();
        Ok(())
    }

    /// Queue the object for the text index.
    pub fn reindex_text_for_object(&self, objref: ObjRef) -> Result<()> {
        {
            let conn = self.db.lock()?;
            mark_dirty(&conn, self.app, objref.id())?;
        }
        self.trigger.notify_one();
        Ok(())
    }

    /// Start a text reindex of every object, replacing any reindex already
    /// running for this application. With a filter, only objects holding
    /// one of the descriptors are reindexed.
    pub fn reindex_all_objects(&self, filter_by_attr: Option<&[Desc]>) -> Result<()> {
        let filter = filter_by_attr.map(serde_json::to_string).transpose()?;
        self.db.serializable(|tx| {
            tx.execute(&format!("DELETE FROM {} WHERE app_id = ?1", REINDEX_TABLE), [self.app])?;
            tx.execute(
                &format!("INSERT INTO {}(app_id, filter_by_attr, cursor) VALUES (?1, ?2, 0)", REINDEX_TABLE),
                params![self.app, filter],
            )?;
            Ok(())
        })?;
        info!(app = self.app, filter = ?filter_by_attr, "text reindex of all objects queued");
        self.trigger.notify_one();
        Ok(())
    }

    /// True while dirty objects or a reindex cursor are waiting.
    pub fn is_indexing_outstanding(&self) -> Result<bool> {
        let conn = self.db.lock()?;
        Ok(conn.query_row(
            &format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE app_id = ?1) OR EXISTS (SELECT 1 FROM {} WHERE app_id = ?1)",
                DIRTY_TEXT_TABLE, REINDEX_TABLE
            ),
            [self.app],
            |r| r.get(0),
        )?)
    }
}

/// Whether objects linking to `now` would receive different terms.
fn linked_terms_changed(schema: &Schema, previous: &StoredObject, now: &StoredObject) -> bool {
    if previous.type_ref() != now.type_ref() {
        return true;
    }
    let Some(t) = now.type_ref() else {
        return previous.title() != now.title();
    };
    schema.term_inclusion_for(t).inclusions().iter().any(|inc| {
        let before: Vec<&Value> = previous.attrs_for(inc.desc).collect();
        let after: Vec<&Value> = now.attrs_for(inc.desc).collect();
        before != after
    })
}

/// Whether a type descriptor's term inclusion specification changed.
fn term_inclusion_changed(schema: &Schema, previous: &StoredObject, now: &StoredObject) -> bool {
    if now.type_ref() != Some(O_TYPE_APP_VISIBLE) {
        return false;
    }
    let spec_text = |o: &StoredObject| o.first_attr(A_TERM_INCLUSION_SPEC).and_then(Value::as_text).map(|t| t.text.clone());
    let (before, after) = (spec_text(previous), spec_text(now));
    if before == after {
        return false;
    }
    let parse = |text: Option<String>| match text {
        Some(s) => TermInclusionSpec::parse(&s, |n| schema.attr_desc_by_name(n)),
        None => TermInclusionSpec::default(),
    };
    parse(before).reindexing_required(&parse(after))
}
