//! Secondary index rows, parent paths and the dirty text queue.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use vellum_core::consts::{A_PARENT, A_TYPE, MAX_PARENT_PATH};
use vellum_core::{AppId, Attribute, LabelList, ObjRef, Result, StoredObject, Value};
use vellum_persist::{Tables, DIRTY_TEXT_TABLE};
use vellum_schema::Schema;

use crate::StoreDelegate;

/// Path of `objref` for hierarchical matching: its ancestors, root first,
/// followed by itself.
pub(crate) fn full_obj_id_path(conn: &Connection, t: &Tables, objref: ObjRef) -> Result<Vec<i64>> {
    let parent_path: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE id = ?1 AND attr_desc = ?2 LIMIT 1", t.index_link),
            params![objref.id(), A_PARENT],
            |r| r.get(0),
        )
        .optional()?;
    let mut path: Vec<i64> = match parent_path {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    if path.contains(&objref.id()) {
        // cycle through this object; cut it here
        path.clear();
    }
    path.push(objref.id());
    if path.len() > MAX_PARENT_PATH {
        path.drain(..path.len() - MAX_PARENT_PATH);
    }
    Ok(path)
}

fn path_json(path: &[i64]) -> String {
    let parts: Vec<String> = path.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Replace the prefix `old` by `new` in every link path running through
/// the object at the end of `old`.
pub(crate) fn rewrite_descendant_paths(conn: &Connection, t: &Tables, old: &[i64], new: &[i64]) -> Result<usize> {
    let old_json = path_json(old);
    let open = &old_json[..old_json.len() - 1];
    let mut stmt = conn.prepare(&format!(
        "SELECT rowid, value FROM {} WHERE value = ?1 OR value LIKE ?2",
        t.index_link
    ))?;
    let rows = stmt
        .query_map(params![old_json, format!("{},%", open)], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut update = conn.prepare(&format!("UPDATE {} SET value = ?1 WHERE rowid = ?2", t.index_link))?;
    for (rowid, value) in &rows {
        let current: Vec<i64> = serde_json::from_str(value)?;
        let mut next: Vec<i64> = new.to_vec();
        next.extend_from_slice(&current[old.len().min(current.len())..]);
        if next.len() > MAX_PARENT_PATH {
            next.drain(..next.len() - MAX_PARENT_PATH);
        }
        update.execute(params![path_json(&next), rowid])?;
    }
    if !rows.is_empty() {
        debug!(rows = rows.len(), "rewrote descendant parent paths");
    }
    Ok(rows.len())
}

pub(crate) fn delete_index_rows(conn: &Connection, t: &Tables, id: i64) -> Result<()> {
    for table in t.index_tables() {
        conn.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
    }
    Ok(())
}

/// Write every secondary index row for `obj`. Grouped attributes are
/// indexed under their own pseudo-object's restrictions.
pub(crate) fn write_index_rows(
    conn: &Connection,
    t: &Tables,
    schema: &Schema,
    delegate: &dyn StoreDelegate,
    obj: &StoredObject,
) -> Result<()> {
    let Some(objref) = obj.objref else {
        return Ok(());
    };
    let extracted = obj.extract_groups(|d| schema.group_type_for(d));
    let mut parts: Vec<(Vec<Attribute>, vellum_schema::RestrictedAttributes)> = Vec::new();
    let root_r = schema.restricted_attributes_for(extracted.root.type_ref(), &obj.labels, &LabelList::empty());
    parts.push((extracted.root.attributes().to_vec(), root_r));
    for (_, mut group) in extracted.groups {
        delegate.label_extracted_object_group(&mut group, obj);
        let r = schema.restricted_attributes_for(group.type_ref(), &group.labels, &LabelList::empty());
        group.delete_attrs(A_TYPE);
        parts.push((group.attributes().to_vec(), r));
    }
    let id = objref.id();
    for (attrs, restricted) in parts {
        for a in attrs {
            let restriction = restricted.hidden_unlock(a.desc).map(LabelList::to_json);
            match &a.value {
                Value::Integer(i) => {
                    conn.execute(
                        &format!("INSERT INTO {}(id, attr_desc, qualifier, value, restrictions) VALUES (?1, ?2, ?3, ?4, ?5)", t.index_int),
                        params![id, a.desc, a.qualifier, i, restriction],
                    )?;
                }
                Value::Ref(target) => {
                    let path = if *target == objref {
                        vec![id]
                    } else {
                        full_obj_id_path(conn, t, *target)?
                    };
                    conn.execute(
                        &format!(
                            "INSERT INTO {}(id, attr_desc, qualifier, value, object_id, restrictions) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            t.index_link
                        ),
                        params![id, a.desc, a.qualifier, path_json(&path), target.id(), restriction],
                    )?;
                }
                Value::DateTime(range) => {
                    conn.execute(
                        &format!(
                            "INSERT INTO {}(id, attr_desc, qualifier, value, value2, restrictions) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            t.index_datetime
                        ),
                        params![id, a.desc, a.qualifier, range.start.timestamp_millis(), range.end.timestamp_millis(), restriction],
                    )?;
                }
                Value::Text(text) => {
                    if let Some(s) = text.to_identifier_index_str() {
                        conn.execute(
                            &format!(
                                "INSERT INTO {}(id, attr_desc, qualifier, value, identifier_type, restrictions) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                                t.index_identifier
                            ),
                            params![id, a.desc, a.qualifier, s, text.kind.typecode(), restriction],
                        )?;
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn mark_dirty(conn: &Connection, app: AppId, id: i64) -> Result<()> {
    conn.execute(&format!("INSERT INTO {}(app_id, obj_id) VALUES (?1, ?2)", DIRTY_TEXT_TABLE), params![app, id])?;
    Ok(())
}

/// Queue every object holding a link whose path runs through `id`.
pub(crate) fn mark_linkers_dirty(conn: &Connection, t: &Tables, app: AppId, id: i64) -> Result<usize> {
    let n = conn.execute(
        &format!(
            "INSERT INTO {dirty}(app_id, obj_id)
             SELECT DISTINCT ?1, l.id FROM {link} l
             WHERE l.id <> ?2 AND EXISTS (SELECT 1 FROM json_each(l.value) WHERE json_each.value = ?2)",
            dirty = DIRTY_TEXT_TABLE,
            link = t.index_link
        ),
        params![app, id],
    )?;
    Ok(n)
}

/// Queue every object linking to an object of one of `types`.
pub(crate) fn mark_type_linkers_dirty(conn: &Connection, t: &Tables, app: AppId, types: &[ObjRef]) -> Result<usize> {
    if types.is_empty() {
        return Ok(0);
    }
    let list: Vec<String> = types.iter().map(|t| t.id().to_string()).collect();
    let n = conn.execute(
        &format!(
            "INSERT INTO {dirty}(app_id, obj_id)
             SELECT DISTINCT ?1, l.id FROM {link} l JOIN {objects} o ON o.id = l.object_id
             WHERE o.type_object_id IN ({types})",
            dirty = DIRTY_TEXT_TABLE,
            link = t.index_link,
            objects = t.objects,
            types = list.join(",")
        ),
        params![app],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_json_is_compact() {
        assert_eq!(path_json(&[1, 22, 333]), "[1,22,333]");
        assert_eq!(path_json(&[]), "[]");
    }
}
