use rusqlite::OptionalExtension;

use vellum_core::consts::{A_TYPE, O_LABEL_UNLABELLED};
use vellum_core::{sort_as_normalise, Attribute, LabelList, ObjRef, Result, StoredObject, Value};
use vellum_persist::{maybe_compress, maybe_decompress, ms_to_datetime};

pub(crate) const ROW_COLUMNS: &str =
    "id, version, labels, creation_time, updated_at, created_by, updated_by, type_object_id, sortas_title, object";

/// Same columns qualified by the `o` alias used in queries.
pub(crate) const ROW_COLUMNS_O: &str =
    "o.id, o.version, o.labels, o.creation_time, o.updated_at, o.created_by, o.updated_by, o.type_object_id, o.sortas_title, o.object";

/// One row of the objects table, or of history without `retired_by`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Row {
    pub id: i64,
    pub version: i64,
    pub labels: String,
    pub creation_time: i64,
    pub updated_at: i64,
    pub created_by: i64,
    pub updated_by: i64,
    pub type_object_id: Option<i64>,
    pub sortas_title: Option<String>,
    pub object: Vec<u8>,
}

impl Row {
    pub fn from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
        Ok(Row {
            id: r.get(0)?,
            version: r.get(1)?,
            labels: r.get(2)?,
            creation_time: r.get(3)?,
            updated_at: r.get(4)?,
            created_by: r.get(5)?,
            updated_by: r.get(6)?,
            type_object_id: r.get(7)?,
            sortas_title: r.get(8)?,
            object: r.get(9)?,
        })
    }

    pub fn decode(&self) -> Result<StoredObject> {
        let attrs: Vec<Attribute> = serde_json::from_slice(&maybe_decompress(&self.object))?;
        let mut obj = StoredObject::with_labels(LabelList::from_json(&self.labels)?);
        obj.set_attributes(attrs);
        obj.objref = ObjRef::new(self.id);
        obj.version = self.version;
        obj.creation_time = Some(ms_to_datetime(self.creation_time));
        obj.update_time = Some(ms_to_datetime(self.updated_at));
        obj.created_by = Some(self.created_by);
        obj.modified_by = Some(self.updated_by);
        Ok(obj)
    }

    pub fn fetch(conn: &rusqlite::Connection, table: &str, id: i64) -> Result<Option<Row>> {
        Ok(conn
            .query_row(&format!("SELECT {} FROM {} WHERE id = ?1", ROW_COLUMNS, table), [id], Row::from_sql)
            .optional()?)
    }

    pub fn labels(&self) -> Result<LabelList> {
        Ok(LabelList::from_json(&self.labels)?)
    }

    /// Build the row for `obj`, which must already carry its final id,
    /// version, labels and provenance.
    pub fn encode(obj: &StoredObject, compress: bool) -> Result<Row> {
        let id = obj.objref.map(|r| r.id()).unwrap_or_default();
        let blob = serde_json::to_vec(obj.attributes())?;
        let labels = if obj.labels.is_empty() {
            LabelList::from([O_LABEL_UNLABELLED])
        } else {
            obj.labels.clone()
        };
        Ok(Row {
            id,
            version: obj.version,
            labels: labels.to_json(),
            creation_time: obj.creation_time.map(|t| t.timestamp_millis()).unwrap_or_default(),
            updated_at: obj.update_time.map(|t| t.timestamp_millis()).unwrap_or_default(),
            created_by: obj.created_by.unwrap_or_default(),
            updated_by: obj.modified_by.unwrap_or_default(),
            type_object_id: obj.first_attr(A_TYPE).and_then(Value::as_objref).map(|r| r.id()),
            sortas_title: obj.title().map(|t| sort_as_normalise(&t.to_sortas_form())),
            object: maybe_compress(&blob, compress),
        })
    }

    pub fn insert(&self, conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<usize> {
        conn.execute(
            &format!("INSERT INTO {}({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)", table, ROW_COLUMNS),
            rusqlite::params![
                self.id,
                self.version,
                self.labels,
                self.creation_time,
                self.updated_at,
                self.created_by,
                self.updated_by,
                self.type_object_id,
                self.sortas_title,
                self.object
            ],
        )
    }
}
