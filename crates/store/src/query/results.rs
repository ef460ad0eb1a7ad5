use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::histogram;
use rusqlite::params_from_iter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use vellum_core::consts::RESULTS_CHUNK_LOAD_SIZE;
use vellum_core::{ObjRef, Result, StoreError, StoredObject};
use vellum_persist::Db;
use vellum_search::TextQuery;

use super::compile::{Compiler, TEXT_HITS_TABLE};
use super::{Clause, Clauses, Projection, Query, SortBy};
use crate::codec::{Row, ROW_COLUMNS_O};
use crate::{Actor, ObjectStore};

/// Ids matched by a query, in order, with objects loaded in chunks on
/// demand and kept for the life of the results.
pub struct QueryResults {
    db: Arc<Db>,
    objects_table: String,
    ids: Vec<ObjRef>,
    loaded: Mutex<FxHashMap<ObjRef, Arc<StoredObject>>>,
    type_counts: Option<BTreeMap<ObjRef, usize>>,
    unfiltered_count: Option<usize>,
    highlight: Vec<String>,
}

impl std::fmt::Debug for QueryResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResults").field("ids", &self.ids).field("type_counts", &self.type_counts).finish()
    }
}

impl QueryResults {
    pub fn len(&self) -> usize {
        self.ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
    pub fn objrefs(&self) -> &[ObjRef] {
        &self.ids
    }

    /// Objects per type among all matches, before the type filter.
    pub fn type_counts(&self) -> Option<&BTreeMap<ObjRef, usize>> {
        self.type_counts.as_ref()
    }

    /// Matches before the type filter and paging. Only known when type
    /// counts were requested.
    pub fn unfiltered_count(&self) -> Option<usize> {
        self.unfiltered_count
    }

    /// Words from free text clauses, for highlighting.
    pub fn highlight_words(&self) -> &[String] {
        &self.highlight
    }

    pub fn object_at(&self, index: usize) -> Result<Arc<StoredObject>> {
        let objref = *self
            .ids
            .get(index)
            .ok_or_else(|| StoreError::InvalidObject(format!("result index {} out of range", index)))?;
        if let Some(obj) = self.loaded.lock()?.get(&objref) {
            return Ok(obj.clone());
        }
        self.load_chunk(index)?;
        self.loaded.lock()?.get(&objref).cloned().ok_or(StoreError::NotFound(objref))
    }

    pub fn objects(&self) -> impl Iterator<Item = Result<Arc<StoredObject>>> + '_ {
        (0..self.ids.len()).map(move |i| self.object_at(i))
    }

    fn load_chunk(&self, start: usize) -> Result<()> {
        let end = (start + RESULTS_CHUNK_LOAD_SIZE).min(self.ids.len());
        let chunk = &self.ids[start..end];
        if chunk.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = chunk.iter().map(|r| r.id().to_string()).collect();
        let rows = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} o WHERE o.id IN ({})",
                ROW_COLUMNS_O,
                self.objects_table,
                list.join(",")
            ))?;
            let rows = stmt.query_map([], Row::from_sql)?.collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let mut loaded = self.loaded.lock()?;
        for row in &rows {
            let obj = row.decode()?;
            if let Some(r) = obj.objref {
                loaded.insert(r, Arc::new(obj));
            }
        }
        debug!(start, loaded = rows.len(), "result chunk loaded");
        Ok(())
    }
}

fn highlight_words(c: &Clauses, out: &mut Vec<String>) {
    for child in c.children() {
        match child {
            Clause::FreeText { text, .. } => {
                for q in TextQuery::parse(text) {
                    out.extend(q.highlight_words().into_iter().map(str::to_string));
                }
            }
            Clause::Container(inner) => highlight_words(inner, out),
            _ => {}
        }
    }
}

impl ObjectStore {
    /// Run `query` as `actor`. Only objects the actor may read are
    /// returned.
    pub fn query(&self, actor: &Actor, query: &Query, sort: SortBy, projection: Projection) -> Result<QueryResults> {
        let started = Instant::now();
        let schema = self.schema()?;
        // text searches lock the connection themselves, so they run first
        let compiled = Compiler::new(&self.tables, &schema, &self.text, actor).finish(query.root(), &query.options, actor, sort)?;
        let opts = &query.options;

        let rows: Vec<(i64, Option<i64>)> = {
            let conn = self.db.lock()?;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {t} (clause INTEGER NOT NULL, id INTEGER NOT NULL, score REAL NOT NULL);
                 DELETE FROM {t};",
                t = TEXT_HITS_TABLE
            ))?;
            if !compiled.hits.is_empty() {
                let mut insert =
                    conn.prepare(&format!("INSERT INTO {}(clause, id, score) VALUES (?1, ?2, ?3)", TEXT_HITS_TABLE))?;
                for (clause, hit) in &compiled.hits {
                    insert.execute(rusqlite::params![*clause as i64, hit.doc, hit.score])?;
                }
            }
            let mut stmt = conn.prepare(&compiled.sql)?;
            let rows = stmt
                .query_map(params_from_iter(compiled.params.iter()), |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut unfiltered_count = None;
        let mut type_counts = None;
        let ids: Vec<ObjRef> = if compiled.paged_in_sql {
            rows.iter().filter_map(|(id, _)| ObjRef::new(*id)).collect()
        } else {
            let mut counts: BTreeMap<ObjRef, usize> = BTreeMap::new();
            for (_, t) in &rows {
                if let Some(t) = t.and_then(ObjRef::new) {
                    *counts.entry(t).or_default() += 1;
                }
            }
            type_counts = Some(counts);
            unfiltered_count = Some(rows.len());
            let wanted: Option<FxHashSet<i64>> = opts.type_filter.as_ref().map(|(types, with_subtypes)| {
                let types = if *with_subtypes {
                    schema.types_including_children(types)
                } else {
                    types.clone()
                };
                types.iter().map(|t| t.id()).collect()
            });
            rows.iter()
                .filter(|(_, t)| match &wanted {
                    Some(w) => t.map_or(false, |t| w.contains(&t)),
                    None => true,
                })
                .filter_map(|(id, _)| ObjRef::new(*id))
                .skip(opts.offset)
                .take(opts.maximum_results.unwrap_or(usize::MAX))
                .collect()
        };

        let mut highlight = Vec::new();
        highlight_words(query.root(), &mut highlight);
        let results = QueryResults {
            db: self.db.clone(),
            objects_table: self.tables.objects.clone(),
            ids,
            loaded: Mutex::new(FxHashMap::default()),
            type_counts,
            unfiltered_count,
            highlight,
        };
        if projection == Projection::Objects {
            results.load_chunk(0)?;
        }
        histogram!("query_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(app = self.app, results = results.len(), %sort, "query executed");
        Ok(results)
    }

    /// The free text with unknown words replaced by their closest
    /// indexed terms, when any word was replaced.
    pub fn suggest_spelling(&self, text: &str) -> Result<Option<String>> {
        self.text.suggest(text)
    }
}
