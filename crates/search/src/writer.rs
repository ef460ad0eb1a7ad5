use std::sync::Arc;

use rusqlite::params;
use tracing::debug;

use vellum_core::{LabelList, Result};
use vellum_persist::Db;

use crate::tokenize::{stem, tokenize};
use crate::TextTables;

#[derive(Debug, Clone)]
struct Posting {
    field: Option<String>,
    term: String,
    stem: String,
    pos: u32,
    weight: i64,
    restriction: Option<String>,
}

#[derive(Debug)]
enum Op {
    Replace { doc: i64, postings: Vec<Posting> },
    Delete(i64),
}

/// Batches document replacements and deletions, written in a single
/// transaction by [`commit`](IndexWriter::commit).
pub struct IndexWriter {
    db: Arc<Db>,
    tables: TextTables,
    ops: Vec<Op>,
    current: Option<(i64, Vec<Posting>)>,
}

impl IndexWriter {
    pub(crate) fn new(db: Arc<Db>, tables: TextTables) -> Self {
        Self { db, tables, ops: Vec::new(), current: None }
    }

    /// Begin replacing `doc`. Any unfinished document is finished first.
    pub fn start_document(&mut self, doc: i64) {
        self.finish_document();
        self.current = Some((doc, Vec::new()));
    }

    /// Tokenise `text` into the current document starting at `pos` and
    /// return the next free position.
    ///
    /// Terms always go to the full index. Each prefix additionally posts
    /// the terms to the fields index under that prefix. A restriction
    /// makes the postings visible only to holders of one of its labels.
    pub fn post_terms(
        &mut self,
        text: &str,
        restriction: Option<&LabelList>,
        prefix1: Option<&str>,
        prefix2: Option<&str>,
        pos: u32,
        weight: i64,
    ) -> u32 {
        let Some((_, postings)) = self.current.as_mut() else {
            return pos;
        };
        let restriction = restriction.map(LabelList::to_json);
        let mut p = pos;
        for word in tokenize(text) {
            let s = stem(&word);
            let fields = std::iter::once(None).chain([prefix1, prefix2].into_iter().flatten().map(Some));
            for field in fields {
                postings.push(Posting {
                    field: field.map(str::to_string),
                    term: field.map(|f| format!("{}{}", f, word)).unwrap_or_else(|| word.clone()),
                    stem: field.map(|f| format!("{}{}", f, s)).unwrap_or_else(|| s.clone()),
                    pos: p,
                    weight,
                    restriction: restriction.clone(),
                });
            }
            p += 1;
        }
        p
    }

    pub fn finish_document(&mut self) {
        if let Some((doc, postings)) = self.current.take() {
            self.ops.push(Op::Replace { doc, postings });
        }
    }

    pub fn delete_document(&mut self, doc: i64) {
        self.finish_document();
        self.ops.push(Op::Delete(doc));
    }

    pub fn pending(&self) -> usize {
        self.ops.len() + usize::from(self.current.is_some())
    }

    /// Write every batched operation. Returns the number of documents
    /// touched.
    pub fn commit(mut self) -> Result<usize> {
        self.finish_document();
        if self.ops.is_empty() {
            return Ok(0);
        }
        let t = &self.tables;
        let ops = &self.ops;
        self.db.serializable(|tx| {
            let mut del_full = tx.prepare_cached(&format!("DELETE FROM {} WHERE doc = ?1", t.full))?;
            let mut del_fields = tx.prepare_cached(&format!("DELETE FROM {} WHERE doc = ?1", t.fields))?;
            let sql = |table: &str| {
                format!("INSERT INTO {}(doc, term, stem, pos, weight, restriction) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", table)
            };
            let mut ins_full = tx.prepare_cached(&sql(&t.full))?;
            let mut ins_fields = tx.prepare_cached(&sql(&t.fields))?;
            for op in ops {
                let (doc, postings) = match op {
                    Op::Replace { doc, postings } => (*doc, Some(postings)),
                    Op::Delete(doc) => (*doc, None),
                };
                del_full.execute([doc])?;
                del_fields.execute([doc])?;
                for p in postings.into_iter().flatten() {
                    let stmt = if p.field.is_some() {
                        &mut ins_fields
                    } else {
                        &mut ins_full
                    };
                    stmt.execute(params![doc, p.term, p.stem, p.pos, p.weight, p.restriction])?;
                }
            }
            Ok(())
        })?;
        debug!(docs = self.ops.len(), "text index batch committed");
        Ok(self.ops.len())
    }
}
