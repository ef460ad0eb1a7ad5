//! Vellum search: an inverted text index kept in SQLite next to the
//! object store.
//!
//! Each application has a full index (every term of a document) and a
//! fields index (terms prefixed by descriptor, or descriptor and
//! qualifier). Postings may carry a restriction label set, which hides
//! them from viewers holding none of those labels.

#![forbid(unsafe_code)]

use std::sync::Arc;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rusqlite::{Connection, OptionalExtension};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use vellum_core::{AppId, Desc, LabelList, Qual, Result, StoreError};
use vellum_labels::sql::overlaps;
use vellum_persist::Db;

mod query;
mod tokenize;
mod writer;

pub use query::TextQuery;
pub use tokenize::{stem, tokenize};
pub use writer::IndexWriter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub doc: i64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct TextTables {
    pub full: String,
    pub fields: String,
}

/// Which index a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Full,
    Field { desc: Desc, qual: Option<Qual> },
}

impl Scope {
    fn prefix(&self) -> String {
        match self {
            Scope::Full => String::new(),
            Scope::Field { desc, qual } => field_prefix(*desc, *qual),
        }
    }
}

/// Prefix of fields index terms: `<desc>:` or `<desc>_<qual>:` in base 36.
pub fn field_prefix(desc: Desc, qual: Option<Qual>) -> String {
    match qual {
        Some(q) if q != 0 => format!("{}_{}:", base36(desc), base36(q)),
        _ => format!("{}:", base36(desc)),
    }
}

fn base36(mut n: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Who is searching. Restricted postings are visible to superusers and to
/// viewers holding one of the posting's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visibility {
    pub superuser: bool,
    pub unrestrict: LabelList,
}

impl Visibility {
    pub fn superuser() -> Self {
        Self { superuser: true, unrestrict: LabelList::empty() }
    }

    pub fn with_labels(unrestrict: LabelList) -> Self {
        Self { superuser: false, unrestrict }
    }

    fn sql(&self) -> String {
        if self.superuser {
            "TRUE".to_string()
        } else {
            format!("restriction IS NULL OR {}", overlaps("restriction", &self.unrestrict))
        }
    }
}

/// Per-application handle on the text index.
#[derive(Clone)]
pub struct TextIndex {
    db: Arc<Db>,
    app: AppId,
    tables: TextTables,
}

impl TextIndex {
    pub fn open(db: Arc<Db>, app: AppId) -> Result<Self> {
        let tables = TextTables { full: format!("a{}_textidx_full", app), fields: format!("a{}_textidx_fields", app) };
        {
            let conn = db.lock()?;
            for t in [&tables.full, &tables.fields] {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {t} (
                        doc INTEGER NOT NULL, term TEXT NOT NULL, stem TEXT NOT NULL,
                        pos INTEGER NOT NULL, weight INTEGER NOT NULL, restriction TEXT
                     );
                     CREATE INDEX IF NOT EXISTS idx_{t}_term ON {t}(term);
                     CREATE INDEX IF NOT EXISTS idx_{t}_stem ON {t}(stem);
                     CREATE INDEX IF NOT EXISTS idx_{t}_doc ON {t}(doc);",
                    t = t
                ))?;
            }
        }
        Ok(Self { db, app, tables })
    }

    pub fn app(&self) -> AppId {
        self.app
    }

    pub fn writer(&self) -> IndexWriter {
        IndexWriter::new(self.db.clone(), self.tables.clone())
    }

    /// Documents matching every query element, best first. Ties go to the
    /// higher doc id.
    pub fn search(&self, queries: &[TextQuery], scope: Scope, vis: &Visibility) -> Result<Vec<Hit>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let started = std::time::Instant::now();
        let conn = self.db.lock()?;
        let table = match scope {
            Scope::Full => &self.tables.full,
            Scope::Field { .. } => &self.tables.fields,
        };
        let prefix = scope.prefix();
        let total: i64 = conn.query_row(&format!("SELECT COUNT(DISTINCT doc) FROM {}", table), [], |r| r.get(0))?;
        let mut acc: Option<FxHashMap<i64, f64>> = None;
        for q in queries {
            let scores = match q {
                TextQuery::Term { word, prefix: true } => {
                    let p = postings(&conn, table, "term GLOB ?1", &format!("{}{}*", prefix, word), vis)?;
                    sum_by_doc(p.iter().map(|(d, _, w)| (*d, *w)))
                }
                TextQuery::Term { word, prefix: false } => {
                    let p = postings(&conn, table, "stem = ?1", &format!("{}{}", prefix, stem(word)), vis)?;
                    sum_by_doc(p.iter().map(|(d, _, w)| (*d, *w)))
                }
                TextQuery::Phrase { words, stemmed } => {
                    let mut lists = Vec::with_capacity(words.len());
                    for w in words {
                        let (cond, key) = if *stemmed {
                            ("stem = ?1", format!("{}{}", prefix, stem(w)))
                        } else {
                            ("term = ?1", format!("{}{}", prefix, w))
                        };
                        lists.push(postings(&conn, table, cond, &key, vis)?);
                    }
                    phrase_matches(&lists)
                }
                TextQuery::Near { a, b, within } => {
                    let pa = postings(&conn, table, "stem = ?1", &format!("{}{}", prefix, stem(a)), vis)?;
                    let pb = postings(&conn, table, "stem = ?1", &format!("{}{}", prefix, stem(b)), vis)?;
                    near_matches(&pa, &pb, *within)
                }
            };
            let idf = (1.0 + total as f64 / scores.len().max(1) as f64).ln();
            let scaled: FxHashMap<i64, f64> = scores.into_iter().map(|(d, s)| (d, s * idf)).collect();
            acc = Some(match acc {
                None => scaled,
                Some(prev) => prev
                    .into_iter()
                    .filter_map(|(d, s)| scaled.get(&d).map(|s2| (d, s + s2)))
                    .collect(),
            });
        }
        let mut hits: Vec<Hit> = acc.unwrap_or_default().into_iter().map(|(doc, score)| Hit { doc, score }).collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.doc.cmp(&a.doc)));
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        debug!(app = self.app, hits = hits.len(), "text search");
        Ok(hits)
    }

    /// Rewrites unknown words to their closest indexed term. `None` when
    /// every word is known or nothing close enough exists.
    pub fn suggest(&self, input: &str) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        let words = tokenize(input);
        let mut changed = false;
        let mut out: Vec<String> = Vec::with_capacity(words.len());
        for word in words {
            let known: Option<i64> = conn
                .query_row(&format!("SELECT 1 FROM {} WHERE term = ?1 LIMIT 1", self.tables.full), [&word], |r| r.get(0))
                .optional()?;
            if known.is_some() {
                out.push(word);
                continue;
            }
            let first: String = word.chars().take(1).collect();
            let mut stmt =
                conn.prepare_cached(&format!("SELECT DISTINCT term FROM {} WHERE term GLOB ?1 LIMIT 5000", self.tables.full))?;
            let candidates = stmt
                .query_map([format!("{}*", first)], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let best = candidates
                .into_iter()
                .filter(|c| strsim::damerau_levenshtein(&word, c) <= 2)
                .map(|c| (strsim::jaro_winkler(&word, &c), c))
                .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
            match best {
                Some((_, c)) => {
                    changed = true;
                    out.push(c);
                }
                None => out.push(word),
            }
        }
        Ok(changed.then(|| out.join(" ")))
    }

    /// Indexed terms fuzzily matching `fragment`, best first.
    pub fn complete(&self, fragment: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT term, COUNT(*) AS n FROM {} GROUP BY term ORDER BY n DESC, term LIMIT 5000",
            self.tables.full
        ))?;
        let terms = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, String)> = terms
            .into_iter()
            .filter_map(|t| matcher.fuzzy_match(&t, fragment).map(|s| (s, t)))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.len().cmp(&b.1.len())).then_with(|| a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(limit).map(|(_, t)| t).collect())
    }

    /// Distinct terms in the full index.
    pub fn term_count(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(DISTINCT term) FROM {}", self.tables.full), [], |r| r.get(0))?;
        metrics::gauge!("search_terms", n as f64);
        Ok(n as usize)
    }

    pub fn document_count(&self) -> Result<usize> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(DISTINCT doc) FROM {}", self.tables.full), [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// `(term, restriction)` postings of one document, for inspection.
    pub fn document_terms(&self, doc: i64, scope: Scope) -> Result<Vec<(String, Option<LabelList>)>> {
        let conn = self.db.lock()?;
        let table = if scope == Scope::Full {
            &self.tables.full
        } else {
            &self.tables.fields
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT term, restriction FROM {} WHERE doc = ?1 AND term GLOB ?2 ORDER BY pos, term",
            table
        ))?;
        let rows = stmt.query_map(rusqlite::params![doc, format!("{}*", scope.prefix())], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (term, restriction) = row?;
            let restriction = restriction.map(|s| LabelList::from_json(&s)).transpose()?;
            out.push((term, restriction));
        }
        Ok(out)
    }
}

type Posting = (i64, u32, i64);

fn postings(conn: &Connection, table: &str, cond: &str, key: &str, vis: &Visibility) -> Result<Vec<Posting>> {
    let sql = format!("SELECT doc, pos, weight FROM {} WHERE {} AND ({})", table, cond, vis.sql());
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([key], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
}

fn sum_by_doc<I: Iterator<Item = (i64, i64)>>(it: I) -> FxHashMap<i64, f64> {
    let mut m: FxHashMap<i64, f64> = FxHashMap::default();
    for (doc, w) in it {
        *m.entry(doc).or_default() += w as f64;
    }
    m
}

fn positions(list: &[Posting]) -> FxHashMap<i64, FxHashMap<u32, i64>> {
    let mut m: FxHashMap<i64, FxHashMap<u32, i64>> = FxHashMap::default();
    for (doc, pos, w) in list {
        m.entry(*doc).or_default().insert(*pos, *w);
    }
    m
}

fn phrase_matches(lists: &[Vec<Posting>]) -> FxHashMap<i64, f64> {
    let mut out = FxHashMap::default();
    let Some((first, rest)) = lists.split_first() else {
        return out;
    };
    let rest: Vec<_> = rest.iter().map(|l| positions(l)).collect();
    for (doc, start, w) in first {
        let mut score = *w as f64;
        let matched = rest.iter().enumerate().all(|(i, m)| {
            match m.get(doc).and_then(|p| p.get(&(start + i as u32 + 1))) {
                Some(w) => {
                    score += *w as f64;
                    true
                }
                None => false,
            }
        });
        if matched {
            *out.entry(*doc).or_default() += score;
        }
    }
    out
}

fn near_matches(a: &[Posting], b: &[Posting], within: u32) -> FxHashMap<i64, f64> {
    let pb = positions(b);
    let mut out = FxHashMap::default();
    let mut seen: FxHashSet<(i64, u32)> = FxHashSet::default();
    for (doc, pos, w) in a {
        let Some(bs) = pb.get(doc) else { continue };
        for (bpos, bw) in bs {
            if bpos != pos && bpos.abs_diff(*pos) <= within && seen.insert((*doc, *bpos)) {
                *out.entry(*doc).or_default() += (*w + *bw) as f64;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_persist::StoreConfig;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("vellum-search-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn index() -> TextIndex {
        let db = Arc::new(Db::open(StoreConfig::default().with_db_path(temp_db())).unwrap());
        TextIndex::open(db, 1).unwrap()
    }

    #[test]
    fn base36_prefixes() {
        assert_eq!(field_prefix(211, None), "5v:");
        assert_eq!(field_prefix(211, Some(0)), "5v:");
        assert_eq!(field_prefix(211, Some(36)), "5v_10:");
    }

    #[test]
    fn phrase_and_near() {
        let idx = index();
        let mut w = idx.writer();
        w.start_document(1);
        w.post_terms("the signed contract was filed", None, None, None, 0, 4);
        w.start_document(2);
        w.post_terms("contract not yet signed", None, None, None, 0, 4);
        assert_eq!(w.commit().unwrap(), 2);
        let vis = Visibility::superuser();
        let q = TextQuery::parse(r#""signed contract""#);
        let hits = idx.search(&q, Scope::Full, &vis).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![1]);
        let q = TextQuery::parse("contract /3 signed");
        let mut docs: Vec<i64> = idx.search(&q, Scope::Full, &vis).unwrap().iter().map(|h| h.doc).collect();
        docs.sort();
        assert_eq!(docs, vec![1, 2]);
        let q = TextQuery::parse("contract /1 filed");
        assert!(idx.search(&q, Scope::Full, &vis).unwrap().is_empty());
    }

    #[test]
    fn restricted_postings_need_labels() {
        let idx = index();
        let mut w = idx.writer();
        w.start_document(5);
        w.post_terms("public", None, Some("a:"), None, 0, 4);
        w.post_terms("secret", Some(&LabelList::from([60])), Some("b:"), None, 10, 4);
        w.commit().unwrap();
        let q = vec![TextQuery::term("secret")];
        assert!(idx.search(&q, Scope::Full, &Visibility::default()).unwrap().is_empty());
        assert_eq!(idx.search(&q, Scope::Full, &Visibility::with_labels(LabelList::from([60]))).unwrap().len(), 1);
        assert_eq!(idx.search(&q, Scope::Full, &Visibility::superuser()).unwrap().len(), 1);
        let field = Scope::Field { desc: 11, qual: None };
        assert_eq!(idx.search(&q, field, &Visibility::superuser()).unwrap().len(), 1);
        let terms = idx.document_terms(5, Scope::Full).unwrap();
        assert_eq!(terms[0], ("public".to_string(), None));
    }

    #[test]
    fn delete_and_suggest() {
        let idx = index();
        let mut w = idx.writer();
        w.start_document(1);
        w.post_terms("contract negotiation", None, None, None, 0, 4);
        w.start_document(2);
        w.post_terms("contract", None, None, None, 0, 4);
        w.commit().unwrap();
        assert_eq!(idx.suggest("contarct").unwrap().as_deref(), Some("contract"));
        assert_eq!(idx.suggest("contract").unwrap(), None);
        assert_eq!(idx.complete("negt", 5).unwrap(), vec!["negotiation".to_string()]);
        let mut w = idx.writer();
        w.delete_document(1);
        w.commit().unwrap();
        assert_eq!(idx.document_count().unwrap(), 1);
        assert_eq!(idx.term_count().unwrap(), 1);
    }
}
