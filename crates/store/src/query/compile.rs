//! Clause tree to SQL. Every clause becomes a sub-select of object ids;
//! containers combine their children with INTERSECT, UNION or EXCEPT.

use rusqlite::types::Value as SqlValue;

use vellum_core::consts::{A_TYPE, O_LABEL_ARCHIVED, O_LABEL_DELETED, RELEVANCY_WEIGHT_MULTIPLIER};
use vellum_core::{sort_as_normalise, Desc, LabelList, Operation, Qual, Result, StoreError};
use vellum_labels::sql::{contains_all, overlaps};
use vellum_persist::Tables;
use vellum_schema::Schema;
use vellum_search::{Hit, Scope, TextIndex, TextQuery, Visibility};

use super::{Clause, Clauses, Container, DeletedObjects, QueryOptions, SortBy, TimeField};
use crate::Actor;

pub(crate) const TEXT_HITS_TABLE: &str = "temp.vellum_text_hits";

/// A compiled query: the outer statement, its parameters and the text
/// hits it joins against.
#[derive(Debug)]
pub(crate) struct Compiled {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub hits: Vec<(usize, Hit)>,
    pub paged_in_sql: bool,
}

pub(crate) struct Compiler<'a> {
    tables: &'a Tables,
    schema: &'a Schema,
    text: &'a TextIndex,
    vis: Visibility,
    params: Vec<SqlValue>,
    hits: Vec<(usize, Hit)>,
    text_clauses: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(tables: &'a Tables, schema: &'a Schema, text: &'a TextIndex, actor: &Actor) -> Self {
        Self { tables, schema, text, vis: actor.visibility(), params: Vec::new(), hits: Vec::new(), text_clauses: 0 }
    }

    fn param(&mut self, v: impl Into<SqlValue>) -> String {
        self.params.push(v.into());
        format!("?{}", self.params.len())
    }

    /// Visibility of restricted index rows for the querying actor.
    fn restriction(&self) -> String {
        if self.vis.superuser {
            "TRUE".to_string()
        } else {
            format!("(restrictions IS NULL OR {})", overlaps("restrictions", &self.vis.unrestrict))
        }
    }

    fn scope(desc: Option<Desc>, qual: Option<Qual>) -> String {
        let mut s = String::new();
        if let Some(d) = desc {
            s.push_str(&format!(" AND attr_desc = {}", d));
        }
        if let Some(q) = qual {
            s.push_str(&format!(" AND qualifier = {}", q));
        }
        s
    }

    fn all_ids(&self) -> String {
        format!("SELECT id FROM {}", self.tables.objects)
    }

    fn no_ids(&self) -> String {
        format!("SELECT id FROM {} WHERE 0", self.tables.objects)
    }

    pub fn container(&mut self, c: &Clauses) -> Result<String> {
        if c.kind == Container::Not && c.children.len() < 2 {
            return Err(StoreError::MalformedQuery(format!(
                "NOT needs at least two clauses, got {}",
                c.children.len()
            )));
        }
        if c.children.is_empty() {
            return Ok(match c.kind {
                Container::And => self.all_ids(),
                _ => self.no_ids(),
            });
        }
        let op = match c.kind {
            Container::And => " INTERSECT ",
            Container::Or => " UNION ",
            Container::Not => " EXCEPT ",
        };
        let parts = c
            .children
            .iter()
            .map(|child| self.clause(child).map(|sql| format!("SELECT id FROM ({})", sql)))
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(op))
    }

    fn clause(&mut self, clause: &Clause) -> Result<String> {
        let t = self.tables;
        Ok(match clause {
            Clause::Container(c) => self.container(c)?,
            Clause::FreeText { text, desc, qual } => {
                let queries = TextQuery::parse(text);
                let scope = match desc {
                    Some(d) => Scope::Field { desc: *d, qual: *qual },
                    None => Scope::Full,
                };
                let n = self.text_clauses;
                self.text_clauses += 1;
                let found = self.text.search(&queries, scope, &self.vis)?;
                self.hits.extend(found.into_iter().map(|h| (n, h)));
                format!("SELECT id FROM {} WHERE clause = {}", TEXT_HITS_TABLE, n)
            }
            Clause::Link { to, desc, qual, exact } => {
                let hierarchical = !exact && desc.map_or(false, |d| self.schema.is_hierarchical_link(d));
                let target = if hierarchical {
                    format!("EXISTS (SELECT 1 FROM json_each(l.value) WHERE json_each.value = {})", to.id())
                } else {
                    format!("object_id = {}", to.id())
                };
                format!("SELECT l.id FROM {} l WHERE {}{} AND {}", t.index_link, target, Self::scope(*desc, *qual), self.restriction())
            }
            Clause::LinkToAny { desc, qual } => format!(
                "SELECT id FROM {} WHERE 1{} AND {}",
                t.index_link,
                Self::scope(Some(*desc), *qual),
                self.restriction()
            ),
            Clause::Identifier { text, desc, qual } => {
                let value = text.to_identifier_index_str().ok_or_else(|| {
                    StoreError::MalformedQuery(format!("{:?} text cannot be searched as an identifier", text.kind))
                })?;
                let p = self.param(value);
                format!(
                    "SELECT id FROM {} WHERE identifier_type = {} AND value = {}{} AND {}",
                    t.index_identifier,
                    text.kind.typecode(),
                    p,
                    Self::scope(*desc, *qual),
                    self.restriction()
                )
            }
            Clause::AnyIdentifierOfType { kind, desc, qual } => format!(
                "SELECT id FROM {} WHERE identifier_type = {}{} AND {}",
                t.index_identifier,
                kind.typecode(),
                Self::scope(*desc, *qual),
                self.restriction()
            ),
            Clause::CreatedByUser(user) => format!("SELECT id FROM {} WHERE created_by = {}", t.objects, user),
            Clause::ObjectTypes { types, with_subtypes } => {
                let types = if *with_subtypes {
                    self.schema.types_including_children(types)
                } else {
                    types.clone()
                };
                if types.is_empty() {
                    self.no_ids()
                } else {
                    let list: Vec<String> = types.iter().map(|r| r.id().to_string()).collect();
                    format!(
                        "SELECT id FROM {} WHERE attr_desc = {} AND object_id IN ({})",
                        t.index_link,
                        A_TYPE,
                        list.join(",")
                    )
                }
            }
            Clause::ExactTitle(title) => {
                let p = self.param(sort_as_normalise(title));
                format!("SELECT id FROM {} WHERE sortas_title = {}", t.objects, p)
            }
            Clause::DateRange { min, max, desc, qual } => {
                let mut cond = String::from("1");
                if let Some(min) = min {
                    cond.push_str(&format!(" AND value2 >= {}", min.timestamp_millis()));
                }
                if let Some(max) = max {
                    cond.push_str(&format!(" AND value < {}", max.timestamp_millis()));
                }
                format!(
                    "SELECT id FROM {} WHERE {}{} AND {}",
                    t.index_datetime,
                    cond,
                    Self::scope(*desc, *qual),
                    self.restriction()
                )
            }
            Clause::MatchNothing => self.no_ids(),
            Clause::LinkedTo { sub, desc, qual } => {
                let inner = self.container(sub)?;
                let hierarchical = desc.map_or(false, |d| self.schema.is_hierarchical_link(d));
                let target = if hierarchical {
                    format!("EXISTS (SELECT 1 FROM json_each(l.value) WHERE json_each.value IN ({}))", inner)
                } else {
                    format!("object_id IN ({})", inner)
                };
                format!("SELECT l.id FROM {} l WHERE {}{} AND {}", t.index_link, target, Self::scope(*desc, *qual), self.restriction())
            }
            Clause::LinkedFrom { sub, desc, qual } => {
                let inner = self.container(sub)?;
                format!(
                    "SELECT object_id AS id FROM {} WHERE id IN ({}){} AND {}",
                    t.index_link,
                    inner,
                    Self::scope(*desc, *qual),
                    self.restriction()
                )
            }
        })
    }

    /// Wrap the root clause in the outer statement with permission,
    /// label and time constraints and ordering.
    pub fn finish(
        mut self,
        root: &Clauses,
        options: &QueryOptions,
        actor: &Actor,
        sort: SortBy,
    ) -> Result<Compiled> {
        let inner = self.container(root)?;
        let t = self.tables;

        let mut excludes = LabelList::empty();
        if options.deleted == DeletedObjects::Exclude {
            excludes = excludes.union(&LabelList::from([O_LABEL_DELETED]));
        }
        if !options.include_archived {
            excludes = excludes.union(&LabelList::from([O_LABEL_ARCHIVED]));
        }
        let mut wheres = vec![
            format!("o.id IN ({})", inner),
            actor.statements.sql_predicate(Operation::Read, "o.labels", &excludes),
        ];
        if options.deleted == DeletedObjects::Only {
            wheres.push(contains_all("o.labels", &LabelList::from([O_LABEL_DELETED])));
        }
        if let Some(any) = &options.any_labels {
            wheres.push(overlaps("o.labels", any));
        }
        if let Some(all) = &options.all_labels {
            wheres.push(contains_all("o.labels", all));
        }
        for i in &options.intervals {
            let column = match i.field {
                TimeField::Creation => "o.creation_time",
                TimeField::Update => "o.updated_at",
            };
            if let Some(min) = i.min {
                wheres.push(format!("{} >= {}", column, min.timestamp_millis()));
            }
            if let Some(max) = i.max {
                wheres.push(format!("{} < {}", column, max.timestamp_millis()));
            }
        }

        let ranked = sort == SortBy::Relevance && root.has_relevance();
        let sort = if sort == SortBy::Relevance && !ranked {
            SortBy::Date
        } else {
            sort
        };
        let (score, join) = if ranked {
            (
                format!("COALESCE(h.score, 0) * {}", self.type_weight_case()),
                format!(
                    " LEFT JOIN (SELECT id, SUM(score) AS score FROM {} GROUP BY id) h ON h.id = o.id",
                    TEXT_HITS_TABLE
                ),
            )
        } else {
            ("0".to_string(), String::new())
        };
        let order = match sort {
            SortBy::Relevance => " ORDER BY 3 DESC, o.id DESC".to_string(),
            SortBy::Date => " ORDER BY o.creation_time DESC, o.id DESC".to_string(),
            SortBy::DateAsc => " ORDER BY o.creation_time ASC, o.id DESC".to_string(),
            SortBy::Title => " ORDER BY o.sortas_title ASC, o.id DESC".to_string(),
            SortBy::TitleDesc => " ORDER BY o.sortas_title DESC, o.id DESC".to_string(),
            SortBy::Any => String::new(),
            SortBy::Field(f) => format!(
                " ORDER BY (SELECT MAX(d.value) FROM {} d WHERE d.id = o.id AND d.attr_desc = {}{}) {}, o.id DESC",
                t.index_datetime,
                f.desc,
                f.qual.map(|q| format!(" AND d.qualifier = {}", q)).unwrap_or_default(),
                if f.ascending { "ASC" } else { "DESC" }
            ),
        };
        // the type filter and counts need every row, so paging happens after
        let paged_in_sql = !options.type_counts;
        let mut limit = String::new();
        if paged_in_sql {
            if let Some(max) = options.maximum_results {
                limit = format!(" LIMIT {} OFFSET {}", max, options.offset);
            } else if options.offset > 0 {
                limit = format!(" LIMIT -1 OFFSET {}", options.offset);
            }
        }
        let sql = format!(
            "SELECT o.id, o.type_object_id, {score} FROM {objects} o{join} WHERE {wheres}{order}{limit}",
            score = score,
            objects = t.objects,
            join = join,
            wheres = wheres.join(" AND "),
            order = order,
            limit = limit
        );
        Ok(Compiled { sql, params: self.params, hits: self.hits, paged_in_sql })
    }

    fn type_weight_case(&self) -> String {
        let weights = self.schema.weighted_types();
        if weights.is_empty() {
            return "1".to_string();
        }
        let arms: Vec<String> =
            weights.iter().map(|(t, w)| format!("WHEN {} THEN {}", t.id(), *w as f64 / RELEVANCY_WEIGHT_MULTIPLIER as f64)).collect();
        format!("(CASE o.type_object_id {} ELSE 1 END)", arms.join(" "))
    }
}
