//! Compositional queries over the object store.
//!
//! A [`Query`] is a root AND container of [`Clause`]s plus options that
//! apply only to the outermost level: permission scoping, deleted and
//! archived handling, label constraints, time intervals and the type
//! filter. Containers nest through closures:
//!
//! ```ignore
//! let mut q = Query::new();
//! q.free_text("contract", None, None).or(|any| {
//!     any.link(ObjRef(600_001), Some(A_PARENT), None);
//!     any.object_types(&[ObjRef(600_002)], true);
//! });
//! let results = store.query(&actor, &q, SortBy::Relevance, Projection::Refs)?;
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use vellum_core::{Desc, LabelList, ObjRef, Qual, StoreError, Text, TextKind, UserId};

mod compile;
mod results;

pub use results::QueryResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    And,
    Or,
    /// First child minus every later child.
    Not,
}

/// A leaf predicate or a nested container.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Container(Clauses),
    FreeText { text: String, desc: Option<Desc>, qual: Option<Qual> },
    /// Links to `to`. Hierarchical descriptors also match links to its
    /// descendants unless `exact` is set.
    Link { to: ObjRef, desc: Option<Desc>, qual: Option<Qual>, exact: bool },
    LinkToAny { desc: Desc, qual: Option<Qual> },
    Identifier { text: Text, desc: Option<Desc>, qual: Option<Qual> },
    AnyIdentifierOfType { kind: TextKind, desc: Option<Desc>, qual: Option<Qual> },
    CreatedByUser(UserId),
    ObjectTypes { types: Vec<ObjRef>, with_subtypes: bool },
    ExactTitle(String),
    DateRange { min: Option<DateTime<Utc>>, max: Option<DateTime<Utc>>, desc: Option<Desc>, qual: Option<Qual> },
    MatchNothing,
    /// Objects with a link into the sub-query's results.
    LinkedTo { sub: Clauses, desc: Option<Desc>, qual: Option<Qual> },
    /// Objects the sub-query's results link to.
    LinkedFrom { sub: Clauses, desc: Option<Desc>, qual: Option<Qual> },
}

/// An ordered list of clauses combined by one container operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Clauses {
    kind: Container,
    children: Vec<Clause>,
}

impl Clauses {
    pub fn new(kind: Container) -> Self {
        Self { kind, children: Vec::new() }
    }

    pub fn kind(&self) -> Container {
        self.kind
    }
    pub fn children(&self) -> &[Clause] {
        &self.children
    }
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn push(&mut self, clause: Clause) -> &mut Self {
        self.children.push(clause);
        self
    }

    fn nested(&mut self, kind: Container, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        let mut c = Clauses::new(kind);
        build(&mut c);
        self.push(Clause::Container(c))
    }

    pub fn and(&mut self, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        self.nested(Container::And, build)
    }
    pub fn or(&mut self, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        self.nested(Container::Or, build)
    }
    pub fn not(&mut self, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        self.nested(Container::Not, build)
    }

    pub fn free_text(&mut self, text: &str, desc: Option<Desc>, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::FreeText { text: text.to_string(), desc, qual })
    }

    pub fn link(&mut self, to: ObjRef, desc: Option<Desc>, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::Link { to, desc, qual, exact: false })
    }

    pub fn link_exact(&mut self, to: ObjRef, desc: Option<Desc>, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::Link { to, desc, qual, exact: true })
    }

    pub fn link_to_any(&mut self, desc: Desc, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::LinkToAny { desc, qual })
    }

    pub fn identifier(&mut self, text: Text, desc: Option<Desc>, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::Identifier { text, desc, qual })
    }

    pub fn any_identifier_of_type(&mut self, kind: TextKind, desc: Option<Desc>, qual: Option<Qual>) -> &mut Self {
        self.push(Clause::AnyIdentifierOfType { kind, desc, qual })
    }

    pub fn created_by_user(&mut self, user: UserId) -> &mut Self {
        self.push(Clause::CreatedByUser(user))
    }

    pub fn object_types(&mut self, types: &[ObjRef], with_subtypes: bool) -> &mut Self {
        self.push(Clause::ObjectTypes { types: types.to_vec(), with_subtypes })
    }

    pub fn exact_title(&mut self, title: &str) -> &mut Self {
        self.push(Clause::ExactTitle(title.to_string()))
    }

    /// Datetime attributes overlapping `[min, max)`. Either end may be open.
    pub fn date_range(
        &mut self,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
        desc: Option<Desc>,
        qual: Option<Qual>,
    ) -> &mut Self {
        self.push(Clause::DateRange { min, max, desc, qual })
    }

    pub fn match_nothing(&mut self) -> &mut Self {
        self.push(Clause::MatchNothing)
    }

    pub fn linked_to(&mut self, desc: Option<Desc>, qual: Option<Qual>, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        let mut sub = Clauses::new(Container::And);
        build(&mut sub);
        self.push(Clause::LinkedTo { sub, desc, qual })
    }

    pub fn linked_from(&mut self, desc: Option<Desc>, qual: Option<Qual>, build: impl FnOnce(&mut Clauses)) -> &mut Self {
        let mut sub = Clauses::new(Container::And);
        build(&mut sub);
        self.push(Clause::LinkedFrom { sub, desc, qual })
    }

    /// Whether any free text clause can rank results.
    pub fn has_relevance(&self) -> bool {
        self.children.iter().any(|c| match c {
            Clause::FreeText { .. } => true,
            Clause::Container(inner) => inner.kind != Container::Not && inner.has_relevance(),
            _ => false,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletedObjects {
    #[default]
    Exclude,
    Only,
    Include,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Creation,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TimeInterval {
    pub field: TimeField,
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct QueryOptions {
    pub deleted: DeletedObjects,
    pub include_archived: bool,
    pub any_labels: Option<LabelList>,
    pub all_labels: Option<LabelList>,
    pub intervals: Vec<TimeInterval>,
    pub offset: usize,
    pub maximum_results: Option<usize>,
    pub type_filter: Option<(Vec<ObjRef>, bool)>,
    pub type_counts: bool,
}

/// A root AND container and the options of the outer query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    root: Clauses,
    pub(crate) options: QueryOptions,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Query {
    type Target = Clauses;
    fn deref(&self) -> &Clauses {
        &self.root
    }
}

impl DerefMut for Query {
    fn deref_mut(&mut self) -> &mut Clauses {
        &mut self.root
    }
}

impl Query {
    pub fn new() -> Self {
        Self { root: Clauses::new(Container::And), options: QueryOptions::default() }
    }

    pub fn root(&self) -> &Clauses {
        &self.root
    }

    pub fn deleted_objects(&mut self, deleted: DeletedObjects) -> &mut Self {
        self.options.deleted = deleted;
        self
    }

    pub fn include_archived_objects(&mut self, include: bool) -> &mut Self {
        self.options.include_archived = include;
        self
    }

    /// Only objects carrying at least one of `labels`.
    pub fn any_label(&mut self, labels: LabelList) -> &mut Self {
        self.options.any_labels = Some(labels);
        self
    }

    /// Only objects carrying every one of `labels`.
    pub fn all_labels(&mut self, labels: LabelList) -> &mut Self {
        self.options.all_labels = Some(labels);
        self
    }

    pub fn constrain_to_time_interval(
        &mut self,
        field: TimeField,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> &mut Self {
        self.options.intervals.push(TimeInterval { field, min, max });
        self
    }

    pub fn offset(&mut self, offset: usize) -> &mut Self {
        self.options.offset = offset;
        self
    }

    pub fn maximum_results(&mut self, max: usize) -> &mut Self {
        self.options.maximum_results = Some(max);
        self
    }

    /// Keep only objects of `types`, counting every type seen on the way.
    pub fn filter_by_types(&mut self, types: &[ObjRef], with_subtypes: bool) -> &mut Self {
        self.options.type_filter = Some((types.to_vec(), with_subtypes));
        self.options.type_counts = true;
        self
    }

    pub fn with_type_counts(&mut self) -> &mut Self {
        self.options.type_counts = true;
        self
    }
}

/// Sort on the latest value of a datetime attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSort {
    pub desc: Desc,
    pub qual: Option<Qual>,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Falls back to [`SortBy::Date`] when nothing can be ranked.
    Relevance,
    #[default]
    Date,
    DateAsc,
    Title,
    TitleDesc,
    Any,
    Field(DateSort),
}

impl FromStr for SortBy {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "relevance" => SortBy::Relevance,
            "date" => SortBy::Date,
            "date_asc" => SortBy::DateAsc,
            "title" => SortBy::Title,
            "title_desc" => SortBy::TitleDesc,
            "any" => SortBy::Any,
            other => return Err(StoreError::MalformedQuery(format!("unknown sort: {}", other))),
        })
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortBy::Relevance => f.write_str("relevance"),
            SortBy::Date => f.write_str("date"),
            SortBy::DateAsc => f.write_str("date_asc"),
            SortBy::Title => f.write_str("title"),
            SortBy::TitleDesc => f.write_str("title_desc"),
            SortBy::Any => f.write_str("any"),
            SortBy::Field(d) => write!(f, "field:{}", d.desc),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    #[default]
    Refs,
    /// Load the first chunk of objects with the ids.
    Objects,
}
