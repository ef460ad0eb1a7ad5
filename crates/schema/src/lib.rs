//! Vellum schema: the slice of the schema model the store needs for
//! restrictions, hierarchical links and text index weighting.
//!
//! A [`Schema`] is built from the schema objects held in the store and is
//! immutable once built. [`SchemaHandle`] publishes one per application.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use vellum_core::consts::*;
use vellum_core::{Desc, LabelList, ObjRef, Qual, StoredObject, Value};

mod handle;
mod inclusion;
mod restrict;

pub use handle::SchemaHandle;
pub use inclusion::{Inclusion, TermInclusionSpec};
pub use restrict::{RestrictedAttributes, Restriction};

/// Types which mark an object as part of the schema.
pub const SCHEMA_OBJECT_TYPES: [ObjRef; 4] =
    [O_TYPE_ATTR_DESC, O_TYPE_QUALIFIER_DESC, O_TYPE_RESTRICTION, O_TYPE_APP_VISIBLE];

/// Relevancy weights by descriptor then qualifier, in text index units.
/// Qualifier [`Q_NULL`] holds the weight for the descriptor as a whole.
pub type AttrWeightings = BTreeMap<Desc, BTreeMap<Qual, i64>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub objref: ObjRef,
    pub title: String,
    pub code: Option<String>,
    pub parent: Option<ObjRef>,
    pub children: Vec<ObjRef>,
    pub behaviours: SmallVec<[ObjRef; 2]>,
    pub relevancy_weight: Option<i64>,
    pub term_inclusion: Option<TermInclusionSpec>,
}

impl TypeDescriptor {
    pub fn is_hierarchical(&self) -> bool {
        self.behaviours.contains(&O_TYPE_BEHAVIOUR_HIERARCHICAL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub desc: Desc,
    pub short_name: String,
    pub code: Option<String>,
    pub data_type: i64,
    /// `(qualifier, weight)` pairs in units of [`RELEVANCY_WEIGHT_MULTIPLIER`].
    pub relevancy_weights: SmallVec<[(Qual, i64); 1]>,
    pub control_by_types: Vec<ObjRef>,
    pub group_type: Option<ObjRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifierDescriptor {
    pub qual: Qual,
    pub short_name: String,
    pub code: Option<String>,
}

/// True for objects whose write must invalidate the schema.
pub fn is_schema_object(obj: &StoredObject) -> bool {
    if obj.objref == Some(O_STORE_OPTIONS) {
        return true;
    }
    obj.labels.contains(O_LABEL_STRUCTURE) && obj.types().any(|t| SCHEMA_OBJECT_TYPES.contains(&t))
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    generation: u64,
    types: FxHashMap<ObjRef, TypeDescriptor>,
    attrs: FxHashMap<Desc, AttributeDescriptor>,
    attrs_by_name: FxHashMap<String, Desc>,
    quals: FxHashMap<Qual, QualifierDescriptor>,
    restrictions: Vec<Restriction>,
    weightings: AttrWeightings,
}

impl Schema {
    pub fn empty(generation: u64) -> Self {
        Self { generation, ..Self::default() }
    }

    /// Build from schema objects. Objects that are not schema objects are
    /// ignored, as are deleted ones.
    pub fn from_objects<'a, I>(generation: u64, objects: I) -> Self
    where
        I: IntoIterator<Item = &'a StoredObject>,
    {
        let mut schema = Schema::empty(generation);
        let mut pending_specs: Vec<(ObjRef, String)> = Vec::new();
        for obj in objects {
            let Some(objref) = obj.objref else { continue };
            if obj.labels.contains(O_LABEL_DELETED) {
                continue;
            }
            match obj.type_ref() {
                Some(t) if t == O_TYPE_APP_VISIBLE => {
                    if let Some(spec) = text_of(obj, A_TERM_INCLUSION_SPEC) {
                        pending_specs.push((objref, spec));
                    }
                    schema.types.insert(objref, type_from(objref, obj));
                }
                Some(t) if t == O_TYPE_ATTR_DESC => {
                    let d = attr_from(objref, obj);
                    schema.attrs_by_name.insert(d.short_name.clone(), d.desc);
                    schema.attrs.insert(d.desc, d);
                }
                Some(t) if t == O_TYPE_QUALIFIER_DESC => {
                    let q = QualifierDescriptor {
                        qual: objref.id(),
                        short_name: text_of(obj, A_ATTR_SHORT_NAME).unwrap_or_default(),
                        code: text_of(obj, A_CODE),
                    };
                    schema.quals.insert(q.qual, q);
                }
                Some(t) if t == O_TYPE_RESTRICTION => schema.restrictions.push(restriction_from(objref, obj)),
                _ => {}
            }
        }
        // well known descriptors resolve by name even before they are defined
        schema.attrs_by_name.entry("title".to_string()).or_insert(A_TITLE);
        schema.attrs_by_name.entry("type".to_string()).or_insert(A_TYPE);
        schema.attrs_by_name.entry("parent".to_string()).or_insert(A_PARENT);
        for (objref, text) in pending_specs {
            let spec = TermInclusionSpec::parse(&text, |n| schema.attrs_by_name.get(n).copied());
            if let Some(t) = schema.types.get_mut(&objref) {
                t.term_inclusion = Some(spec);
            }
        }
        let links: Vec<(ObjRef, ObjRef)> =
            schema.types.values().filter_map(|t| t.parent.map(|p| (p, t.objref))).collect();
        for (parent, child) in links {
            if let Some(p) = schema.types.get_mut(&parent) {
                p.children.push(child);
            }
        }
        for t in schema.types.values_mut() {
            t.children.sort_unstable();
        }
        let root_types: Vec<ObjRef> = schema.types.keys().copied().filter(|t| schema.root_type(*t) == *t).collect();
        let mut restrictions = std::mem::take(&mut schema.restrictions);
        for r in &mut restrictions {
            r.types = schema.resolve_restriction_types(&r.types, &root_types);
        }
        schema.restrictions = restrictions;
        schema.weightings = weightings_from(schema.attrs.values());
        debug!(
            generation,
            types = schema.types.len(),
            attrs = schema.attrs.len(),
            restrictions = schema.restrictions.len(),
            "schema built"
        );
        schema
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn type_descriptor(&self, t: ObjRef) -> Option<&TypeDescriptor> {
        self.types.get(&t)
    }

    pub fn attribute_descriptor(&self, desc: Desc) -> Option<&AttributeDescriptor> {
        self.attrs.get(&desc)
    }

    pub fn qualifier_descriptor(&self, qual: Qual) -> Option<&QualifierDescriptor> {
        self.quals.get(&qual)
    }

    pub fn attr_desc_by_name(&self, name: &str) -> Option<Desc> {
        self.attrs_by_name.get(name).copied()
    }

    pub fn all_types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    /// Follows parent links to the top, stopping on cycles.
    pub fn root_type(&self, t: ObjRef) -> ObjRef {
        let mut current = t;
        for _ in 0..MAX_PARENT_PATH {
            match self.types.get(&current).and_then(|d| d.parent) {
                Some(p) if p != t => current = p,
                _ => break,
            }
        }
        current
    }

    /// `types` plus every descendant type, sorted and unique.
    pub fn types_including_children(&self, types: &[ObjRef]) -> Vec<ObjRef> {
        let mut out: Vec<ObjRef> = Vec::new();
        let mut stack: Vec<ObjRef> = types.to_vec();
        while let Some(t) = stack.pop() {
            if out.contains(&t) {
                continue;
            }
            out.push(t);
            if let Some(d) = self.types.get(&t) {
                stack.extend(d.children.iter().copied());
            }
        }
        out.sort_unstable();
        out
    }

    pub fn is_hierarchical_type(&self, t: ObjRef) -> bool {
        self.types.get(&t).map(TypeDescriptor::is_hierarchical).unwrap_or(false)
    }

    /// A link attribute is matched hierarchically when any type it may
    /// point at is hierarchical.
    pub fn is_hierarchical_link(&self, desc: Desc) -> bool {
        if desc == A_PARENT {
            return true;
        }
        self.attrs
            .get(&desc)
            .map(|d| d.control_by_types.iter().any(|t| self.is_hierarchical_type(*t)))
            .unwrap_or(false)
    }

    pub fn group_type_for(&self, group_desc: Desc) -> Option<ObjRef> {
        self.attrs.get(&group_desc).and_then(|d| d.group_type)
    }

    /// Weight used to scale text relevance of objects of type `t`, in units
    /// of [`RELEVANCY_WEIGHT_MULTIPLIER`].
    pub fn relevancy_weight_for_type(&self, t: ObjRef) -> i64 {
        let mut current = Some(t);
        for _ in 0..MAX_PARENT_PATH {
            let Some(d) = current.and_then(|c| self.types.get(&c)) else {
                break;
            };
            if let Some(w) = d.relevancy_weight {
                return w;
            }
            current = d.parent;
        }
        RELEVANCY_WEIGHT_MULTIPLIER
    }

    /// Types with a relevancy weight other than the default.
    pub fn weighted_types(&self) -> Vec<(ObjRef, i64)> {
        let mut v: Vec<(ObjRef, i64)> = self
            .types
            .keys()
            .map(|t| (*t, self.relevancy_weight_for_type(*t)))
            .filter(|(_, w)| *w != RELEVANCY_WEIGHT_MULTIPLIER)
            .collect();
        v.sort_unstable();
        v
    }

    pub fn term_inclusion_for(&self, t: ObjRef) -> TermInclusionSpec {
        let mut current = Some(t);
        for _ in 0..MAX_PARENT_PATH {
            let Some(d) = current.and_then(|c| self.types.get(&c)) else {
                break;
            };
            if let Some(spec) = &d.term_inclusion {
                return spec.clone();
            }
            current = d.parent;
        }
        TermInclusionSpec::default()
    }

    pub fn attr_weightings_for_indexing(&self) -> &AttrWeightings {
        &self.weightings
    }

    /// Flattened, sorted weightings. Two schemas need a text reindex when
    /// these differ.
    pub fn attr_weightings_sorted(&self) -> Vec<(Desc, Qual, i64)> {
        flatten_weightings(&self.weightings)
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    /// Every label which lifts some restriction.
    pub fn all_restriction_labels(&self) -> LabelList {
        self.restrictions.iter().fold(LabelList::empty(), |acc, r| acc.union(&r.unrestrict_labels))
    }

    /// Restrictions applying to an object of type `t` with `labels`, for a
    /// viewer holding `viewer_unrestrict`.
    pub fn restricted_attributes_for(
        &self,
        t: Option<ObjRef>,
        labels: &LabelList,
        viewer_unrestrict: &LabelList,
    ) -> RestrictedAttributes {
        let Some(root) = t.filter(|t| self.types.contains_key(t)).map(|t| self.root_type(t)) else {
            return RestrictedAttributes::default();
        };
        let rules = self.restrictions.iter().filter(|r| r.applies_to_type(root));
        RestrictedAttributes::collect(rules, labels, viewer_unrestrict)
    }

    /// Root types of the listed types, or every root type when none are
    /// listed. Types missing from the schema are dropped.
    fn resolve_restriction_types(&self, listed: &[ObjRef], root_types: &[ObjRef]) -> Vec<ObjRef> {
        let mut out: Vec<ObjRef> = if listed.is_empty() {
            root_types.to_vec()
        } else {
            listed.iter().filter(|t| self.types.contains_key(t)).map(|t| self.root_type(*t)).collect()
        };
        out.sort_unstable();
        out.dedup();
        out
    }
}

pub fn flatten_weightings(w: &AttrWeightings) -> Vec<(Desc, Qual, i64)> {
    w.iter().flat_map(|(d, qs)| qs.iter().map(move |(q, w)| (*d, *q, *w))).collect()
}

/// Relevancy weight to text index weight. Positive weights never round
/// down to zero.
pub fn scaled_weight(relevancy: i64) -> i64 {
    if relevancy <= 0 {
        return 0;
    }
    let mul = RELEVANCY_WEIGHT_MULTIPLIER / TEXTIDX_WEIGHT_MULTIPLIER;
    ((relevancy + mul / 2) / mul).max(1)
}

/// Convert relevancy weights to text index weights, omitting defaults.
fn weightings_from<'a, I>(attrs: I) -> AttrWeightings
where
    I: IntoIterator<Item = &'a AttributeDescriptor>,
{
    let mut out = AttrWeightings::new();
    for d in attrs {
        for (qual, w) in &d.relevancy_weights {
            if *w == RELEVANCY_WEIGHT_MULTIPLIER {
                continue;
            }
            out.entry(d.desc).or_default().insert(*qual, scaled_weight(*w));
        }
    }
    out
}

fn text_of(obj: &StoredObject, desc: Desc) -> Option<String> {
    obj.first_attr(desc).and_then(Value::as_text).map(|t| t.text.clone())
}

fn int_or_ref(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(*i),
        Value::Ref(r) => Some(r.id()),
        _ => None,
    }
}

fn ints_of(obj: &StoredObject, desc: Desc) -> Vec<i64> {
    obj.attrs_for(desc).filter_map(int_or_ref).collect()
}

fn refs_of(obj: &StoredObject, desc: Desc) -> Vec<ObjRef> {
    obj.attrs_for(desc).filter_map(Value::as_objref).collect()
}

fn type_from(objref: ObjRef, obj: &StoredObject) -> TypeDescriptor {
    TypeDescriptor {
        objref,
        title: obj.title().map(|t| t.text.clone()).unwrap_or_default(),
        code: text_of(obj, A_CODE),
        parent: obj.parent_ref(),
        children: Vec::new(),
        behaviours: obj.attrs_for(A_TYPE_BEHAVIOUR).filter_map(Value::as_objref).collect(),
        relevancy_weight: obj.first_attr(A_RELEVANCY_WEIGHT).and_then(Value::as_integer),
        term_inclusion: None,
    }
}

fn attr_from(objref: ObjRef, obj: &StoredObject) -> AttributeDescriptor {
    AttributeDescriptor {
        desc: objref.id(),
        short_name: text_of(obj, A_ATTR_SHORT_NAME).unwrap_or_else(|| format!("attr{}", objref.id())),
        code: text_of(obj, A_CODE),
        data_type: obj.first_attr(A_ATTR_DATA_TYPE).and_then(Value::as_integer).unwrap_or(0),
        relevancy_weights: obj
            .attributes()
            .iter()
            .filter(|a| a.desc == A_RELEVANCY_WEIGHT)
            .filter_map(|a| a.value.as_integer().map(|w| (a.qualifier, w)))
            .collect(),
        control_by_types: refs_of(obj, A_ATTR_CONTROL_BY_TYPE),
        group_type: obj.first_attr(A_ATTR_GROUP_TYPE).and_then(Value::as_objref),
    }
}

fn restriction_from(objref: ObjRef, obj: &StoredObject) -> Restriction {
    Restriction {
        objref,
        types: refs_of(obj, A_RESTRICTION_TYPE),
        if_labels: LabelList::new(ints_of(obj, A_RESTRICTION_IF_LABEL)),
        unrestrict_labels: LabelList::new(ints_of(obj, A_RESTRICTION_UNRESTRICT_LABEL)),
        hidden: ints_of(obj, A_RESTRICTION_ATTR_RESTRICTED),
        read_only: ints_of(obj, A_RESTRICTION_ATTR_READ_ONLY),
    }
}
