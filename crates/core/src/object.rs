use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::{A_PARENT, A_TITLE, A_TYPE, Q_NULL};
use crate::{Desc, LabelList, ObjRef, Qual, Text, UserId, Value};

/// Marks an attribute as belonging to a nested sub-object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrGroup {
    pub desc: Desc,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub desc: Desc,
    #[serde(default, skip_serializing_if = "is_null_qual")]
    pub qualifier: Qual,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<AttrGroup>,
}

fn is_null_qual(q: &Qual) -> bool {
    *q == Q_NULL
}

/// A versioned bag of attributes.
///
/// Objects handed out by the store are shared behind `Arc` and therefore
/// immutable; clone one to make changes and pass the clone to `update`.
/// Provenance fields are overwritten by the store on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub objref: Option<ObjRef>,
    /// 0 until first persisted.
    pub version: i64,
    pub labels: LabelList,
    attrs: Vec<Attribute>,
    pub creation_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub created_by: Option<UserId>,
    pub modified_by: Option<UserId>,
}

impl Default for StoredObject {
    fn default() -> Self {
        Self::new()
    }
}

impl StoredObject {
    pub fn new() -> Self {
        Self {
            objref: None,
            version: 0,
            labels: LabelList::empty(),
            attrs: Vec::new(),
            creation_time: None,
            update_time: None,
            created_by: None,
            modified_by: None,
        }
    }

    pub fn with_labels(labels: LabelList) -> Self {
        Self { labels, ..Self::new() }
    }

    pub fn is_persisted(&self) -> bool {
        self.version > 0
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn set_attributes(&mut self, attrs: Vec<Attribute>) {
        self.attrs = attrs;
    }

    pub fn add_attr(&mut self, value: impl Into<Value>, desc: Desc) -> &mut Self {
        self.add_attr_q(value, desc, Q_NULL)
    }

    pub fn add_attr_q(&mut self, value: impl Into<Value>, desc: Desc, qualifier: Qual) -> &mut Self {
        self.attrs.push(Attribute { desc, qualifier, value: value.into(), group: None });
        self
    }

    pub fn add_grouped_attr(&mut self, value: impl Into<Value>, desc: Desc, qualifier: Qual, group: AttrGroup) -> &mut Self {
        self.attrs.push(Attribute { desc, qualifier, value: value.into(), group: Some(group) });
        self
    }

    /// Removes every attribute with `desc`, returning how many went.
    pub fn delete_attrs(&mut self, desc: Desc) -> usize {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.desc != desc);
        before - self.attrs.len()
    }

    pub fn first_attr(&self, desc: Desc) -> Option<&Value> {
        self.attrs.iter().find(|a| a.desc == desc).map(|a| &a.value)
    }

    pub fn first_attr_q(&self, desc: Desc, qualifier: Qual) -> Option<&Value> {
        self.attrs.iter().find(|a| a.desc == desc && a.qualifier == qualifier).map(|a| &a.value)
    }

    pub fn attrs_for(&self, desc: Desc) -> impl Iterator<Item = &Value> + '_ {
        self.attrs.iter().filter(move |a| a.desc == desc).map(|a| &a.value)
    }

    pub fn has_attr(&self, desc: Desc) -> bool {
        self.attrs.iter().any(|a| a.desc == desc)
    }

    pub fn title(&self) -> Option<&Text> {
        self.first_attr(A_TITLE).and_then(Value::as_text)
    }

    pub fn type_ref(&self) -> Option<ObjRef> {
        self.first_attr(A_TYPE).and_then(Value::as_objref)
    }

    pub fn types(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.attrs_for(A_TYPE).filter_map(Value::as_objref)
    }

    pub fn parent_ref(&self) -> Option<ObjRef> {
        self.first_attr(A_PARENT).and_then(Value::as_objref)
    }

    /// Split grouped attributes out into pseudo-objects, one per group id.
    ///
    /// `group_type` maps a group descriptor to the type given to the
    /// pseudo-object. Pseudo-objects inherit the parent's labels and have
    /// no objref.
    pub fn extract_groups<F>(&self, group_type: F) -> ExtractedGroups
    where
        F: Fn(Desc) -> Option<ObjRef>,
    {
        let mut root = StoredObject { attrs: Vec::new(), ..self.clone() };
        let mut groups: Vec<(AttrGroup, StoredObject)> = Vec::new();
        for attr in &self.attrs {
            let Some(g) = attr.group else {
                root.attrs.push(attr.clone());
                continue;
            };
            let idx = match groups.iter().position(|(k, _)| *k == g) {
                Some(i) => i,
                None => {
                    let mut pseudo = StoredObject::with_labels(self.labels.clone());
                    if let Some(t) = group_type(g.desc) {
                        pseudo.add_attr(t, A_TYPE);
                    }
                    groups.push((g, pseudo));
                    groups.len() - 1
                }
            };
            groups[idx].1.attrs.push(Attribute { group: None, ..attr.clone() });
        }
        ExtractedGroups { root, groups }
    }
}

/// Output of [`StoredObject::extract_groups`].
#[derive(Debug, Clone)]
pub struct ExtractedGroups {
    pub root: StoredObject,
    pub groups: Vec<(AttrGroup, StoredObject)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::A_DATE;

    #[test]
    fn attribute_access() {
        let mut o = StoredObject::new();
        o.add_attr("Contract", A_TITLE).add_attr_q(5i64, A_DATE, 3).add_attr(ObjRef(77), A_PARENT);
        assert_eq!(o.title().map(|t| t.text.as_str()), Some("Contract"));
        assert_eq!(o.first_attr_q(A_DATE, 3), Some(&Value::Integer(5)));
        assert!(o.first_attr_q(A_DATE, 0).is_none());
        assert_eq!(o.parent_ref(), Some(ObjRef(77)));
        assert_eq!(o.delete_attrs(A_PARENT), 1);
        assert!(!o.has_attr(A_PARENT));
        assert!(!o.is_persisted());
    }

    #[test]
    fn groups_become_pseudo_objects() {
        let mut o = StoredObject::with_labels(LabelList::from([10]));
        let g1 = AttrGroup { desc: 900, id: 1 };
        let g2 = AttrGroup { desc: 900, id: 2 };
        o.add_attr("Root", A_TITLE);
        o.add_grouped_attr("first", A_TITLE, Q_NULL, g1);
        o.add_grouped_attr("second", A_TITLE, Q_NULL, g2);
        o.add_grouped_attr(4i64, 500, Q_NULL, g1);
        let ex = o.extract_groups(|d| (d == 900).then_some(ObjRef(600_000)));
        assert_eq!(ex.root.attributes().len(), 1);
        assert_eq!(ex.groups.len(), 2);
        let (g, first) = &ex.groups[0];
        assert_eq!(*g, g1);
        assert_eq!(first.type_ref(), Some(ObjRef(600_000)));
        assert_eq!(first.attributes().len(), 3);
        assert_eq!(first.labels, o.labels);
        assert!(first.attributes().iter().all(|a| a.group.is_none()));
    }
}
