use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vellum_core::{Desc, LabelList, ObjRef};

/// A type-scoped rule which hides attributes, or makes them read only,
/// unless the viewer holds one of the unrestrict labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub objref: ObjRef,
    /// Types the rule applies to. Listed as stored until the schema is
    /// built, which resolves them to root types; no listed type means every
    /// root type.
    pub types: Vec<ObjRef>,
    /// Rule applies only to objects carrying one of these. Empty means always.
    pub if_labels: LabelList,
    pub unrestrict_labels: LabelList,
    pub hidden: Vec<Desc>,
    pub read_only: Vec<Desc>,
}

impl Restriction {
    /// `root` must be a root type and the rule resolved by a schema build.
    pub fn applies_to_type(&self, root: ObjRef) -> bool {
        self.types.binary_search(&root).is_ok()
    }

    pub fn matches(&self, object_labels: &LabelList, viewer_unrestrict: &LabelList) -> bool {
        (self.if_labels.is_empty() || object_labels.intersects(&self.if_labels))
            && !viewer_unrestrict.intersects(&self.unrestrict_labels)
    }
}

/// Attributes restricted for one object and viewer. Each entry maps a
/// descriptor to the labels which would lift its restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictedAttributes {
    pub hidden: BTreeMap<Desc, LabelList>,
    pub read_only: BTreeMap<Desc, LabelList>,
}

impl RestrictedAttributes {
    pub(crate) fn collect<'a, I>(rules: I, object_labels: &LabelList, viewer_unrestrict: &LabelList) -> Self
    where
        I: IntoIterator<Item = &'a Restriction>,
    {
        let mut out = RestrictedAttributes::default();
        for rule in rules.into_iter().filter(|r| r.matches(object_labels, viewer_unrestrict)) {
            for desc in &rule.hidden {
                merge(&mut out.hidden, *desc, &rule.unrestrict_labels);
            }
            for desc in &rule.read_only {
                merge(&mut out.read_only, *desc, &rule.unrestrict_labels);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty() && self.read_only.is_empty()
    }

    pub fn is_hidden(&self, desc: Desc) -> bool {
        self.hidden.contains_key(&desc)
    }

    pub fn is_read_only(&self, desc: Desc) -> bool {
        self.read_only.contains_key(&desc)
    }

    /// Labels lifting the hide on `desc`, `None` when unrestricted.
    pub fn hidden_unlock(&self, desc: Desc) -> Option<&LabelList> {
        self.hidden.get(&desc)
    }
}

fn merge(map: &mut BTreeMap<Desc, LabelList>, desc: Desc, labels: &LabelList) {
    let entry = map.entry(desc).or_default();
    *entry = entry.union(labels);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, if_labels: &[i64], unrestrict: &[i64], hidden: &[Desc]) -> Restriction {
        Restriction {
            objref: ObjRef(id),
            types: vec![],
            if_labels: LabelList::from(if_labels),
            unrestrict_labels: LabelList::from(unrestrict),
            hidden: hidden.to_vec(),
            read_only: vec![],
        }
    }

    #[test]
    fn if_labels_and_unrestrict() {
        let rules = [rule(1, &[10], &[50], &[400]), rule(2, &[], &[51], &[400, 401])];
        let none = LabelList::empty();
        let r = RestrictedAttributes::collect(&rules, &LabelList::from([10]), &none);
        assert_eq!(r.hidden_unlock(400).map(|l| l.as_slice()), Some(&[50, 51][..]));
        assert_eq!(r.hidden_unlock(401).map(|l| l.as_slice()), Some(&[51][..]));

        let r = RestrictedAttributes::collect(&rules, &LabelList::from([11]), &none);
        assert_eq!(r.hidden_unlock(400).map(|l| l.as_slice()), Some(&[51][..]));

        let r = RestrictedAttributes::collect(&rules, &LabelList::from([10]), &LabelList::from([51]));
        assert!(r.is_hidden(400));
        assert!(!r.is_hidden(401));
    }
}
