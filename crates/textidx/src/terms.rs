//! Turning an object into weighted term runs for the text index.

use rustc_hash::FxHashSet;

use vellum_core::consts::{Q_NULL, RELEVANCY_WEIGHT_MULTIPLIER, TEXTIDX_WEIGHT_MULTIPLIER, TEXT_INDEX_MAX_PARENT_COUNT};
use vellum_core::{Desc, LabelList, ObjRef, Qual, Result, StoreError, StoredObject, Value};
use vellum_schema::{AttrWeightings, Schema};
use vellum_search::{field_prefix, IndexWriter};
use vellum_store::{Actor, ObjectStore};

/// Positions left between attributes so phrases never span two of them.
const ATTR_POSITION_GAP: u32 = 16;

/// Text posted under one attribute.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TermRun {
    pub text: String,
    pub restriction: Option<LabelList>,
    pub desc: Desc,
    pub qual: Qual,
    pub weight: i64,
}

/// Weight for terms of `desc`/`qual`. Zero means the attribute is not
/// indexed at all.
pub(crate) fn attr_weight(w: &AttrWeightings, desc: Desc, qual: Qual) -> i64 {
    w.get(&desc)
        .and_then(|qs| qs.get(&qual).or_else(|| qs.get(&Q_NULL)))
        .copied()
        .unwrap_or(TEXTIDX_WEIGHT_MULTIPLIER)
}

/// Weight of text pulled in through a link: the linking attribute's
/// weight scaled by the inclusion's relevancy weight, never below 1.
pub(crate) fn linked_weight(attr_weight: i64, inclusion_weight: i64) -> i64 {
    if attr_weight <= 0 {
        return 0;
    }
    (attr_weight * inclusion_weight / RELEVANCY_WEIGHT_MULTIPLIER).max(1)
}

/// Every term run of `obj`: its own text attributes, those of its
/// attribute groups, and the included attributes of the objects it links
/// to, following each link up its parent chain.
pub(crate) fn collect(store: &ObjectStore, schema: &Schema, obj: &StoredObject) -> Result<Vec<TermRun>> {
    let weights = schema.attr_weightings_for_indexing();
    let extracted = obj.extract_groups(|d| schema.group_type_for(d));
    let mut parts = vec![extracted.root];
    for (_, mut group) in extracted.groups {
        store.delegate().label_extracted_object_group(&mut group, obj);
        parts.push(group);
    }

    let system = Actor::system();
    let mut runs = Vec::new();
    for part in &parts {
        let restricted = schema.restricted_attributes_for(part.type_ref(), &part.labels, &LabelList::empty());
        for a in part.attributes() {
            let weight = attr_weight(weights, a.desc, a.qualifier);
            if weight == 0 {
                continue;
            }
            let run = TermRun {
                text: String::new(),
                restriction: restricted.hidden_unlock(a.desc).cloned(),
                desc: a.desc,
                qual: a.qualifier,
                weight,
            };
            match &a.value {
                Value::Text(t) => runs.push(TermRun { text: t.to_terms_text().into_owned(), ..run }),
                Value::Ref(target) => linked_runs(store, schema, &system, *target, obj.objref, &run, &mut runs)?,
                Value::Integer(_) | Value::DateTime(_) => {}
            }
        }
    }
    Ok(runs)
}

/// Runs for `target` and its parents, posted under the linking attribute
/// described by `link`.
fn linked_runs(
    store: &ObjectStore,
    schema: &Schema,
    system: &Actor,
    target: ObjRef,
    from: Option<ObjRef>,
    link: &TermRun,
    runs: &mut Vec<TermRun>,
) -> Result<()> {
    let mut seen: FxHashSet<ObjRef> = FxHashSet::default();
    seen.extend(from);
    let mut current = Some(target);
    while let Some(r) = current {
        if seen.len() > TEXT_INDEX_MAX_PARENT_COUNT || !seen.insert(r) {
            break;
        }
        let linked = match store.read(system, r) {
            Ok(o) => o,
            Err(StoreError::NotFound(_)) => break,
            Err(e) => return Err(e),
        };
        let spec = linked.type_ref().map(|t| schema.term_inclusion_for(t)).unwrap_or_default();
        for inc in spec.inclusions() {
            let weight = linked_weight(link.weight, inc.weight);
            for t in linked.attrs_for(inc.desc).filter_map(Value::as_text) {
                if t.is_slow_to_index() {
                    continue;
                }
                runs.push(TermRun { text: t.to_terms_text().into_owned(), weight, ..link.clone() });
            }
        }
        current = linked.parent_ref();
    }
    Ok(())
}

/// Replace document `doc` in the writer with `runs`.
pub(crate) fn post(writer: &mut IndexWriter, doc: i64, runs: &[TermRun]) {
    writer.start_document(doc);
    let mut pos = 0;
    for run in runs {
        let field = field_prefix(run.desc, None);
        let qualified = (run.qual != Q_NULL).then(|| field_prefix(run.desc, Some(run.qual)));
        pos = writer.post_terms(&run.text, run.restriction.as_ref(), Some(&field), qualified.as_deref(), pos, run.weight);
        pos += ATTR_POSITION_GAP;
    }
    writer.finish_document();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_falls_back_to_descriptor_then_default() {
        let mut w = AttrWeightings::new();
        w.entry(300).or_default().insert(Q_NULL, 8);
        w.entry(300).or_default().insert(7, 2);
        w.entry(301).or_default().insert(Q_NULL, 0);
        assert_eq!(attr_weight(&w, 300, 7), 2);
        assert_eq!(attr_weight(&w, 300, 9), 8);
        assert_eq!(attr_weight(&w, 301, Q_NULL), 0);
        assert_eq!(attr_weight(&w, 999, Q_NULL), TEXTIDX_WEIGHT_MULTIPLIER);
    }

    #[test]
    fn linked_weight_scales_the_linking_attribute() {
        assert_eq!(linked_weight(16, RELEVANCY_WEIGHT_MULTIPLIER), 16);
        assert_eq!(linked_weight(TEXTIDX_WEIGHT_MULTIPLIER, 2_000), 8);
        assert_eq!(linked_weight(TEXTIDX_WEIGHT_MULTIPLIER, 100), 1);
        assert_eq!(linked_weight(0, 2_000), 0);
    }
}
