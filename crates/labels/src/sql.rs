//! SQLite predicates over JSON integer-array label columns.
//!
//! Label values are integers, so they are inlined rather than bound.

use crate::list::LabelList;

/// Comma separated integers, e.g. `1,5,9`.
pub fn int_list(labels: &LabelList) -> String {
    labels.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(",")
}

/// `column` shares at least one label with `labels`.
pub fn overlaps(column: &str, labels: &LabelList) -> String {
    if labels.is_empty() {
        return "FALSE".to_string();
    }
    format!("EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value IN ({}))", column, int_list(labels))
}

/// `column` contains every label in `labels`. An empty set matches nothing.
pub fn contains_all(column: &str, labels: &LabelList) -> String {
    if labels.is_empty() {
        return "FALSE".to_string();
    }
    format!(
        "((SELECT COUNT(*) FROM json_each({}) WHERE json_each.value IN ({})) = {})",
        column,
        int_list(labels),
        labels.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_overlap() {
        let l = LabelList::from([3, 1]);
        assert_eq!(
            overlaps("o.labels", &l),
            "EXISTS (SELECT 1 FROM json_each(o.labels) WHERE json_each.value IN (1,3))"
        );
        assert_eq!(overlaps("labels", &LabelList::empty()), "FALSE");
        assert!(contains_all("labels", &l).ends_with("= 2)"));
    }
}
