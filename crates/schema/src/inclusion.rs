use serde::{Deserialize, Serialize};
use tracing::warn;

use vellum_core::consts::{A_TITLE, RELEVANCY_WEIGHT_MULTIPLIER};
use vellum_core::Desc;

/// One attribute pulled from a linked object, with its relevancy weight in
/// units of [`RELEVANCY_WEIGHT_MULTIPLIER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Inclusion {
    pub desc: Desc,
    pub weight: i64,
}

/// Which attributes of an object of a given type contribute terms to the
/// objects linking to it.
///
/// Text form is one inclusion per line, `<weight> <attribute short name>`,
/// e.g. `1.5 title`. A missing, unparseable or zero weight means 1.0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInclusionSpec {
    inclusions: Vec<Inclusion>,
}

impl Default for TermInclusionSpec {
    fn default() -> Self {
        Self { inclusions: vec![Inclusion { desc: A_TITLE, weight: RELEVANCY_WEIGHT_MULTIPLIER }] }
    }
}

impl TermInclusionSpec {
    pub fn parse<F>(text: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<Desc>,
    {
        let mut inclusions: Vec<Inclusion> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (weight, name) = match line.split_once(char::is_whitespace) {
                Some((w, n)) => (parse_weight(w), n.trim()),
                None => (RELEVANCY_WEIGHT_MULTIPLIER, line),
            };
            match lookup(name) {
                Some(desc) if !inclusions.iter().any(|i| i.desc == desc) => inclusions.push(Inclusion { desc, weight }),
                Some(_) => {}
                None => warn!(attr = name, "unknown attribute in term inclusion specification"),
            }
        }
        if !inclusions.iter().any(|i| i.desc == A_TITLE) {
            inclusions.insert(0, Inclusion { desc: A_TITLE, weight: RELEVANCY_WEIGHT_MULTIPLIER });
        }
        Self { inclusions }
    }

    pub fn inclusions(&self) -> &[Inclusion] {
        &self.inclusions
    }

    /// True when switching from `self` to `other` changes the terms linked
    /// objects receive.
    pub fn reindexing_required(&self, other: &TermInclusionSpec) -> bool {
        self.sorted() != other.sorted()
    }

    fn sorted(&self) -> Vec<(Desc, i64)> {
        let mut v: Vec<(Desc, i64)> = self.inclusions.iter().map(|i| (i.desc, i.weight)).collect();
        v.sort_unstable();
        v
    }
}

fn parse_weight(s: &str) -> i64 {
    match s.parse::<f64>() {
        Ok(w) if w.is_finite() && w > 0.0 => {
            let scaled = (w * RELEVANCY_WEIGHT_MULTIPLIER as f64).round() as i64;
            if scaled == 0 { RELEVANCY_WEIGHT_MULTIPLIER } else { scaled }
        }
        _ => RELEVANCY_WEIGHT_MULTIPLIER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<Desc> {
        match name {
            "title" => Some(A_TITLE),
            "client" => Some(400),
            "notes" => Some(401),
            _ => None,
        }
    }

    #[test]
    fn parses_weights_and_always_has_title() {
        let spec = TermInclusionSpec::parse("1.5 client\nbogus notes\n\n2 nothing\n", lookup);
        assert_eq!(
            spec.inclusions(),
            &[
                Inclusion { desc: A_TITLE, weight: 1000 },
                Inclusion { desc: 400, weight: 1500 },
                Inclusion { desc: 401, weight: 1000 },
            ]
        );
    }

    #[test]
    fn reindexing_ignores_order() {
        let a = TermInclusionSpec::parse("1 title\n2 client", lookup);
        let b = TermInclusionSpec::parse("2 client\n1 title", lookup);
        assert!(!a.reindexing_required(&b));
        let c = TermInclusionSpec::parse("3 client", lookup);
        assert!(a.reindexing_required(&c));
        assert!(!TermInclusionSpec::default().reindexing_required(&TermInclusionSpec::parse("", lookup)));
    }
}
