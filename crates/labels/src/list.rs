use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;

pub type Label = i64;

/// Immutable label set: strictly sorted, unique, every element > 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LabelList {
    labels: SmallVec<[Label; 4]>,
}

impl LabelList {
    pub fn new<I: IntoIterator<Item = Label>>(labels: I) -> Self {
        let mut v: SmallVec<[Label; 4]> = labels.into_iter().filter(|l| *l > 0).collect();
        v.sort_unstable();
        v.dedup();
        Self { labels: v }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
    pub fn as_slice(&self) -> &[Label] {
        &self.labels
    }
    pub fn iter(&self) -> impl Iterator<Item = Label> + '_ {
        self.labels.iter().copied()
    }

    pub fn contains(&self, label: Label) -> bool {
        self.labels.binary_search(&label).is_ok()
    }

    /// True when at least one label is shared.
    pub fn intersects(&self, other: &LabelList) -> bool {
        let (mut i, mut j) = (0usize, 0usize);
        let (a, b) = (&self.labels, &other.labels);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    /// An empty list never includes "all" of anything.
    pub fn includes_all(&self, other: &LabelList) -> bool {
        if other.is_empty() {
            return false;
        }
        other.iter().all(|l| self.contains(l))
    }

    pub fn union(&self, other: &LabelList) -> LabelList {
        LabelList::new(self.iter().chain(other.iter()))
    }

    pub fn difference(&self, other: &LabelList) -> LabelList {
        LabelList::new(self.iter().filter(|l| !other.contains(*l)))
    }

    /// Column storage form, a compact JSON integer array.
    pub fn to_json(&self) -> String {
        let mut s = String::with_capacity(2 + self.labels.len() * 6);
        s.push('[');
        for (i, l) in self.labels.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&l.to_string());
        }
        s.push(']');
        s
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        let v: Vec<Label> = serde_json::from_str(s)?;
        Ok(Self::new(v))
    }
}

impl<'de> Deserialize<'de> for LabelList {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v: Vec<Label> = Vec::deserialize(d)?;
        Ok(LabelList::new(v))
    }
}

impl FromIterator<Label> for LabelList {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        LabelList::new(iter)
    }
}

impl From<&[Label]> for LabelList {
    fn from(v: &[Label]) -> Self {
        LabelList::new(v.iter().copied())
    }
}

impl<const N: usize> From<[Label; N]> for LabelList {
    fn from(v: [Label; N]) -> Self {
        LabelList::new(v)
    }
}

impl fmt::Display for LabelList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}
