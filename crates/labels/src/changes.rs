use serde::{Deserialize, Serialize};

use crate::list::{Label, LabelList};

/// A pending add/remove delta. Removal wins over addition for a label
/// present in both sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChanges {
    add: LabelList,
    remove: LabelList,
}

impl LabelChanges {
    pub fn new(add: LabelList, remove: LabelList) -> Self {
        Self { add, remove }
    }

    /// The delta which turns `from` into `to`.
    pub fn changing(from: &LabelList, to: &LabelList) -> Self {
        Self { add: to.difference(from), remove: from.difference(to) }
    }

    pub fn add<I: IntoIterator<Item = Label>>(&mut self, labels: I) -> &mut Self {
        self.add = LabelList::new(self.add.iter().chain(labels));
        self
    }

    pub fn remove<I: IntoIterator<Item = Label>>(&mut self, labels: I) -> &mut Self {
        self.remove = LabelList::new(self.remove.iter().chain(labels));
        self
    }

    pub fn will_add(&self, label: Label) -> bool {
        self.add.contains(label)
    }
    pub fn will_remove(&self, label: Label) -> bool {
        self.remove.contains(label)
    }
    pub fn adds(&self) -> &LabelList {
        &self.add
    }
    pub fn removes(&self) -> &LabelList {
        &self.remove
    }
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// `sort(unique((list ∪ add) − remove))`
    pub fn apply(&self, list: &LabelList) -> LabelList {
        list.union(&self.add).difference(&self.remove)
    }
}
