use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::list::{Label, LabelList};
use crate::sql;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Relabel,
    Delete,
    Approve,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Read,
        Operation::Create,
        Operation::Update,
        Operation::Relabel,
        Operation::Delete,
        Operation::Approve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Relabel => "relabel",
            Operation::Delete => "delete",
            Operation::Approve => "approve",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown operation: {0}")]
pub struct ParseOperationError(String);

impl FromStr for Operation {
    type Err = ParseOperationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ParseOperationError(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Rule {
    allow: LabelList,
    deny: LabelList,
}

/// Explicit allow/deny label sets per operation. An operation with no rule
/// behaves as one with an empty allow set: nothing is permitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsStatements {
    rules: BTreeMap<Operation, Rule>,
}

impl OpsStatements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(mut self, op: Operation, allow: LabelList, deny: LabelList) -> Self {
        self.rules.insert(op, Rule { allow, deny });
        self
    }

    pub fn allow_set(&self, op: Operation) -> LabelList {
        self.rules.get(&op).map(|r| r.allow.clone()).unwrap_or_default()
    }

    pub fn deny_set(&self, op: Operation) -> LabelList {
        self.rules.get(&op).map(|r| r.deny.clone()).unwrap_or_default()
    }

    fn rule(&self, op: Operation) -> Option<&Rule> {
        self.rules.get(&op)
    }
}

/// Permission policy. Built once per schema generation, then shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelStatements {
    Ops(OpsStatements),
    SuperUser,
    And(Box<LabelStatements>, Box<LabelStatements>),
    Or(Box<LabelStatements>, Box<LabelStatements>),
}

impl Default for LabelStatements {
    fn default() -> Self {
        Self::deny_all()
    }
}

impl LabelStatements {
    pub fn deny_all() -> Self {
        LabelStatements::Ops(OpsStatements::default())
    }

    pub fn super_user() -> Self {
        LabelStatements::SuperUser
    }

    pub fn and(a: LabelStatements, b: LabelStatements) -> Self {
        LabelStatements::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: LabelStatements, b: LabelStatements) -> Self {
        LabelStatements::Or(Box::new(a), Box::new(b))
    }

    /// Decode bitmask storage. `bitmasks` holds `(label, allow, deny)`
    /// triples, `operation_bits` maps each operation to its bit.
    pub fn from_bitmasks(bitmasks: &[(Label, u32, u32)], operation_bits: &[(Operation, u32)]) -> Self {
        let mut ops = OpsStatements::new();
        for (op, bit) in operation_bits {
            let allow = bitmasks.iter().filter(|(_, a, _)| a & bit == *bit).map(|(l, _, _)| *l);
            let deny = bitmasks.iter().filter(|(_, _, d)| d & bit == *bit).map(|(l, _, _)| *l);
            ops = ops.statement(*op, LabelList::new(allow), LabelList::new(deny));
        }
        LabelStatements::Ops(ops)
    }

    pub fn is_superuser(&self) -> bool {
        matches!(self, LabelStatements::SuperUser)
    }

    pub fn is_allowed(&self, op: Operation, labels: &LabelList) -> bool {
        match self {
            LabelStatements::Ops(ops) => match ops.rule(op) {
                Some(rule) => labels.intersects(&rule.allow) && !labels.intersects(&rule.deny),
                None => false,
            },
            LabelStatements::SuperUser => true,
            LabelStatements::And(a, b) => a.is_allowed(op, labels) && b.is_allowed(op, labels),
            LabelStatements::Or(a, b) => a.is_allowed(op, labels) || b.is_allowed(op, labels),
        }
    }

    pub fn is_label_allowed(&self, op: Operation, label: Label) -> bool {
        match self {
            LabelStatements::Ops(ops) => ops
                .rule(op)
                .map(|r| r.allow.contains(label) && !r.deny.contains(label))
                .unwrap_or(false),
            LabelStatements::SuperUser => true,
            LabelStatements::And(a, b) => a.is_label_allowed(op, label) && b.is_label_allowed(op, label),
            LabelStatements::Or(a, b) => a.is_label_allowed(op, label) || b.is_label_allowed(op, label),
        }
    }

    pub fn is_label_denied(&self, op: Operation, label: Label) -> bool {
        match self {
            LabelStatements::Ops(ops) => ops.rule(op).map(|r| r.deny.contains(label)).unwrap_or(false),
            LabelStatements::SuperUser => false,
            LabelStatements::And(a, b) => a.is_label_denied(op, label) && b.is_label_denied(op, label),
            LabelStatements::Or(a, b) => a.is_label_denied(op, label) || b.is_label_denied(op, label),
        }
    }

    pub fn is_something_allowed(&self, op: Operation) -> bool {
        match self {
            LabelStatements::Ops(ops) => ops.rule(op).map(|r| !r.allow.is_empty()).unwrap_or(false),
            LabelStatements::SuperUser => true,
            LabelStatements::And(a, b) => a.is_something_allowed(op) && b.is_something_allowed(op),
            LabelStatements::Or(a, b) => a.is_something_allowed(op) || b.is_something_allowed(op),
        }
    }

    /// SQL boolean expression equivalent to [`is_allowed`](Self::is_allowed)
    /// for the JSON label array in `column`. `additional_excludes` are
    /// treated as extra deny labels, superusers included.
    pub fn sql_predicate(&self, op: Operation, column: &str, additional_excludes: &LabelList) -> String {
        match self {
            LabelStatements::Ops(ops) => {
                let rule = match ops.rule(op) {
                    Some(r) if !r.allow.is_empty() => r,
                    _ => return "FALSE".to_string(),
                };
                let deny = rule.deny.union(additional_excludes);
                if deny.is_empty() {
                    format!("({})", sql::overlaps(column, &rule.allow))
                } else {
                    format!(
                        "({} AND NOT {})",
                        sql::overlaps(column, &rule.allow),
                        sql::overlaps(column, &deny)
                    )
                }
            }
            LabelStatements::SuperUser => {
                if additional_excludes.is_empty() {
                    "TRUE".to_string()
                } else {
                    format!("(NOT {})", sql::overlaps(column, additional_excludes))
                }
            }
            LabelStatements::And(a, b) => format!(
                "({} AND {})",
                a.sql_predicate(op, column, additional_excludes),
                b.sql_predicate(op, column, additional_excludes)
            ),
            LabelStatements::Or(a, b) => format!(
                "({} OR {})",
                a.sql_predicate(op, column, additional_excludes),
                b.sql_predicate(op, column, additional_excludes)
            ),
        }
    }
}
