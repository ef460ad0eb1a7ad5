//! Vellum labels: sorted label sets, add/remove deltas, and the label
//! statements that make up the whole permission model.
//!
//! Labels are positive integers. The same value is both a category and an
//! access control unit, so everything here is deliberately plain data that
//! can be shared across threads and rendered into SQL predicates.

#![forbid(unsafe_code)]

mod changes;
mod list;
pub mod sql;
mod statements;

pub use changes::LabelChanges;
pub use list::{Label, LabelList};
pub use statements::{LabelStatements, OpsStatements, Operation, ParseOperationError};
