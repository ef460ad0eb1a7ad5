//! Vellum core types: object references, attribute values, stored objects
//! and the error taxonomy shared by every crate in the workspace.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod consts;
mod error;
mod object;
mod value;

pub use error::{Result, StoreError};
pub use object::{AttrGroup, Attribute, ExtractedGroups, StoredObject};
pub use value::{sort_as_normalise, DateTimeRange, Text, TextKind, Value};
pub use vellum_labels::{Label, LabelChanges, LabelList, LabelStatements, Operation};

pub type AppId = i64;
pub type Desc = i64;
pub type Qual = i64;
pub type UserId = i64;

/// Identity of a stored object. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjRef(pub i64);

impl ObjRef {
    pub fn new(id: i64) -> Option<ObjRef> {
        (id > 0).then_some(ObjRef(id))
    }

    pub fn id(&self) -> i64 {
        self.0
    }

    pub fn is_reserved(&self) -> bool {
        self.0 <= consts::MAX_RESERVED_OBJID
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjRef {
    type Err = StoreError;
    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .ok()
            .and_then(ObjRef::new)
            .ok_or_else(|| StoreError::InvalidObject(format!("bad object reference: {}", s)))
    }
}

pub mod prelude {
    pub use super::{
        consts, AppId, Attribute, DateTimeRange, Desc, LabelChanges, LabelList, LabelStatements, ObjRef,
        Operation, Qual, Result, StoreError, StoredObject, Text, TextKind, UserId, Value,
    };
}
