//! Well-known object ids, labels, attribute descriptors and tuning values.
//!
//! These numbers are persisted in every store, so they are stable.

use vellum_labels::Label;

use crate::{Desc, ObjRef, Qual};

// ---------------- Object ids ----------------
/// Ids at or below this are reserved for schema and system objects.
pub const MAX_RESERVED_OBJID: i64 = 524_288;

pub const O_STORE_OPTIONS: ObjRef = ObjRef(2);
pub const O_TYPE_ATTR_DESC: ObjRef = ObjRef(6);
pub const O_TYPE_QUALIFIER_DESC: ObjRef = ObjRef(7);
pub const O_TYPE_RESTRICTION: ObjRef = ObjRef(9);
/// Type of user visible type descriptors.
pub const O_TYPE_APP_VISIBLE: ObjRef = ObjRef(8_020);
pub const O_TYPE_BEHAVIOUR_HIERARCHICAL: ObjRef = ObjRef(8_042);
pub const O_TYPE_UNKNOWN: ObjRef = ObjRef(8_099);

// ---------------- Labels ----------------
pub const O_LABEL_UNLABELLED: Label = 100;
pub const O_LABEL_DELETED: Label = 101;
pub const O_LABEL_STRUCTURE: Label = 7_511;
pub const O_LABEL_ARCHIVED: Label = 7_513;

// ---------------- Attribute descriptors ----------------
pub const A_OPTION: Desc = 199;
pub const A_PARENT: Desc = 201;
pub const A_TYPE: Desc = 210;
pub const A_TITLE: Desc = 211;
pub const A_DATE: Desc = 217;
pub const A_EMAIL_ADDRESS: Desc = 401;
pub const A_CODE: Desc = 2_000;
pub const A_ATTR_SHORT_NAME: Desc = 2_010;
pub const A_ATTR_DATA_TYPE: Desc = 2_011;
pub const A_RELEVANCY_WEIGHT: Desc = 2_012;
pub const A_TERM_INCLUSION_SPEC: Desc = 2_014;
pub const A_ATTR_GROUP_TYPE: Desc = 2_018;
pub const A_RESTRICTION_TYPE: Desc = 2_020;
pub const A_RESTRICTION_ATTR_RESTRICTED: Desc = 2_022;
pub const A_RESTRICTION_ATTR_READ_ONLY: Desc = 2_023;
pub const A_RESTRICTION_IF_LABEL: Desc = 2_024;
pub const A_RESTRICTION_UNRESTRICT_LABEL: Desc = 2_025;
pub const A_TYPE_BEHAVIOUR: Desc = 2_108;
pub const A_ATTR_CONTROL_BY_TYPE: Desc = 2_112;
pub const A_CONFIGURED_BEHAVIOUR: Desc = 2_555;

pub const Q_NULL: Qual = 0;

// ---------------- Weights ----------------
/// Relevancy weights are stored as integer multiples of this.
pub const RELEVANCY_WEIGHT_MULTIPLIER: i64 = 1_000;
/// Default weight of a posting in the text index.
pub const TEXTIDX_WEIGHT_MULTIPLIER: i64 = 4;

// ---------------- Limits ----------------
pub const MAX_PARENT_PATH: usize = 128;
pub const MAX_OBJECT_CACHE_ENTRIES: usize = 8_096;
pub const RESULTS_CHUNK_LOAD_SIZE: usize = 128;
pub const TEXT_INDEX_MAX_PER_APP: usize = 16;
pub const TEXT_INDEX_MAX_REINDEX: usize = 16;
pub const TEXT_INDEX_MAX_PARENT_COUNT: usize = 128;
