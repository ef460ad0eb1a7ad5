use std::sync::Arc;

use tracing::debug;

use vellum_core::{LabelList, LabelStatements, ObjRef, Operation, Result, StoreError, UserId};
use vellum_search::Visibility;

/// The user an operation runs as, with the policy that governs it.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: UserId,
    pub statements: Arc<LabelStatements>,
    /// Labels lifting attribute restrictions for this user.
    pub unrestrict_labels: LabelList,
}

/// User id recorded for writes made by the system itself.
pub const SYSTEM_USER: UserId = 0;

impl Actor {
    pub fn new(user_id: UserId, statements: LabelStatements) -> Self {
        Self { user_id, statements: Arc::new(statements), unrestrict_labels: LabelList::empty() }
    }

    pub fn with_unrestrict_labels(mut self, labels: LabelList) -> Self {
        self.unrestrict_labels = labels;
        self
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_USER, LabelStatements::super_user())
    }

    /// Same user, superuser policy.
    pub fn with_superuser(&self) -> Self {
        Self {
            user_id: self.user_id,
            statements: Arc::new(LabelStatements::super_user()),
            unrestrict_labels: self.unrestrict_labels.clone(),
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.statements.is_superuser()
    }

    /// Fail with `PermissionDenied` unless `op` is allowed on `labels`.
    pub fn check(&self, op: Operation, labels: &LabelList, objref: Option<ObjRef>) -> Result<()> {
        if self.statements.is_allowed(op, labels) {
            return Ok(());
        }
        debug!(user = self.user_id, %op, obj = ?objref, "permission denied");
        Err(StoreError::denied(op, objref))
    }

    pub fn visibility(&self) -> Visibility {
        if self.is_superuser() {
            Visibility::superuser()
        } else {
            Visibility::with_labels(self.unrestrict_labels.clone())
        }
    }
}
