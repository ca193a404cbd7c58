//! Access checks performed before a job renders anything.

use crate::context::ContextSnapshot;
use crate::types::{EntityReference, Right};

/// Decides whether a rendering job may run.
///
/// Jobs that require a [`Right`] ask the checker before rendering. The checker gets to see the
/// captured context of the job, which is where implementations find e.g. the current user.
pub trait AuthorizationChecker: Send + Sync {
    /// Returns `true` if `right` is granted on `entity` in the given context.
    ///
    /// An `entity` of `None` refers to the current wiki as a whole.
    fn check_access(
        &self,
        right: Right,
        entity: Option<&EntityReference>,
        context: &ContextSnapshot,
    ) -> bool;
}

/// An [`AuthorizationChecker`] granting every right.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AuthorizationChecker for AllowAll {
    fn check_access(&self, _: Right, _: Option<&EntityReference>, _: &ContextSnapshot) -> bool {
        true
    }
}
