//! Shared status-condition helpers used by the Sandbox and Claim
//! reconcilers.
//!
//! Both controllers report a `Ready` condition using the standard
//! `metav1.Condition` shape. The merge rule is the same everywhere:
//! preserve `lastTransitionTime` when `(type, status)` is unchanged, refresh
//! it otherwise, and sort by `type` before any deep-equal comparison so that
//! reconciles which didn't actually change anything don't produce spurious
//! status writes.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Reason strings enumerated in the external interface. Kept as `&str`
/// rather than an enum because `Condition.reason` is a plain string field
/// on the wire and these values are sometimes compared against directly in
/// tests and status messages.
pub mod reasons {
    pub const DEPENDENCIES_READY: &str = "DependenciesReady";
    pub const DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";
    pub const RECONCILER_ERROR: &str = "ReconcilerError";
    pub const SANDBOX_EXPIRED: &str = "SandboxExpired";
    pub const CLAIM_EXPIRED: &str = "ClaimExpired";
    pub const TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
    pub const SANDBOX_READY: &str = "SandboxReady";
    pub const SANDBOX_NOT_READY: &str = "SandboxNotReady";
    pub const SANDBOX_MISSING: &str = "SandboxMissing";
}

pub const READY: &str = "Ready";

/// Build a `Ready` condition, leaving `lastTransitionTime` to be resolved by
/// [`set_condition`] against whatever was previously recorded.
pub fn ready_condition(
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: READY.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/// Insert or update `new` inside `conditions`, preserving
/// `lastTransitionTime` when the `(type, status)` pair did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    if let Some(existing) = conditions.iter().find(|c| c.type_ == new.type_) {
        if existing.status == new.status {
            new.last_transition_time = existing.last_transition_time.clone();
        }
    }
    conditions.retain(|c| c.type_ != new.type_);
    conditions.push(new);
    sort_conditions(conditions);
}

/// Canonical ordering used before any deep-equal comparison of status
/// objects, so semantically-unchanged statuses never trigger a write.
pub fn sort_conditions(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
}

/// Find a condition by type.
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True if the `Ready` condition is present with status `"True"`.
pub fn is_ready(conditions: &[Condition]) -> bool {
    find(conditions, READY).is_some_and(|c| c.status == "True")
}
