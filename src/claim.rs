//! Pure decision logic for the SandboxClaim reconciler: expiry/policy
//! branching, pod-adoption candidate selection, and status mirroring.
//!
//! This is the component with the trickiest correctness property in the
//! whole system (the adoption hand-off race with the WarmPool controller),
//! but the race itself is arbitrated entirely by the orchestrator's
//! optimistic concurrency on the hand-off write -- nothing here needs to
//! know about retries or conflicts, only about *ordering candidates* and
//! *what labels a hand-off write must produce*.

use chrono::{DateTime, Utc};

use crate::conditions::{self, reasons};
use crate::crd::ShutdownPolicy;
use crate::hash::name_hash;
use crate::labels;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

/// Whether `C.spec.lifecycle.shutdownTime` has passed. Absent means never.
pub fn is_expired(shutdown_time: Option<&DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    shutdown_time.is_some_and(|t| *t <= now)
}

/// What the reconciler should do this pass, per §4.4 steps 3-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Not expired: run the normal active-reconcile path.
    RunActiveReconcile,
    /// Expired, policy=Delete: delete the Claim itself; cascade handles the rest.
    SelfDelete,
    /// Expired, policy=Retain: delete the owned Sandbox (if any), keep the Claim.
    RetainAfterExpiry,
}

pub fn expiry_action(expired: bool, policy: ShutdownPolicy) -> ExpiryAction {
    match (expired, policy) {
        (false, _) => ExpiryAction::RunActiveReconcile,
        (true, ShutdownPolicy::Delete) => ExpiryAction::SelfDelete,
        (true, ShutdownPolicy::Retain) => ExpiryAction::RetainAfterExpiry,
    }
}

/// Whether a fresh Sandbox get-or-create is legal, per §4.4 step 6c.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxDisposition {
    /// No Sandbox by this name exists; and a Template is available to build one.
    CreateFromTemplate,
    /// No Sandbox exists and no Template either; report TemplateNotFound, do nothing.
    NoTemplateNoSandbox,
    /// A Sandbox exists and is controlled by this Claim: use it as-is.
    UseExisting,
    /// A Sandbox exists but is controlled by someone else: terminal conflict.
    Conflict,
}

pub fn sandbox_disposition(
    sandbox_exists: bool,
    sandbox_controlled_by_claim: bool,
    template_exists: bool,
) -> SandboxDisposition {
    match (sandbox_exists, sandbox_controlled_by_claim, template_exists) {
        (true, true, _) => SandboxDisposition::UseExisting,
        (true, false, _) => SandboxDisposition::Conflict,
        (false, _, true) => SandboxDisposition::CreateFromTemplate,
        (false, _, false) => SandboxDisposition::NoTemplateNoSandbox,
    }
}

/// Labels the pod template of a freshly created Sandbox must carry.
pub fn new_sandbox_pod_labels(claim_uid: &str) -> [(String, String); 1] {
    [(labels::CLAIM_UID.to_string(), claim_uid.to_string())]
}

/// `automountServiceAccountToken` for a Sandbox built from a Template, per
/// §4.4 step 6.c.iii: force false unless the template explicitly set true.
pub fn effective_automount_service_account_token(template_value: Option<bool>) -> bool {
    template_value.unwrap_or(false)
}

/// NetworkPolicy name derived from the Claim, per §4.4 step 6.b.
pub fn network_policy_name(claim_name: &str) -> String {
    format!("{claim_name}-network-policy")
}

/// Trace-context bootstrap, per §4.4 step 2: if the caller's reconcile
/// happened inside a traced span and the Claim has no trace-context
/// annotation yet, the value to patch in. `None` either means there is
/// nothing to propagate yet, or the Claim already carries one -- in both
/// cases the caller does not write anything this reconcile.
pub fn trace_context_bootstrap(existing: Option<&str>, current_trace_id: Option<&str>) -> Option<String> {
    if existing.is_some() {
        return None;
    }
    current_trace_id.map(str::to_string)
}

/// A minimal view of a candidate pool Pod for adoption.
#[derive(Debug, Clone)]
pub struct AdoptionCandidate {
    pub name: String,
    pub ready: bool,
    pub creation_timestamp: DateTime<Utc>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub controller_kind: Option<String>,
}

/// Filter and order adoption candidates per §4.4 step d: drop pods being
/// deleted, drop anything controlled by a kind other than SandboxWarmPool
/// (unowned is fine -- it just means no one else claims it; foreign-owned,
/// e.g. a ReplicaSet, is not), then sort Ready-first, oldest-first.
pub fn select_adoption_candidate(candidates: &[AdoptionCandidate]) -> Option<&AdoptionCandidate> {
    let mut filtered: Vec<&AdoptionCandidate> = candidates
        .iter()
        .filter(|c| c.deletion_timestamp.is_none())
        .filter(|c| matches!(c.controller_kind.as_deref(), None | Some("SandboxWarmPool")))
        .collect();

    filtered.sort_by(|a, b| {
        b.ready
            .cmp(&a.ready)
            .then_with(|| a.creation_timestamp.cmp(&b.creation_timestamp))
    });

    filtered.into_iter().next()
}

/// The label selector used to list adoption candidates: pods left behind by
/// any WarmPool backing this Template.
pub fn adoption_candidate_selector(template_name: &str) -> String {
    labels::selector(labels::SANDBOX_TEMPLATE_REF_HASH, &name_hash(template_name))
}

/// Labels to remove and add on the chosen Pod during the hand-off write
/// (§4.4 step d, "Hand-off write"). Owner references are cleared separately
/// by the caller (they are not plain labels).
pub struct HandoffLabelChange {
    pub remove: Vec<&'static str>,
    pub add: Vec<(String, String)>,
}

pub fn handoff_label_change(claim_name: &str, claim_uid: &str) -> HandoffLabelChange {
    HandoffLabelChange {
        remove: vec![labels::POOL, labels::SANDBOX_TEMPLATE_REF_HASH],
        add: vec![
            (labels::SANDBOX_NAME_HASH.to_string(), name_hash(claim_name)),
            (labels::CLAIM_UID.to_string(), claim_uid.to_string()),
        ],
    }
}

/// The reason/status a Claim's `Ready` condition should report, per §4.4
/// step e. `sandbox_ready` is `None` when no Sandbox exists yet to mirror.
pub enum ClaimStatusInput<'a> {
    ReconcilerError(&'a str),
    Expired,
    NoTemplateNoSandbox,
    SandboxExpired,
    MirrorSandbox { sandbox_ready: &'a Condition },
}

pub fn compute_claim_ready(input: ClaimStatusInput<'_>, observed_generation: Option<i64>) -> Condition {
    match input {
        ClaimStatusInput::ReconcilerError(message) => {
            conditions::ready_condition(false, reasons::RECONCILER_ERROR, message, observed_generation)
        }
        ClaimStatusInput::Expired => conditions::ready_condition(
            false,
            reasons::CLAIM_EXPIRED,
            "shutdownTime has passed",
            observed_generation,
        ),
        ClaimStatusInput::NoTemplateNoSandbox => conditions::ready_condition(
            false,
            reasons::TEMPLATE_NOT_FOUND,
            "sandboxTemplateRef does not resolve to an existing SandboxTemplate",
            observed_generation,
        ),
        ClaimStatusInput::SandboxExpired => conditions::ready_condition(
            false,
            reasons::SANDBOX_EXPIRED,
            "the fulfilled sandbox has expired",
            observed_generation,
        ),
        ClaimStatusInput::MirrorSandbox { sandbox_ready } => conditions::ready_condition(
            sandbox_ready.status == "True",
            &sandbox_ready.reason,
            sandbox_ready.message.clone(),
            observed_generation,
        ),
    }
}
