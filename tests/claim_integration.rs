mod common;

use chrono::Utc;
use common::seconds_ago;
use sandbox_operator::claim::{self, AdoptionCandidate, ClaimStatusInput, ExpiryAction, SandboxDisposition};
use sandbox_operator::conditions::{self, reasons};
use sandbox_operator::crd::ShutdownPolicy;
use sandbox_operator::hash::name_hash;
use sandbox_operator::labels;

// ══════════════════════════════════════════════════════════════════
// Claim reconcile-decision integration tests (no cluster required)
//
// Exercises §4.4: expiry/policy branching, template-present Sandbox
// get-or-create disposition, pod-adoption candidate selection and the
// hand-off label diff, and status mirroring, for spec.md §8 scenarios 4-6.
// ══════════════════════════════════════════════════════════════════

fn candidate(name: &str, ready: bool, age_secs: i64, owner: Option<&str>) -> AdoptionCandidate {
    AdoptionCandidate {
        name: name.to_string(),
        ready,
        creation_timestamp: seconds_ago(age_secs),
        deletion_timestamp: None,
        controller_kind: owner.map(str::to_string),
    }
}

/// Scenario 4: cold-start claim. No WarmPool exists, so no adoption
/// candidates are found; the claim creates a fresh Sandbox from the
/// Template with automountServiceAccountToken forced false.
#[test]
fn scenario_cold_start_claim_creates_sandbox_from_template() {
    assert_eq!(
        claim::expiry_action(false, ShutdownPolicy::Retain),
        ExpiryAction::RunActiveReconcile
    );
    assert_eq!(
        claim::sandbox_disposition(false, false, true),
        SandboxDisposition::CreateFromTemplate
    );
    assert!(claim::select_adoption_candidate(&[]).is_none());
    assert!(!claim::effective_automount_service_account_token(None));

    let labels = claim::new_sandbox_pod_labels("claim-uid-1");
    assert_eq!(labels[0], (labels::CLAIM_UID.to_string(), "claim-uid-1".to_string()));
}

/// Scenario 5: WarmPool adoption. Two ready pool pods exist; the claim
/// picks the oldest ready one, computes the hand-off label diff (pool
/// labels removed, sandbox-name-hash + claim-uid added), and the chosen
/// pod is distinguishable from the one left behind.
#[test]
fn scenario_warm_pool_adoption_prefers_oldest_ready_candidate() {
    let candidates = vec![
        candidate("pool-pod-young", true, 5, Some("SandboxWarmPool")),
        candidate("pool-pod-old", true, 600, Some("SandboxWarmPool")),
        candidate("pool-pod-foreign", true, 900, Some("ReplicaSet")),
    ];

    let chosen = claim::select_adoption_candidate(&candidates).expect("a candidate exists");
    assert_eq!(chosen.name, "pool-pod-old");

    let change = claim::handoff_label_change("claim-a", "claim-uid-a");
    assert!(change.remove.contains(&labels::POOL));
    assert!(change.remove.contains(&labels::SANDBOX_TEMPLATE_REF_HASH));
    assert!(change
        .add
        .iter()
        .any(|(k, v)| k == labels::SANDBOX_NAME_HASH && v == &name_hash("claim-a")));
    assert!(change
        .add
        .iter()
        .any(|(k, v)| k == labels::CLAIM_UID && v == "claim-uid-a"));

    // Adoption atomicity: after hand-off the chosen pod carries neither pool
    // label key in its add-set, and the selector a WarmPool would use to
    // find its members no longer matches it (by construction of `remove`).
    assert!(!change.add.iter().any(|(k, _)| k == labels::POOL));
}

#[test]
fn scenario_warm_pool_adoption_excludes_deleting_and_unready_is_deprioritized() {
    let mut deleting = candidate("going-away", true, 1, Some("SandboxWarmPool"));
    deleting.deletion_timestamp = Some(Utc::now());
    let not_ready = candidate("not-ready", false, 1, Some("SandboxWarmPool"));

    let chosen = claim::select_adoption_candidate(&[deleting, not_ready.clone()]).unwrap();
    assert_eq!(chosen.name, "not-ready");
}

/// Scenario 6: Template with a NetworkPolicy section. The NetworkPolicy
/// name is derived from the Claim name and is independent of adoption
/// outcome; the Claim controller computes it before touching the Sandbox.
#[test]
fn scenario_network_policy_name_derivation() {
    assert_eq!(claim::network_policy_name("my-claim"), "my-claim-network-policy");
}

/// Policy semantics law: Delete self-deletes on expiry; Retain keeps the
/// Claim with reason ClaimExpired and no Sandbox.
#[test]
fn policy_semantics_delete_vs_retain_on_expiry() {
    assert_eq!(
        claim::expiry_action(true, ShutdownPolicy::Delete),
        ExpiryAction::SelfDelete
    );
    assert_eq!(
        claim::expiry_action(true, ShutdownPolicy::Retain),
        ExpiryAction::RetainAfterExpiry
    );

    let retained_status = claim::compute_claim_ready(ClaimStatusInput::Expired, Some(3));
    assert_eq!(retained_status.reason, reasons::CLAIM_EXPIRED);
    assert_eq!(retained_status.status, "False");
}

/// Trace propagation law: a Ready condition mirrored from the Sandbox is
/// carried onto the Claim verbatim (status/reason), matching §4.4 step e.
#[test]
fn claim_ready_mirrors_sandbox_ready_condition() {
    let sandbox_ready = conditions::ready_condition(true, reasons::DEPENDENCIES_READY, "ok", Some(5));
    let mirrored = claim::compute_claim_ready(
        ClaimStatusInput::MirrorSandbox {
            sandbox_ready: &sandbox_ready,
        },
        Some(5),
    );
    assert_eq!(mirrored.status, "True");
    assert_eq!(mirrored.reason, reasons::DEPENDENCIES_READY);
}

/// A Sandbox owned by someone other than this Claim is a terminal conflict,
/// never a retry target.
#[test]
fn sandbox_name_conflict_is_terminal() {
    assert_eq!(
        claim::sandbox_disposition(true, false, true),
        SandboxDisposition::Conflict
    );
}
