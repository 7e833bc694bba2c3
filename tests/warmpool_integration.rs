mod common;

use chrono::Utc;
use sandbox_operator::hash::name_hash;
use sandbox_operator::warmpool::{self, PodView, ScaleDecision};

// ══════════════════════════════════════════════════════════════════
// WarmPool reconcile-decision integration tests (no cluster required)
//
// Exercises §4.3: partitioning observed pods by ownership, adopting
// orphans, and the scale-to-replicas decision -- including the
// lock-free replenishment story that follows a Claim's hand-off write
// (§4.3 "Key rationale" / §4.4 adoption).
// ══════════════════════════════════════════════════════════════════

fn pod_view(name: &str, kind: Option<&str>, uid: Option<&str>, ready: bool, age_secs: i64) -> PodView {
    PodView {
        name: name.to_string(),
        controller_uid: uid.map(str::to_string),
        controller_kind: kind.map(str::to_string),
        deletion_timestamp: None,
        ready,
        creation_timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
    }
}

/// Pool integrity invariant: with two owned, Ready pool pods and
/// spec.replicas=2, the pool is steady -- no create, no delete.
#[test]
fn pool_at_desired_replicas_is_steady() {
    let pods = vec![
        pod_view("pool-a-1", Some("SandboxWarmPool"), Some("pool-uid"), true, 30),
        pod_view("pool-a-2", Some("SandboxWarmPool"), Some("pool-uid"), true, 30),
    ];
    let partition = warmpool::partition(&pods, "pool-uid");
    assert_eq!(partition.owned.len(), 2);
    assert_eq!(warmpool::scale_decision(partition.owned.len() as i32, 2), ScaleDecision::Steady);
}

/// Adoption atomicity (§8): once a Claim clears a pod's pool label and
/// owner-reference, that pod no longer matches the pool's selector and
/// therefore never appears in the listed pods the WarmPool partitions --
/// it just silently drops out of `owned`, which is exactly what triggers
/// replenishment. This test models the "before" and "after" list.
#[test]
fn adoption_handoff_drops_owned_count_and_triggers_replenishment() {
    let before = vec![
        pod_view("pool-a-1", Some("SandboxWarmPool"), Some("pool-uid"), true, 30),
        pod_view("pool-a-2", Some("SandboxWarmPool"), Some("pool-uid"), true, 30),
    ];
    let before_partition = warmpool::partition(&before, "pool-uid");
    assert_eq!(before_partition.owned.len(), 2);
    assert_eq!(warmpool::scale_decision(2, 2), ScaleDecision::Steady);

    // After hand-off, pool-a-1 has been re-labeled by the Claim controller
    // and no longer carries the pool selector label -- simulated here by
    // simply removing it from the listed set the WarmPool controller would
    // observe on its next reconcile.
    let after = vec![pod_view("pool-a-2", Some("SandboxWarmPool"), Some("pool-uid"), true, 30)];
    let after_partition = warmpool::partition(&after, "pool-uid");
    assert_eq!(after_partition.owned.len(), 1);
    assert_eq!(warmpool::scale_decision(1, 2), ScaleDecision::CreateCount(1));
}

#[test]
fn orphaned_pods_are_adopted_and_foreign_pods_are_ignored() {
    let pods = vec![
        pod_view("orphan", None, None, true, 5),
        pod_view("foreign", Some("ReplicaSet"), Some("rs-uid"), true, 5),
    ];
    let partition = warmpool::partition(&pods, "pool-uid");
    assert_eq!(partition.orphaned, vec!["orphan".to_string()]);
    assert_eq!(partition.foreign, vec!["foreign".to_string()]);
    assert!(partition.owned.is_empty());
}

#[test]
fn scale_down_prefers_deleting_not_ready_pods_first() {
    let owned = vec![
        pod_view("ready-old", Some("SandboxWarmPool"), Some("u"), true, 500),
        pod_view("not-ready-new", Some("SandboxWarmPool"), Some("u"), false, 5),
    ];
    let victims = warmpool::choose_deletion_candidates(&owned, 1);
    assert_eq!(victims, vec!["not-ready-new".to_string()]);
}

#[test]
fn pool_labels_are_derived_from_pool_and_template_name_hashes() {
    let labels = warmpool::pool_labels("agent-pool", "agent-template");
    assert_eq!(labels[0].1, name_hash("agent-pool"));
    assert_eq!(labels[1].1, name_hash("agent-template"));
}
