mod common;

use chrono::Utc;
use common::seconds_ago;
use sandbox_operator::conditions::{self, reasons};
use sandbox_operator::crd::{SandboxSpec, SandboxVolumeClaimTemplate};
use sandbox_operator::hash::name_hash;
use sandbox_operator::sandbox;

// ══════════════════════════════════════════════════════════════════
// Sandbox reconcile-decision integration tests (no cluster required)
//
// Exercises the full §4.1 decision pipeline: spec + observed children
// → expiry → pod/service desired-state → status condition, for the
// three end-to-end scenarios in spec.md §8.
// ══════════════════════════════════════════════════════════════════

fn spec(replicas: Option<i32>, shutdown_time: Option<chrono::DateTime<Utc>>) -> SandboxSpec {
    SandboxSpec {
        pod_template: Default::default(),
        replicas,
        volume_claim_templates: None,
        shutdown_time: shutdown_time.map(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time),
    }
}

/// Scenario 1: a freshly created Sandbox with a single pause container.
/// Both Pod and Service are desired, and once both are observed ready the
/// Ready condition reports DependenciesReady with the expected FQDN and
/// label selector.
#[test]
fn scenario_simple_sandbox_converges_to_ready() {
    let s = spec(None, None);
    let expiry = sandbox::evaluate_expiry(None, Utc::now());
    assert_eq!(expiry, sandbox::Expiry::Unset);

    assert!(sandbox::pod_desired(&s, false));

    let observed = sandbox::ObservedChildren {
        pod_desired: true,
        pod_exists: true,
        pod_ready: true,
        service_exists: true,
    };
    let computed = sandbox::compute_status(false, &observed, Some(1));
    assert_eq!(computed.ready.status, "True");
    assert_eq!(computed.ready.reason, reasons::DEPENDENCIES_READY);
    assert_eq!(computed.ready.observed_generation, Some(1));
    assert_eq!(computed.replicas, 1);

    assert_eq!(
        sandbox::service_fqdn("s", "default", "cluster.local"),
        "s.default.svc.cluster.local"
    );
    assert_eq!(
        sandbox::selector("s"),
        format!("agents.x-k8s.io/sandbox-name-hash={}", name_hash("s"))
    );
}

/// Scenario 2: replicas 1 -> 0. The Pod is no longer desired; the Service
/// remains desired (not expired); status.replicas reports 0 and Ready stays
/// true on a Service-only basis per spec.md §8.
#[test]
fn scenario_replicas_zero_drops_pod_keeps_service() {
    let s = spec(Some(0), None);
    assert!(!sandbox::pod_desired(&s, false));

    let observed = sandbox::ObservedChildren {
        pod_desired: false,
        pod_exists: false,
        pod_ready: false,
        service_exists: true,
    };
    let computed = sandbox::compute_status(false, &observed, Some(2));
    assert_eq!(computed.replicas, 0);
    // Service-only is acceptable per spec.md §8 scenario 2: Ready stays True
    // when no pod is desired and the service exists.
    assert_eq!(computed.ready.status, "True");
    assert_eq!(computed.ready.reason, reasons::DEPENDENCIES_READY);
    assert!(computed.ready.message.contains("no pod desired"));
}

/// Scenario 3: past shutdownTime. Pod and Service are no longer desired;
/// Ready is False with reason SandboxExpired, and this persists on repeat
/// reconciles (shutdown idempotence law in spec.md §8).
#[test]
fn scenario_shutdown_marks_expired_and_is_idempotent() {
    let past = seconds_ago(10);
    let expiry = sandbox::evaluate_expiry(Some(&past), Utc::now());
    assert_eq!(expiry, sandbox::Expiry::Expired);

    let s = spec(None, Some(past));
    assert!(!sandbox::pod_desired(&s, true));

    let observed = sandbox::ObservedChildren {
        pod_desired: false,
        pod_exists: false,
        pod_ready: false,
        service_exists: false,
    };
    for _ in 0..3 {
        let computed = sandbox::compute_status(true, &observed, Some(1));
        assert_eq!(computed.ready.status, "False");
        assert_eq!(computed.ready.reason, reasons::SANDBOX_EXPIRED);
        assert_eq!(computed.replicas, 0);
    }
}

#[test]
fn pvc_name_derivation_matches_template_and_sandbox_name() {
    let template = SandboxVolumeClaimTemplate {
        name: "workspace".to_string(),
        spec: Default::default(),
    };
    assert_eq!(sandbox::pvc_name(&template, "agent-7"), "workspace-agent-7");
}

/// Label integrity invariant (spec.md §8): the sandbox-name-hash label on a
/// Sandbox's Pod equals NameHash(sandbox.name), and the condition merge
/// helper preserves lastTransitionTime across a reason-only status change.
#[test]
fn label_integrity_and_condition_merge_are_stable_under_repeat_reconciles() {
    let labels = sandbox::child_labels(None, "very-long-lived-sandbox-name");
    assert_eq!(
        labels.get("agents.x-k8s.io/sandbox-name-hash"),
        Some(&name_hash("very-long-lived-sandbox-name"))
    );

    let mut conditions = Vec::new();
    let first = sandbox::compute_status(
        false,
        &sandbox::ObservedChildren {
            pod_desired: true,
            pod_exists: true,
            pod_ready: true,
            service_exists: true,
        },
        Some(1),
    )
    .ready;
    conditions::set_condition(&mut conditions, first.clone());

    let second = sandbox::compute_status(
        false,
        &sandbox::ObservedChildren {
            pod_desired: true,
            pod_exists: true,
            pod_ready: true,
            service_exists: true,
        },
        Some(2),
    )
    .ready;
    conditions::set_condition(&mut conditions, second);

    let stored = conditions::find(&conditions, conditions::READY).unwrap();
    assert_eq!(stored.last_transition_time, first.last_transition_time);
    assert_eq!(conditions.len(), 1);
}
